use chrono::{DateTime, Utc};

use taskengine_core::config::RetryConfig;

/// 重试策略
///
/// 纯计算：根据已重试次数给出下次执行时间，超过上限或
/// 不可重试时返回None，由finished把任务收尾为失败。
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// 计算下次重试的执行时间
    ///
    /// 指数退避加随机抖动，抖动用来避免多节点同时重试的雷群效应。
    pub fn next_execution_date(
        &self,
        current_retries: i32,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if current_retries >= max_retries {
            return None;
        }

        let base_interval = self.config.base_interval_seconds as f64;
        let multiplier = self.config.backoff_multiplier;
        let max_interval = self.config.max_interval_seconds as f64;
        let jitter_factor = self.config.jitter_factor;

        let exponential_interval = base_interval * multiplier.powi(current_retries);
        let capped_interval = exponential_interval.min(max_interval);

        let jitter = capped_interval * jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_interval = (capped_interval + jitter).max(base_interval);

        let delay = chrono::Duration::milliseconds((final_interval * 1000.0) as i64);
        Some(now + delay)
    }
}
