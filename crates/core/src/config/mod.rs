pub mod runtime;

pub use runtime::{keys, RuntimeSettings};

use std::path::Path;

use serde::{Deserialize, Serialize};

/// 应用配置
///
/// 文件配置描述部署形态（数据库、节点身份、池大小等），加载后
/// 把可热调的键灌入RuntimeSettings；之后每个调度周期都从
/// RuntimeSettings重新读取，修改无需重启。
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub unlocker: UnlockerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl AppConfig {
    /// 从可选的toml文件和TASKENGINE__前缀环境变量加载配置
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TASKENGINE")
                .separator("__")
                .try_parsing(true),
        );

        let app_config: AppConfig = builder.build()?.try_deserialize()?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.database.validate()?;
        self.node.validate()?;
        self.engine.validate()?;
        self.unlocker.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 10,
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.url.is_empty() {
            return Err(anyhow::anyhow!("数据库URL不能为空"));
        }
        if !self.url.starts_with("postgres://")
            && !self.url.starts_with("postgresql://")
            && !self.url.starts_with("sqlite:")
        {
            return Err(anyhow::anyhow!("不支持的数据库URL: {}", self.url));
        }
        if self.max_connections == 0 {
            return Err(anyhow::anyhow!("连接池大小必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// 本节点在集群中的唯一ID
    pub node_id: i32,
    /// 本节点所属的组
    pub node_groups: Vec<String>,
    pub hostname: String,
    pub heartbeat_interval_seconds: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            node_groups: Vec::new(),
            hostname: hostname::get()
                .unwrap_or_else(|_| "unknown".into())
                .to_string_lossy()
                .to_string(),
            heartbeat_interval_seconds: 30,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_id < 0 {
            return Err(anyhow::anyhow!("节点ID不能为负数"));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub active: bool,
    pub polling_interval_ms: u64,
    /// 单次轮询认领的任务数上限
    pub max_items_to_schedule: usize,
    pub exclusive_mode: bool,
    pub shutdown_wait_ms: u64,
    /// 工作池的并发上限
    pub max_concurrent_tasks: usize,
    pub max_retries: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            active: true,
            polling_interval_ms: 1000,
            max_items_to_schedule: 20,
            exclusive_mode: false,
            shutdown_wait_ms: 15000, // 最多等待15秒让在途任务完成
            max_concurrent_tasks: 8,
            max_retries: 3,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.polling_interval_ms == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }
        if self.max_items_to_schedule == 0 {
            return Err(anyhow::anyhow!("单次调度任务数上限必须大于0"));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(anyhow::anyhow!("最大并发任务数必须大于0"));
        }
        if self.max_retries < 0 {
            return Err(anyhow::anyhow!("最大重试次数不能为负数"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlockerConfig {
    pub active: bool,
    pub interval_ms: u64,
    /// 节点失联阈值（毫秒），非正数时回退到集群服务的缺省超时
    pub stale_node_interval_ms: i64,
    /// 失联截止（毫秒）：心跳早于now-cutoff的节点太旧不再处理，
    /// 非正数表示不设截止
    pub stale_node_cutoff_ms: i64,
}

impl Default for UnlockerConfig {
    fn default() -> Self {
        Self {
            active: true,
            interval_ms: 30000,
            stale_node_interval_ms: 90000,
            stale_node_cutoff_ms: 0,
        }
    }
}

impl UnlockerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.interval_ms == 0 {
            return Err(anyhow::anyhow!("解锁器检测间隔必须大于0"));
        }
        Ok(())
    }
}

/// 重试退避配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 基础重试间隔（秒）
    pub base_interval_seconds: u64,
    /// 最大重试间隔（秒）
    pub max_interval_seconds: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_interval_seconds: 60,
            max_interval_seconds: 3600,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_interval_seconds == 0 {
            return Err(anyhow::anyhow!("基础重试间隔必须大于0"));
        }
        if self.max_interval_seconds < self.base_interval_seconds {
            return Err(anyhow::anyhow!("最大重试间隔不能小于基础间隔"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数不能小于1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("抖动系数必须在0.0到1.0之间"));
        }
        Ok(())
    }
}
