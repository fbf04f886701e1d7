//! 热加载的运行期设置
//!
//! 引擎和解锁器的间隔、批量大小、开关等参数每个周期都重新读取，
//! 不在启动时缓存，调整后在下一个周期生效而无需重启进程。

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::AppConfig;

/// 运行期设置键
pub mod keys {
    pub const ENGINE_ACTIVE: &str = "task.engine.active";
    pub const ENGINE_POLLING_INTERVAL_MS: &str = "task.engine.polling.interval.ms";
    pub const ENGINE_MAX_ITEMS: &str = "task.engine.max.items";
    pub const ENGINE_EXCLUSIVE_MODE: &str = "task.engine.exclusive.mode";
    pub const ENGINE_SHUTDOWN_WAIT_MS: &str = "task.engine.shutdown.wait.ms";
    pub const ENGINE_MAX_RETRIES: &str = "task.engine.max.retries";
    pub const UNLOCKER_ACTIVE: &str = "task.unlocker.active";
    pub const UNLOCKER_INTERVAL_MS: &str = "task.unlocker.interval.ms";
    pub const UNLOCKER_STALE_NODE_INTERVAL_MS: &str = "task.unlocker.stale.node.interval.ms";
    pub const UNLOCKER_STALE_NODE_CUTOFF_MS: &str = "task.unlocker.stale.node.cutoff.ms";
}

/// 运行期设置持有者
///
/// 读写都很轻量，克隆后共享同一份底层存储。
#[derive(Debug, Clone, Default)]
pub struct RuntimeSettings {
    values: Arc<RwLock<HashMap<String, String>>>,
}

impl RuntimeSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用文件配置中可热调的键初始化设置
    pub fn seeded_from(config: &AppConfig) -> Self {
        let settings = Self::new();
        settings.set(keys::ENGINE_ACTIVE, config.engine.active.to_string());
        settings.set(
            keys::ENGINE_POLLING_INTERVAL_MS,
            config.engine.polling_interval_ms.to_string(),
        );
        settings.set(
            keys::ENGINE_MAX_ITEMS,
            config.engine.max_items_to_schedule.to_string(),
        );
        settings.set(
            keys::ENGINE_EXCLUSIVE_MODE,
            config.engine.exclusive_mode.to_string(),
        );
        settings.set(
            keys::ENGINE_SHUTDOWN_WAIT_MS,
            config.engine.shutdown_wait_ms.to_string(),
        );
        settings.set(
            keys::ENGINE_MAX_RETRIES,
            config.engine.max_retries.to_string(),
        );
        settings.set(keys::UNLOCKER_ACTIVE, config.unlocker.active.to_string());
        settings.set(
            keys::UNLOCKER_INTERVAL_MS,
            config.unlocker.interval_ms.to_string(),
        );
        settings.set(
            keys::UNLOCKER_STALE_NODE_INTERVAL_MS,
            config.unlocker.stale_node_interval_ms.to_string(),
        );
        settings.set(
            keys::UNLOCKER_STALE_NODE_CUTOFF_MS,
            config.unlocker.stale_node_cutoff_ms.to_string(),
        );
        settings
    }

    pub fn set(&self, key: &str, value: impl Into<String>) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values.get(key).cloned()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn get_usize(&self, key: &str, default: usize) -> usize {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    // 引擎侧的类型化访问器

    pub fn engine_active(&self) -> bool {
        self.get_bool(keys::ENGINE_ACTIVE, true)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.get_u64(keys::ENGINE_POLLING_INTERVAL_MS, 1000))
    }

    pub fn max_items_to_schedule(&self) -> usize {
        self.get_usize(keys::ENGINE_MAX_ITEMS, 20)
    }

    pub fn exclusive_mode(&self) -> bool {
        self.get_bool(keys::ENGINE_EXCLUSIVE_MODE, false)
    }

    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_millis(self.get_u64(keys::ENGINE_SHUTDOWN_WAIT_MS, 15000))
    }

    pub fn max_retries(&self) -> i32 {
        self.get_i64(keys::ENGINE_MAX_RETRIES, 3) as i32
    }

    // 解锁器侧的类型化访问器

    pub fn unlocker_active(&self) -> bool {
        self.get_bool(keys::UNLOCKER_ACTIVE, true)
    }

    pub fn unlocker_interval(&self) -> Duration {
        Duration::from_millis(self.get_u64(keys::UNLOCKER_INTERVAL_MS, 30000))
    }

    pub fn stale_node_interval_ms(&self) -> i64 {
        self.get_i64(keys::UNLOCKER_STALE_NODE_INTERVAL_MS, 90000)
    }

    pub fn stale_node_cutoff_ms(&self) -> i64 {
        self.get_i64(keys::UNLOCKER_STALE_NODE_CUTOFF_MS, 0)
    }
}
