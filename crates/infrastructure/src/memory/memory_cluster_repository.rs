use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taskengine_core::models::ClusterNodeInfo;
use taskengine_core::traits::ClusterRepository;
use taskengine_core::EngineResult;

/// 内存集群成员仓储
pub struct MemoryClusterRepository {
    nodes: Mutex<HashMap<i32, ClusterNodeInfo>>,
    default_stale_timeout: Duration,
}

impl Default for MemoryClusterRepository {
    fn default() -> Self {
        Self::new(Duration::from_millis(90_000))
    }
}

impl MemoryClusterRepository {
    pub fn new(default_stale_timeout: Duration) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            default_stale_timeout,
        }
    }

    /// 直接改写节点心跳时间，测试模拟失联节点用
    pub fn set_heartbeat(&self, node_id: i32, at: DateTime<Utc>) {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(node) = nodes.get_mut(&node_id) {
            node.last_heartbeat = at;
        }
    }
}

#[async_trait]
impl ClusterRepository for MemoryClusterRepository {
    async fn register(&self, node: &ClusterNodeInfo) -> EngineResult<()> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn heartbeat(&self, node_id: i32, at: DateTime<Utc>) -> EngineResult<()> {
        let mut nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(node) = nodes.get_mut(&node_id) {
            node.last_heartbeat = at;
            node.active = true;
        }
        Ok(())
    }

    async fn get_node(&self, node_id: i32) -> EngineResult<Option<ClusterNodeInfo>> {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        Ok(nodes.get(&node_id).cloned())
    }

    async fn list_nodes(&self) -> EngineResult<Vec<ClusterNodeInfo>> {
        let nodes = self.nodes.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<ClusterNodeInfo> = nodes.values().cloned().collect();
        all.sort_by_key(|n| n.id);
        Ok(all)
    }

    fn default_stale_timeout(&self) -> Duration {
        self.default_stale_timeout
    }
}
