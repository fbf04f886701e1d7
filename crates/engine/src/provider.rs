use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};

use taskengine_core::models::{ClaimRequest, Task};
use taskengine_core::traits::TaskRepository;
use taskengine_core::{EngineResult, RuntimeSettings};

use crate::engine::EngineRunningState;

/// 一次调度查询的参数
///
/// 每个轮询周期由引擎根据当前运行期设置重新组装，
/// 独占模式等开关因此可以在运行中切换。
#[derive(Debug, Clone)]
pub struct EngineParameters {
    pub node_id: i32,
    pub node_groups: Vec<String>,
    pub exclusive_mode: bool,
}

/// 可调度任务提供者
///
/// 负责替引擎选取并锁定到期任务，并承担引擎生命周期
/// 前后的锁簿记（回收本节点遗留的锁等）。
#[async_trait]
pub trait TaskProvider: Send + Sync {
    /// 原子地选取并锁定最多max_items个可调度任务
    async fn get_tasks_to_schedule(
        &self,
        params: &EngineParameters,
        max_items: usize,
    ) -> EngineResult<Vec<Task>>;

    /// 根据运行状态计算本轮的批量上限（背压）
    fn max_items_to_schedule(&self, state: &EngineRunningState) -> usize;

    /// 引擎启动前调用：回收本节点上次崩溃遗留的锁
    async fn before_engine_start(&self, node_id: i32) -> EngineResult<()>;

    /// 引擎停止后调用：归还本节点仍持有的锁
    async fn after_engine_stop(&self, node_id: i32) -> EngineResult<()>;

    /// 任务生命周期结束后的簿记钩子
    async fn after_task_finished(&self, task_id: i64) -> EngineResult<()>;

    /// 任务锁被释放（改期归还）后的簿记钩子
    async fn after_task_unlocked(&self, task_id: i64) -> EngineResult<()>;
}

/// 默认的任务提供者实现
pub struct DefaultTaskProvider {
    task_repo: Arc<dyn TaskRepository>,
    settings: RuntimeSettings,
}

impl DefaultTaskProvider {
    pub fn new(task_repo: Arc<dyn TaskRepository>, settings: RuntimeSettings) -> Self {
        Self {
            task_repo,
            settings,
        }
    }
}

#[async_trait]
impl TaskProvider for DefaultTaskProvider {
    async fn get_tasks_to_schedule(
        &self,
        params: &EngineParameters,
        max_items: usize,
    ) -> EngineResult<Vec<Task>> {
        let claim = ClaimRequest {
            node_id: params.node_id,
            node_groups: params.node_groups.clone(),
            max_items,
            exclusive: params.exclusive_mode,
            now: Utc::now(),
        };

        self.task_repo.claim_due_tasks(&claim).await
    }

    fn max_items_to_schedule(&self, state: &EngineRunningState) -> usize {
        // 批量受配置上限约束，同时被工作池剩余容量压缩，
        // 池接近满载时少认领，避免持锁任务在本地排队
        let configured = self.settings.max_items_to_schedule();
        let capacity = state.max_concurrent.saturating_sub(state.in_flight);
        configured.min(capacity)
    }

    async fn before_engine_start(&self, node_id: i32) -> EngineResult<()> {
        let released = self.task_repo.release_node_locks(node_id).await?;
        if released > 0 {
            info!(
                "节点 {} 启动前回收了 {} 个遗留的任务锁",
                node_id, released
            );
        }
        Ok(())
    }

    async fn after_engine_stop(&self, node_id: i32) -> EngineResult<()> {
        let released = self.task_repo.release_node_locks(node_id).await?;
        if released > 0 {
            info!("节点 {} 停止后归还了 {} 个任务锁", node_id, released);
        }
        Ok(())
    }

    async fn after_task_finished(&self, task_id: i64) -> EngineResult<()> {
        debug!("任务 {} 生命周期结束", task_id);
        Ok(())
    }

    async fn after_task_unlocked(&self, task_id: i64) -> EngineResult<()> {
        debug!("任务 {} 的锁已释放", task_id);
        Ok(())
    }
}
