//! 引擎领域事件
//!
//! 事件用于向外部监听方（审计、告警）暴露任务生命周期中
//! 可观察的节点间行为，尤其是崩溃中止。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::EngineResult;

/// 任务引擎事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TaskEngineEvent {
    /// 任务执行成功并被删除
    TaskCompleted {
        id: Uuid,
        task_id: i64,
        node_id: i32,
        occurred_at: DateTime<Utc>,
    },
    /// 任务最终失败（过期、重试耗尽或不可恢复错误）
    TaskFailed {
        id: Uuid,
        task_id: i64,
        node_id: i32,
        reason: String,
        occurred_at: DateTime<Utc>,
    },
    /// 持锁节点被判定失联，锁被强制释放
    ///
    /// 每个被中止的任务恰好发布一次。
    TaskCrashAborted {
        id: Uuid,
        task_id: i64,
        node_id: i32,
        occurred_at: DateTime<Utc>,
    },
}

impl TaskEngineEvent {
    pub fn task_completed(task_id: i64, node_id: i32) -> Self {
        TaskEngineEvent::TaskCompleted {
            id: Uuid::new_v4(),
            task_id,
            node_id,
            occurred_at: Utc::now(),
        }
    }

    pub fn task_failed(task_id: i64, node_id: i32, reason: impl Into<String>) -> Self {
        TaskEngineEvent::TaskFailed {
            id: Uuid::new_v4(),
            task_id,
            node_id,
            reason: reason.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn crash_aborted(task_id: i64, node_id: i32) -> Self {
        TaskEngineEvent::TaskCrashAborted {
            id: Uuid::new_v4(),
            task_id,
            node_id,
            occurred_at: Utc::now(),
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            TaskEngineEvent::TaskCompleted { .. } => "task.completed",
            TaskEngineEvent::TaskFailed { .. } => "task.failed",
            TaskEngineEvent::TaskCrashAborted { .. } => "task.crash_aborted",
        }
    }

    pub fn task_id(&self) -> i64 {
        match self {
            TaskEngineEvent::TaskCompleted { task_id, .. }
            | TaskEngineEvent::TaskFailed { task_id, .. }
            | TaskEngineEvent::TaskCrashAborted { task_id, .. } => *task_id,
        }
    }
}

/// 事件发布接口
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: TaskEngineEvent) -> EngineResult<()>;
}

/// 丢弃所有事件的发布器，用于不需要事件流的场合
#[derive(Debug, Default, Clone)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _event: TaskEngineEvent) -> EngineResult<()> {
        Ok(())
    }
}
