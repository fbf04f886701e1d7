use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 持久化的任务记录
///
/// 任务是一个延迟执行的工作单元，由任意节点调度写入存储，
/// 并由集群中满足亲和性约束的某一个节点认领执行。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    /// 节点约束：设置后只有该节点可以执行
    pub node_id: Option<i32>,
    /// 节点组约束：设置后只有属于该组的节点可以执行
    pub node_group: Option<String>,
    /// 最早可执行时间
    pub execution_date: DateTime<Utc>,
    /// 过期时间：认领时已过期的任务直接走失败路径，不会被执行
    pub expiration_date: Option<DateTime<Utc>>,
    /// 运行器标识，通过注册表解析为具体实现
    pub runner: String,
    /// 传递给运行器的上下文数据
    pub payload: serde_json::Value,
    /// 已尝试的次数
    pub retry_count: i32,
    /// 当前持有锁的节点，未认领时为None
    pub lock_owner_node_id: Option<i32>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// 判断任务在给定时刻是否已过期
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_date.is_some_and(|expires| expires <= now)
    }

    /// 判断任务是否未被任何节点认领
    pub fn is_unlocked(&self) -> bool {
        self.lock_owner_node_id.is_none()
    }

    /// 判断任务是否带有节点或节点组约束
    pub fn is_assigned(&self) -> bool {
        self.node_id.is_some() || self.node_group.is_some()
    }

    /// 判断给定节点是否满足任务的亲和性约束
    ///
    /// node_id和node_group是相互独立的过滤条件，两者都满足时任务才可被执行；
    /// 两者都未设置的任务可以被任意节点执行。
    pub fn matches_node(&self, node_id: i32, node_groups: &[String]) -> bool {
        let node_ok = self.node_id.is_none() || self.node_id == Some(node_id);
        let group_ok = match &self.node_group {
            None => true,
            Some(group) => node_groups.iter().any(|g| g == group),
        };
        node_ok && group_ok
    }
}

/// 待调度的新任务
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub node_id: Option<i32>,
    pub node_group: Option<String>,
    pub execution_date: Option<DateTime<Utc>>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub runner: String,
    pub payload: serde_json::Value,
}

impl NewTask {
    pub fn new(runner: impl Into<String>) -> Self {
        Self {
            runner: runner.into(),
            execution_date: Some(Utc::now()),
            payload: serde_json::Value::Null,
            ..Default::default()
        }
    }

    pub fn with_node_id(mut self, node_id: i32) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn with_node_group(mut self, group: impl Into<String>) -> Self {
        self.node_group = Some(group.into());
        self
    }

    pub fn with_execution_date(mut self, at: DateTime<Utc>) -> Self {
        self.execution_date = Some(at);
        self
    }

    pub fn with_expiration_date(mut self, at: DateTime<Utc>) -> Self {
        self.expiration_date = Some(at);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// 运行器执行结果
///
/// 重试语义通过返回值表达而不是异常控制流，
/// RetryLater表示瞬时失败，由重试策略决定下次执行时间。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskOutcome {
    Success,
    RetryLater { reason: String },
    Failed { message: String },
}

/// 任务生命周期的最终处置
///
/// finished对每个被认领的任务恰好调用一次，处置决定记录的去向：
/// 成功删除、重试改期、或标记失败后移除。
#[derive(Debug, Clone, PartialEq)]
pub enum TaskDisposition {
    Completed,
    Rescheduled { next_execution: DateTime<Utc> },
    Failed { reason: String },
}

/// 任务认领请求
///
/// 认领是整个引擎的核心正确性所在：选取和加锁必须是单次原子的
/// 条件更新，lock_owner_node_id只在当前为空时才会被设置。
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub node_id: i32,
    pub node_groups: Vec<String>,
    pub max_items: usize,
    /// 独占模式下只认领显式约束到本节点或本节点组的任务，
    /// 未分配的任务不会被任何节点认领
    pub exclusive: bool,
    pub now: DateTime<Utc>,
}

/// 被强制解锁的任务，用于崩溃中止事件
#[derive(Debug, Clone, PartialEq)]
pub struct AbortedTask {
    pub task_id: i64,
    pub node_id: i32,
}
