//! 数据仓储层接口定义
//!
//! 任务存储是集群中唯一的共享可变资源，所有跨节点协调都通过
//! 锁列上的原子条件更新完成，不依赖分布式锁服务或选主。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::models::{AbortedTask, ClaimRequest, ClusterNodeInfo, NewTask, Task};
use crate::EngineResult;

/// 任务仓储接口
///
/// 认领、改期、解锁都必须以条件更新实现：只有lock_owner_node_id
/// 为空的行才能被认领，保证任意时刻一个任务至多有一个持锁节点。
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 持久化新任务，初始状态为待执行且未加锁
    async fn create(&self, task: &NewTask) -> EngineResult<Task>;

    /// 根据ID获取任务
    async fn get_by_id(&self, id: i64) -> EngineResult<Option<Task>>;

    /// 无条件删除任务记录
    async fn delete(&self, id: i64) -> EngineResult<()>;

    /// 仅当任务未被认领时删除，返回是否删除成功
    ///
    /// 取消已认领任务本质上是竞态的，调用方据返回值决定报错。
    async fn delete_if_unlocked(&self, id: i64) -> EngineResult<bool>;

    /// 原子地选取并锁定到期的可调度任务
    ///
    /// 返回的任务已经把lock_owner_node_id设置为请求节点。
    /// 已过期的到期任务同样会被认领，由执行侧路由到失败路径。
    async fn claim_due_tasks(&self, claim: &ClaimRequest) -> EngineResult<Vec<Task>>;

    /// 重试改期：更新执行时间和重试次数并释放锁
    async fn reschedule(
        &self,
        id: i64,
        next_execution: DateTime<Utc>,
        retry_count: i32,
    ) -> EngineResult<()>;

    /// 释放指定节点持有的全部锁，返回释放数量
    ///
    /// 引擎启动时用于回收本节点上次崩溃遗留的锁，停止时用于
    /// 归还未完成的任务。
    async fn release_node_locks(&self, node_id: i32) -> EngineResult<u64>;

    /// 强制释放一组失联节点持有的锁，返回被中止的任务
    async fn unlock_tasks_for_nodes(&self, node_ids: &[i32]) -> EngineResult<Vec<AbortedTask>>;
}

/// 集群成员仓储接口
///
/// 节点注册自己并定期心跳；调度引擎对成员信息只读。
#[async_trait]
pub trait ClusterRepository: Send + Sync {
    /// 注册节点（同ID重复注册视为重新上线）
    async fn register(&self, node: &ClusterNodeInfo) -> EngineResult<()>;

    /// 更新节点心跳时间
    async fn heartbeat(&self, node_id: i32, at: DateTime<Utc>) -> EngineResult<()>;

    async fn get_node(&self, node_id: i32) -> EngineResult<Option<ClusterNodeInfo>>;

    async fn list_nodes(&self) -> EngineResult<Vec<ClusterNodeInfo>>;

    /// 集群服务缺省的节点失联超时
    ///
    /// 配置的失联阈值为非正数时回退到该值。
    fn default_stale_timeout(&self) -> Duration;
}
