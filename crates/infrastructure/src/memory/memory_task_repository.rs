use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use taskengine_core::models::{AbortedTask, ClaimRequest, NewTask, Task};
use taskengine_core::traits::TaskRepository;
use taskengine_core::{EngineError, EngineResult};

/// 内存任务仓储
///
/// 写锁内完成选取加锁，与数据库实现的条件更新等价。
#[derive(Default)]
pub struct MemoryTaskRepository {
    tasks: RwLock<HashMap<i64, Task>>,
    next_id: AtomicI64,
}

impl MemoryTaskRepository {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// 当前所有任务的快照，测试用
    pub async fn snapshot(&self) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by_key(|t| t.id);
        all
    }

    /// 仍然存在的任务数量，测试用
    pub async fn count(&self) -> usize {
        self.tasks.read().await.len()
    }
}

#[async_trait]
impl TaskRepository for MemoryTaskRepository {
    async fn create(&self, task: &NewTask) -> EngineResult<Task> {
        let execution_date = task
            .execution_date
            .ok_or_else(|| EngineError::InvalidTask("任务缺少执行时间".to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let created = Task {
            id,
            node_id: task.node_id,
            node_group: task.node_group.clone(),
            execution_date,
            expiration_date: task.expiration_date,
            runner: task.runner.clone(),
            payload: task.payload.clone(),
            retry_count: 0,
            lock_owner_node_id: None,
            locked_at: None,
            created_at: Utc::now(),
        };

        let mut tasks = self.tasks.write().await;
        tasks.insert(id, created.clone());
        Ok(created)
    }

    async fn get_by_id(&self, id: i64) -> EngineResult<Option<Task>> {
        let tasks = self.tasks.read().await;
        Ok(tasks.get(&id).cloned())
    }

    async fn delete(&self, id: i64) -> EngineResult<()> {
        let mut tasks = self.tasks.write().await;
        tasks
            .remove(&id)
            .map(|_| ())
            .ok_or(EngineError::TaskNotFound { id })
    }

    async fn delete_if_unlocked(&self, id: i64) -> EngineResult<bool> {
        let mut tasks = self.tasks.write().await;
        match tasks.get(&id) {
            Some(task) if task.is_unlocked() => {
                tasks.remove(&id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_due_tasks(&self, claim: &ClaimRequest) -> EngineResult<Vec<Task>> {
        let mut tasks = self.tasks.write().await;

        let mut candidates: Vec<i64> = tasks
            .values()
            .filter(|t| t.is_unlocked() && t.execution_date <= claim.now)
            .filter(|t| t.matches_node(claim.node_id, &claim.node_groups))
            .filter(|t| !claim.exclusive || t.is_assigned())
            .map(|t| t.id)
            .collect();
        candidates.sort_by_key(|id| {
            let t = &tasks[id];
            (t.execution_date, t.id)
        });

        let mut claimed = Vec::new();
        for id in candidates.into_iter().take(claim.max_items) {
            if let Some(task) = tasks.get_mut(&id) {
                task.lock_owner_node_id = Some(claim.node_id);
                task.locked_at = Some(claim.now);
                claimed.push(task.clone());
            }
        }
        Ok(claimed)
    }

    async fn reschedule(
        &self,
        id: i64,
        next_execution: DateTime<Utc>,
        retry_count: i32,
    ) -> EngineResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks.get_mut(&id).ok_or(EngineError::TaskNotFound { id })?;
        task.execution_date = next_execution;
        task.retry_count = retry_count;
        task.lock_owner_node_id = None;
        task.locked_at = None;
        Ok(())
    }

    async fn release_node_locks(&self, node_id: i32) -> EngineResult<u64> {
        let mut tasks = self.tasks.write().await;
        let mut released = 0;
        for task in tasks.values_mut() {
            if task.lock_owner_node_id == Some(node_id) {
                task.lock_owner_node_id = None;
                task.locked_at = None;
                released += 1;
            }
        }
        Ok(released)
    }

    async fn unlock_tasks_for_nodes(&self, node_ids: &[i32]) -> EngineResult<Vec<AbortedTask>> {
        let mut tasks = self.tasks.write().await;
        let mut aborted = Vec::new();
        for task in tasks.values_mut() {
            if let Some(owner) = task.lock_owner_node_id {
                if node_ids.contains(&owner) {
                    task.lock_owner_node_id = None;
                    task.locked_at = None;
                    aborted.push(AbortedTask {
                        task_id: task.id,
                        node_id: owner,
                    });
                }
            }
        }
        aborted.sort_by_key(|a| a.task_id);
        Ok(aborted)
    }
}
