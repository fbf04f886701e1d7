use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use taskengine_core::events::{EventPublisher, TaskEngineEvent};
use taskengine_core::models::{Task, TaskDisposition, TaskOutcome};
use taskengine_core::traits::{RunnerRegistry, TaskRepository};
use taskengine_core::{EngineError, EngineResult, RuntimeSettings};

use crate::retry::RetryPolicy;

/// 执行策略
///
/// 围绕每个已认领任务的策略对象：运行、错误处理、重试计算
/// 和最终收尾。finished对每个任务恰好调用一次，即使run出错
/// 也会执行，保证不会有任务因未捕获的错误而永久持锁。
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    /// 解析运行器并执行任务
    async fn run(&self, task: &Task) -> EngineResult<TaskOutcome>;

    /// 处理意外失败：决定重试还是最终失败
    async fn handle_error(&self, task: &Task, error: EngineError) -> TaskDisposition;

    /// 计算下次执行时间，None表示停止重试
    async fn handle_retry(
        &self,
        task: &Task,
        reason: &str,
        current_retries: i32,
    ) -> Option<DateTime<Utc>>;

    /// 收尾：删除记录或落实改期/失败的终态，并释放锁
    async fn finished(&self, task: &Task, disposition: TaskDisposition) -> EngineResult<()>;
}

/// 默认执行策略实现
pub struct DefaultExecutionStrategy {
    registry: Arc<RunnerRegistry>,
    task_repo: Arc<dyn TaskRepository>,
    retry_policy: RetryPolicy,
    events: Arc<dyn EventPublisher>,
    settings: RuntimeSettings,
    node_id: i32,
}

impl DefaultExecutionStrategy {
    pub fn new(
        registry: Arc<RunnerRegistry>,
        task_repo: Arc<dyn TaskRepository>,
        retry_policy: RetryPolicy,
        events: Arc<dyn EventPublisher>,
        settings: RuntimeSettings,
        node_id: i32,
    ) -> Self {
        Self {
            registry,
            task_repo,
            retry_policy,
            events,
            settings,
            node_id,
        }
    }

    /// 判断错误是否永久性失败，永久失败不进入重试
    fn is_permanent(error: &EngineError) -> bool {
        matches!(
            error,
            EngineError::TaskExpired { .. } | EngineError::UnknownRunner { .. }
        )
    }
}

#[async_trait]
impl ExecutionStrategy for DefaultExecutionStrategy {
    async fn run(&self, task: &Task) -> EngineResult<TaskOutcome> {
        let runner = self.registry.get(&task.runner)?;
        debug!("运行任务 {}: 运行器 {}", task.id, task.runner);
        runner.execute(task).await
    }

    async fn handle_error(&self, task: &Task, error: EngineError) -> TaskDisposition {
        if Self::is_permanent(&error) {
            warn!("任务 {} 永久失败: {}", task.id, error);
            return TaskDisposition::Failed {
                reason: error.to_string(),
            };
        }

        let reason = error.to_string();
        match self.handle_retry(task, &reason, task.retry_count).await {
            Some(next_execution) => TaskDisposition::Rescheduled { next_execution },
            None => {
                warn!("任务 {} 重试已耗尽: {}", task.id, reason);
                TaskDisposition::Failed { reason }
            }
        }
    }

    async fn handle_retry(
        &self,
        task: &Task,
        reason: &str,
        current_retries: i32,
    ) -> Option<DateTime<Utc>> {
        let max_retries = self.settings.max_retries();
        let next =
            self.retry_policy
                .next_execution_date(current_retries, max_retries, Utc::now());

        match &next {
            Some(at) => debug!(
                "任务 {} 第 {} 次重试改期到 {}: {}",
                task.id,
                current_retries + 1,
                at.format("%Y-%m-%d %H:%M:%S UTC"),
                reason
            ),
            None => debug!(
                "任务 {} 不再重试 (已尝试 {}/{} 次)",
                task.id, current_retries, max_retries
            ),
        }
        next
    }

    async fn finished(&self, task: &Task, disposition: TaskDisposition) -> EngineResult<()> {
        match disposition {
            TaskDisposition::Completed => {
                self.task_repo.delete(task.id).await?;
                self.events
                    .publish(TaskEngineEvent::task_completed(task.id, self.node_id))
                    .await?;
                metrics::counter!("taskengine_tasks_completed_total").increment(1);
                debug!("任务 {} 执行成功，记录已删除", task.id);
            }
            TaskDisposition::Rescheduled { next_execution } => {
                self.task_repo
                    .reschedule(task.id, next_execution, task.retry_count + 1)
                    .await?;
                metrics::counter!("taskengine_tasks_retried_total").increment(1);
                debug!("任务 {} 已改期并释放锁", task.id);
            }
            TaskDisposition::Failed { reason } => {
                self.events
                    .publish(TaskEngineEvent::task_failed(
                        task.id,
                        self.node_id,
                        reason.clone(),
                    ))
                    .await?;
                self.task_repo.delete(task.id).await?;
                metrics::counter!("taskengine_tasks_failed_total").increment(1);
                warn!("任务 {} 以失败收尾: {}", task.id, reason);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tokio::sync::RwLock as AsyncRwLock;

    use taskengine_core::config::keys;
    use taskengine_core::events::NoopEventPublisher;
    use taskengine_core::models::{AbortedTask, ClaimRequest, NewTask};
    use taskengine_core::traits::Runner;

    /// 简化的内存任务表，只为驱动finished的三种处置
    #[derive(Default)]
    struct TableRepo {
        tasks: AsyncRwLock<HashMap<i64, Task>>,
        next_id: AtomicI64,
    }

    #[async_trait]
    impl TaskRepository for TableRepo {
        async fn create(&self, task: &NewTask) -> EngineResult<Task> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let created = Task {
                id,
                node_id: task.node_id,
                node_group: task.node_group.clone(),
                execution_date: task.execution_date.unwrap(),
                expiration_date: task.expiration_date,
                runner: task.runner.clone(),
                payload: task.payload.clone(),
                retry_count: 0,
                lock_owner_node_id: Some(0),
                locked_at: Some(Utc::now()),
                created_at: Utc::now(),
            };
            self.tasks.write().await.insert(id, created.clone());
            Ok(created)
        }
        async fn get_by_id(&self, id: i64) -> EngineResult<Option<Task>> {
            Ok(self.tasks.read().await.get(&id).cloned())
        }
        async fn delete(&self, id: i64) -> EngineResult<()> {
            self.tasks
                .write()
                .await
                .remove(&id)
                .map(|_| ())
                .ok_or(taskengine_core::EngineError::TaskNotFound { id })
        }
        async fn delete_if_unlocked(&self, _id: i64) -> EngineResult<bool> {
            Ok(false)
        }
        async fn claim_due_tasks(&self, _claim: &ClaimRequest) -> EngineResult<Vec<Task>> {
            Ok(Vec::new())
        }
        async fn reschedule(
            &self,
            id: i64,
            next_execution: DateTime<Utc>,
            retry_count: i32,
        ) -> EngineResult<()> {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(&id)
                .ok_or(taskengine_core::EngineError::TaskNotFound { id })?;
            task.execution_date = next_execution;
            task.retry_count = retry_count;
            task.lock_owner_node_id = None;
            task.locked_at = None;
            Ok(())
        }
        async fn release_node_locks(&self, _node_id: i32) -> EngineResult<u64> {
            Ok(0)
        }
        async fn unlock_tasks_for_nodes(
            &self,
            _node_ids: &[i32],
        ) -> EngineResult<Vec<AbortedTask>> {
            Ok(Vec::new())
        }
    }

    struct StubRunner(TaskOutcome);

    #[async_trait]
    impl Runner for StubRunner {
        fn name(&self) -> &str {
            "stub"
        }
        async fn execute(&self, _task: &Task) -> EngineResult<TaskOutcome> {
            Ok(self.0.clone())
        }
    }

    fn strategy_with(repo: Arc<TableRepo>, outcome: TaskOutcome) -> DefaultExecutionStrategy {
        let mut registry = RunnerRegistry::new();
        registry.register(Arc::new(StubRunner(outcome)));

        let settings = RuntimeSettings::new();
        settings.set(keys::ENGINE_MAX_RETRIES, "2");

        DefaultExecutionStrategy::new(
            Arc::new(registry),
            repo,
            crate::retry::RetryPolicy::default(),
            Arc::new(NoopEventPublisher),
            settings,
            0,
        )
    }

    async fn seeded_task(repo: &TableRepo) -> Task {
        repo.create(&NewTask::new("stub")).await.unwrap()
    }

    #[tokio::test]
    async fn run_resolves_runner_through_registry() {
        let repo = Arc::new(TableRepo::default());
        let strategy = strategy_with(Arc::clone(&repo), TaskOutcome::Success);
        let task = seeded_task(&repo).await;

        assert_eq!(strategy.run(&task).await.unwrap(), TaskOutcome::Success);
    }

    #[tokio::test]
    async fn run_fails_fast_on_unknown_runner() {
        let repo = Arc::new(TableRepo::default());
        let strategy = strategy_with(Arc::clone(&repo), TaskOutcome::Success);

        let mut task = seeded_task(&repo).await;
        task.runner = "missing".to_string();

        assert!(matches!(
            strategy.run(&task).await,
            Err(EngineError::UnknownRunner { .. })
        ));
    }

    #[tokio::test]
    async fn handle_error_reschedules_transient_failures() {
        let repo = Arc::new(TableRepo::default());
        let strategy = strategy_with(Arc::clone(&repo), TaskOutcome::Success);
        let task = seeded_task(&repo).await;

        let disposition = strategy
            .handle_error(&task, EngineError::Execution("临时故障".to_string()))
            .await;
        assert!(matches!(disposition, TaskDisposition::Rescheduled { .. }));
    }

    #[tokio::test]
    async fn handle_error_never_retries_expired_tasks() {
        let repo = Arc::new(TableRepo::default());
        let strategy = strategy_with(Arc::clone(&repo), TaskOutcome::Success);
        let task = seeded_task(&repo).await;

        let disposition = strategy
            .handle_error(&task, EngineError::TaskExpired { id: task.id })
            .await;
        assert!(matches!(disposition, TaskDisposition::Failed { .. }));
    }

    #[tokio::test]
    async fn handle_error_fails_after_retries_exhausted() {
        let repo = Arc::new(TableRepo::default());
        let strategy = strategy_with(Arc::clone(&repo), TaskOutcome::Success);

        let mut task = seeded_task(&repo).await;
        task.retry_count = 2; // 已达到max_retries

        let disposition = strategy
            .handle_error(&task, EngineError::Execution("临时故障".to_string()))
            .await;
        assert!(matches!(disposition, TaskDisposition::Failed { .. }));
    }

    #[tokio::test]
    async fn finished_deletes_completed_tasks() {
        let repo = Arc::new(TableRepo::default());
        let strategy = strategy_with(Arc::clone(&repo), TaskOutcome::Success);
        let task = seeded_task(&repo).await;

        strategy
            .finished(&task, TaskDisposition::Completed)
            .await
            .unwrap();
        assert!(repo.get_by_id(task.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn finished_reschedules_and_releases_lock() {
        let repo = Arc::new(TableRepo::default());
        let strategy = strategy_with(Arc::clone(&repo), TaskOutcome::Success);
        let task = seeded_task(&repo).await;

        let next = Utc::now() + chrono::Duration::minutes(2);
        strategy
            .finished(&task, TaskDisposition::Rescheduled { next_execution: next })
            .await
            .unwrap();

        let stored = repo.get_by_id(task.id).await.unwrap().unwrap();
        assert!(stored.is_unlocked());
        assert_eq!(stored.retry_count, task.retry_count + 1);
        assert_eq!(stored.execution_date, next);
    }

    #[tokio::test]
    async fn finished_removes_failed_tasks() {
        let repo = Arc::new(TableRepo::default());
        let strategy = strategy_with(Arc::clone(&repo), TaskOutcome::Success);
        let task = seeded_task(&repo).await;

        strategy
            .finished(
                &task,
                TaskDisposition::Failed {
                    reason: "不可恢复".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(repo.get_by_id(task.id).await.unwrap().is_none());
    }
}
