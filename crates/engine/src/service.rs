use std::sync::Arc;

use tracing::info;

use taskengine_core::events::{EventPublisher, NoopEventPublisher};
use taskengine_core::models::{NewTask, Task};
use taskengine_core::traits::{RunnerRegistry, TaskRepository};
use taskengine_core::{EngineError, EngineResult, RuntimeSettings};

use crate::engine::{EngineContext, TaskEngine};
use crate::provider::{DefaultTaskProvider, TaskProvider};
use crate::retry::RetryPolicy;
use crate::strategy::{DefaultExecutionStrategy, ExecutionStrategy};

/// 任务服务
///
/// 对外的统一入口：调度任务、取消未认领的任务、
/// 控制本节点引擎的启停。
pub struct TaskService {
    task_repo: Arc<dyn TaskRepository>,
    engine: TaskEngine,
    settings: RuntimeSettings,
}

impl TaskService {
    pub fn builder(
        task_repo: Arc<dyn TaskRepository>,
        registry: Arc<RunnerRegistry>,
        context: EngineContext,
    ) -> TaskServiceBuilder {
        TaskServiceBuilder::new(task_repo, registry, context)
    }

    /// 调度一个新任务，持久化为待执行且未加锁的记录
    pub async fn schedule_task(&self, task: NewTask) -> EngineResult<Task> {
        if task.runner.trim().is_empty() {
            return Err(EngineError::InvalidTask(
                "任务必须指定运行器标识".to_string(),
            ));
        }
        if task.execution_date.is_none() {
            return Err(EngineError::InvalidTask(
                "任务必须指定执行时间".to_string(),
            ));
        }

        let created = self.task_repo.create(&task).await?;
        info!(
            "调度任务 {}: 运行器 {}, 执行时间 {}",
            created.id,
            created.runner,
            created.execution_date.format("%Y-%m-%d %H:%M:%S UTC")
        );
        Ok(created)
    }

    /// 取消一个尚未被认领的任务
    ///
    /// 已认领或正在运行的任务无法保证取消，这类取消本质上
    /// 是竞态的，此处直接以TaskLocked报告冲突。
    pub async fn cancel_task(&self, id: i64) -> EngineResult<()> {
        if self.task_repo.delete_if_unlocked(id).await? {
            info!("取消任务 {}", id);
            return Ok(());
        }

        match self.task_repo.get_by_id(id).await? {
            Some(task) => Err(EngineError::TaskLocked {
                id,
                node_id: task.lock_owner_node_id.unwrap_or(-1),
            }),
            None => Err(EngineError::TaskNotFound { id }),
        }
    }

    /// 本节点的任务引擎
    pub fn engine(&self) -> &TaskEngine {
        &self.engine
    }

    pub fn max_items_to_schedule(&self) -> usize {
        self.settings.max_items_to_schedule()
    }

    pub fn exclusive_mode(&self) -> bool {
        self.settings.exclusive_mode()
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }
}

/// 任务服务构建器
pub struct TaskServiceBuilder {
    task_repo: Arc<dyn TaskRepository>,
    registry: Arc<RunnerRegistry>,
    context: EngineContext,
    settings: RuntimeSettings,
    events: Arc<dyn EventPublisher>,
    retry_policy: RetryPolicy,
    max_concurrent_tasks: usize,
    provider: Option<Arc<dyn TaskProvider>>,
    strategy: Option<Arc<dyn ExecutionStrategy>>,
}

impl TaskServiceBuilder {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        registry: Arc<RunnerRegistry>,
        context: EngineContext,
    ) -> Self {
        Self {
            task_repo,
            registry,
            context,
            settings: RuntimeSettings::new(),
            events: Arc::new(NoopEventPublisher),
            retry_policy: RetryPolicy::default(),
            max_concurrent_tasks: 8,
            provider: None,
            strategy: None,
        }
    }

    pub fn settings(mut self, settings: RuntimeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = events;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn max_concurrent_tasks(mut self, max_concurrent_tasks: usize) -> Self {
        self.max_concurrent_tasks = max_concurrent_tasks;
        self
    }

    /// 替换默认的任务提供者，测试时注入探针用
    pub fn provider(mut self, provider: Arc<dyn TaskProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// 替换默认的执行策略，测试时注入记录型策略用
    pub fn strategy(mut self, strategy: Arc<dyn ExecutionStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn build(self) -> TaskService {
        let provider = self.provider.unwrap_or_else(|| {
            Arc::new(DefaultTaskProvider::new(
                Arc::clone(&self.task_repo),
                self.settings.clone(),
            ))
        });

        let strategy = self.strategy.unwrap_or_else(|| {
            Arc::new(DefaultExecutionStrategy::new(
                Arc::clone(&self.registry),
                Arc::clone(&self.task_repo),
                self.retry_policy.clone(),
                Arc::clone(&self.events),
                self.settings.clone(),
                self.context.node_id,
            ))
        });

        let engine = TaskEngine::new(
            self.context,
            provider,
            strategy,
            self.settings.clone(),
            self.max_concurrent_tasks,
        );

        TaskService {
            task_repo: self.task_repo,
            engine,
            settings: self.settings,
        }
    }
}
