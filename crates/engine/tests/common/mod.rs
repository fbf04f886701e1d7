//! 集成测试公共设施
//!
//! 单进程内用共享的内存仓储模拟多节点集群，
//! 记录型策略负责统计执行/失败集合并实现删除闩锁。

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::{sleep, Instant};

use taskengine_core::config::keys;
use taskengine_core::models::{Task, TaskDisposition, TaskOutcome};
use taskengine_core::traits::{RunnerRegistry, TaskRepository};
use taskengine_core::{EngineError, EngineResult, RuntimeSettings};
use taskengine_engine::{
    EngineContext, EngineParameters, EngineRunningState, TaskProvider, TaskService,
};
use taskengine_infrastructure::MemoryTaskRepository;

/// 倒数闩锁，等待一组异步事件全部发生
pub struct CountdownLatch {
    remaining: AtomicUsize,
}

impl CountdownLatch {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(count),
        })
    }

    pub fn count_down(&self) {
        let mut current = self.remaining.load(Ordering::SeqCst);
        while current > 0 {
            match self.remaining.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::SeqCst)
    }

    pub async fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.remaining.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

/// 记录型执行策略
///
/// 只统计relevant集合内的任务，run记入执行集合，
/// handle_error记入失败集合，finished删除记录并倒数删除闩锁。
pub struct RecordingStrategy {
    task_repo: Arc<MemoryTaskRepository>,
    relevant: HashSet<i64>,
    outcome: TaskOutcome,
    executed: Mutex<Vec<i64>>,
    failed: Mutex<Vec<i64>>,
    latch: Arc<CountdownLatch>,
    deletion_latch: Arc<CountdownLatch>,
}

impl RecordingStrategy {
    pub fn new(
        task_repo: Arc<MemoryTaskRepository>,
        relevant: &[i64],
        latch: Arc<CountdownLatch>,
        deletion_latch: Arc<CountdownLatch>,
    ) -> Arc<Self> {
        Self::with_outcome(
            task_repo,
            relevant,
            TaskOutcome::Success,
            latch,
            deletion_latch,
        )
    }

    pub fn with_outcome(
        task_repo: Arc<MemoryTaskRepository>,
        relevant: &[i64],
        outcome: TaskOutcome,
        latch: Arc<CountdownLatch>,
        deletion_latch: Arc<CountdownLatch>,
    ) -> Arc<Self> {
        Arc::new(Self {
            task_repo,
            relevant: relevant.iter().copied().collect(),
            outcome,
            executed: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
            latch,
            deletion_latch,
        })
    }

    pub fn executed_tasks(&self) -> Vec<i64> {
        self.executed.lock().unwrap().clone()
    }

    pub fn failed_tasks(&self) -> Vec<i64> {
        self.failed.lock().unwrap().clone()
    }
}

#[async_trait]
impl taskengine_engine::ExecutionStrategy for RecordingStrategy {
    async fn run(&self, task: &Task) -> EngineResult<TaskOutcome> {
        if self.relevant.contains(&task.id) {
            self.executed.lock().unwrap().push(task.id);
            self.latch.count_down();
        }
        Ok(self.outcome.clone())
    }

    async fn handle_error(&self, task: &Task, _error: EngineError) -> TaskDisposition {
        if self.relevant.contains(&task.id) {
            self.failed.lock().unwrap().push(task.id);
            self.latch.count_down();
        }
        TaskDisposition::Failed {
            reason: "测试失败路径".to_string(),
        }
    }

    async fn handle_retry(
        &self,
        _task: &Task,
        _reason: &str,
        _current_retries: i32,
    ) -> Option<DateTime<Utc>> {
        None
    }

    async fn finished(&self, task: &Task, _disposition: TaskDisposition) -> EngineResult<()> {
        self.task_repo.delete(task.id).await?;
        self.deletion_latch.count_down();
        Ok(())
    }
}

/// 调度快、批量充足的测试设置
pub fn fast_settings() -> RuntimeSettings {
    let settings = RuntimeSettings::new();
    settings.set(keys::ENGINE_POLLING_INTERVAL_MS, "25");
    settings.set(keys::ENGINE_MAX_ITEMS, "20");
    settings.set(keys::ENGINE_SHUTDOWN_WAIT_MS, "3000");
    settings
}

/// 组装一个模拟节点的任务服务
pub fn build_node_service(
    task_repo: Arc<MemoryTaskRepository>,
    strategy: Arc<RecordingStrategy>,
    node_id: i32,
    node_groups: &[&str],
    settings: RuntimeSettings,
) -> TaskService {
    let context = EngineContext {
        node_id,
        node_groups: node_groups.iter().map(|g| g.to_string()).collect(),
    };

    TaskService::builder(task_repo, Arc::new(RunnerRegistry::new()), context)
        .settings(settings)
        .strategy(strategy)
        .max_concurrent_tasks(4)
        .build()
}

/// 探针式任务提供者，记录每次调度查询的时间点
pub struct SpyProvider {
    inner: Arc<dyn TaskProvider>,
    marks: Mutex<Vec<Instant>>,
}

impl SpyProvider {
    pub fn new(inner: Arc<dyn TaskProvider>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            marks: Mutex::new(Vec::new()),
        })
    }

    pub fn marks(&self) -> Vec<Instant> {
        self.marks.lock().unwrap().clone()
    }

    /// 相邻两次调度查询之间的间隔
    pub fn intervals(&self) -> Vec<Duration> {
        let marks = self.marks();
        marks.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[async_trait]
impl TaskProvider for SpyProvider {
    async fn get_tasks_to_schedule(
        &self,
        params: &EngineParameters,
        max_items: usize,
    ) -> EngineResult<Vec<Task>> {
        self.marks.lock().unwrap().push(Instant::now());
        self.inner.get_tasks_to_schedule(params, max_items).await
    }

    fn max_items_to_schedule(&self, state: &EngineRunningState) -> usize {
        self.inner.max_items_to_schedule(state)
    }

    async fn before_engine_start(&self, node_id: i32) -> EngineResult<()> {
        self.inner.before_engine_start(node_id).await
    }

    async fn after_engine_stop(&self, node_id: i32) -> EngineResult<()> {
        self.inner.after_engine_stop(node_id).await
    }

    async fn after_task_finished(&self, task_id: i64) -> EngineResult<()> {
        self.inner.after_task_finished(task_id).await
    }

    async fn after_task_unlocked(&self, task_id: i64) -> EngineResult<()> {
        self.inner.after_task_unlocked(task_id).await
    }
}
