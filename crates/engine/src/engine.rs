use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use taskengine_core::models::{Task, TaskDisposition};
use taskengine_core::{EngineError, EngineResult, RuntimeSettings};

use crate::provider::{EngineParameters, TaskProvider};
use crate::strategy::ExecutionStrategy;

/// 引擎运行所需的节点上下文
///
/// 显式传入而不是依赖任何线程局部状态。
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub node_id: i32,
    pub node_groups: Vec<String>,
}

/// 引擎状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// 工作池的即时运行状态，用于批量背压计算
#[derive(Debug, Clone)]
pub struct EngineRunningState {
    pub in_flight: usize,
    pub max_concurrent: usize,
}

/// 任务引擎
///
/// 每个节点一个实例：按可热调的间隔轮询任务提供者，
/// 把认领到的任务派发到有界工作池执行。
pub struct TaskEngine {
    core: Arc<EngineCore>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct EngineCore {
    context: EngineContext,
    provider: Arc<dyn TaskProvider>,
    strategy: Arc<dyn ExecutionStrategy>,
    settings: RuntimeSettings,
    state: RwLock<EngineState>,
    shutdown_tx: RwLock<Option<watch::Sender<bool>>>,
    worker_permits: Arc<Semaphore>,
    max_concurrent: usize,
    in_flight: Arc<AtomicUsize>,
}

impl TaskEngine {
    pub fn new(
        context: EngineContext,
        provider: Arc<dyn TaskProvider>,
        strategy: Arc<dyn ExecutionStrategy>,
        settings: RuntimeSettings,
        max_concurrent: usize,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            core: Arc::new(EngineCore {
                context,
                provider,
                strategy,
                settings,
                state: RwLock::new(EngineState::Stopped),
                shutdown_tx: RwLock::new(None),
                worker_permits: Arc::new(Semaphore::new(max_concurrent)),
                max_concurrent,
                in_flight: Arc::new(AtomicUsize::new(0)),
            }),
            handle: Mutex::new(None),
        }
    }

    /// 启动引擎，已在运行时为幂等操作
    pub async fn start(&self) -> EngineResult<()> {
        {
            let mut state = self.core.state.write().await;
            match *state {
                EngineState::Starting | EngineState::Running => {
                    debug!("任务引擎已在运行，忽略重复启动");
                    return Ok(());
                }
                EngineState::Stopping => {
                    return Err(EngineError::Internal(
                        "任务引擎正在停止，无法启动".to_string(),
                    ));
                }
                EngineState::Stopped => *state = EngineState::Starting,
            }
        }

        info!("启动任务引擎: 节点 {}", self.core.context.node_id);

        // 回收上次崩溃遗留的锁
        if let Err(e) = self
            .core
            .provider
            .before_engine_start(self.core.context.node_id)
            .await
        {
            let mut state = self.core.state.write().await;
            *state = EngineState::Stopped;
            return Err(e);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut tx = self.core.shutdown_tx.write().await;
            *tx = Some(shutdown_tx);
        }

        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            EngineCore::poll_loop(core, shutdown_rx).await;
        });
        {
            let mut guard = self.handle.lock().await;
            *guard = Some(handle);
        }

        let mut state = self.core.state.write().await;
        *state = EngineState::Running;
        info!("任务引擎启动完成: 节点 {}", self.core.context.node_id);
        Ok(())
    }

    /// 停止引擎
    ///
    /// 在有界的等待时间内让在途任务执行完，然后释放本节点
    /// 仍持有的锁，让其他节点可以接手未完成的任务。
    pub async fn stop(&self) -> EngineResult<()> {
        {
            let mut state = self.core.state.write().await;
            match *state {
                EngineState::Stopped | EngineState::Stopping => return Ok(()),
                _ => *state = EngineState::Stopping,
            }
        }

        info!("停止任务引擎: 节点 {}", self.core.context.node_id);

        if let Some(tx) = self.core.shutdown_tx.write().await.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("轮询循环异常退出: {}", e);
            }
        }

        // 有界等待在途任务
        let deadline = Instant::now() + self.core.settings.shutdown_wait();
        while self.core.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            debug!(
                "等待 {} 个在途任务完成...",
                self.core.in_flight.load(Ordering::SeqCst)
            );
            sleep(Duration::from_millis(50)).await;
        }
        let leftover = self.core.in_flight.load(Ordering::SeqCst);
        if leftover > 0 {
            warn!("停止等待超时，仍有 {} 个任务在执行", leftover);
        }

        // 归还本节点的锁，未完成的任务可被其他节点重新认领
        self.core
            .provider
            .after_engine_stop(self.core.context.node_id)
            .await?;

        let mut state = self.core.state.write().await;
        *state = EngineState::Stopped;
        info!("任务引擎已停止: 节点 {}", self.core.context.node_id);
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.core.state.read().await, EngineState::Running)
    }

    pub async fn state(&self) -> EngineState {
        *self.core.state.read().await
    }

    /// 当前在途的任务数量
    pub fn in_flight(&self) -> usize {
        self.core.in_flight.load(Ordering::SeqCst)
    }
}

impl EngineCore {
    fn running_state(&self) -> EngineRunningState {
        EngineRunningState {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            max_concurrent: self.max_concurrent,
        }
    }

    async fn poll_loop(core: Arc<EngineCore>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            "任务引擎轮询循环开始: 节点 {}, 并发上限 {}",
            core.context.node_id, core.max_concurrent
        );

        loop {
            // 间隔每个周期都重新读取，调整后下个周期即生效
            let interval = core.settings.polling_interval();
            tokio::select! {
                _ = sleep(interval) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if !core.settings.engine_active() {
                continue;
            }

            if let Err(e) = Self::poll_once(&core).await {
                metrics::counter!("taskengine_poll_errors_total").increment(1);
                warn!("轮询周期失败: {}", e);
            }
        }

        info!("任务引擎轮询循环退出: 节点 {}", core.context.node_id);
    }

    async fn poll_once(core: &Arc<EngineCore>) -> EngineResult<()> {
        let max_items = core.provider.max_items_to_schedule(&core.running_state());
        if max_items == 0 {
            return Ok(());
        }

        let params = EngineParameters {
            node_id: core.context.node_id,
            node_groups: core.context.node_groups.clone(),
            exclusive_mode: core.settings.exclusive_mode(),
        };

        // 存储不可用时只记录，下个周期自然重试
        let tasks = match core.provider.get_tasks_to_schedule(&params, max_items).await {
            Ok(tasks) => tasks,
            Err(e) if e.is_transient() => {
                warn!("任务存储暂不可用，本轮跳过: {}", e);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if tasks.is_empty() {
            return Ok(());
        }

        debug!(
            "节点 {} 本轮认领了 {} 个任务",
            core.context.node_id,
            tasks.len()
        );
        metrics::counter!("taskengine_tasks_claimed_total").increment(tasks.len() as u64);

        for task in tasks {
            let permit = match Arc::clone(&core.worker_permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            core.in_flight.fetch_add(1, Ordering::SeqCst);

            let core = Arc::clone(core);
            tokio::spawn(async move {
                Self::execute_claimed(&core, task).await;
                core.in_flight.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }

        Ok(())
    }

    /// 执行单个已认领的任务
    ///
    /// 无论执行路径如何，finished恰好被调用一次。
    async fn execute_claimed(core: &Arc<EngineCore>, task: Task) {
        let task_id = task.id;
        let disposition = Self::dispose(core, &task).await;
        let rescheduled = matches!(disposition, TaskDisposition::Rescheduled { .. });

        if let Err(e) = core.strategy.finished(&task, disposition).await {
            error!("任务 {} 收尾失败: {}", task_id, e);
        }

        if rescheduled {
            if let Err(e) = core.provider.after_task_unlocked(task_id).await {
                debug!("任务 {} 解锁钩子失败: {}", task_id, e);
            }
        }
        if let Err(e) = core.provider.after_task_finished(task_id).await {
            debug!("任务 {} 收尾钩子失败: {}", task_id, e);
        }
    }

    async fn dispose(core: &Arc<EngineCore>, task: &Task) -> TaskDisposition {
        let now = Utc::now();

        // 认领时已过期的任务直接走失败路径，不会调用运行器
        if task.is_expired(now) {
            return core
                .strategy
                .handle_error(task, EngineError::TaskExpired { id: task.id })
                .await;
        }

        match core.strategy.run(task).await {
            Ok(taskengine_core::models::TaskOutcome::Success) => TaskDisposition::Completed,
            Ok(taskengine_core::models::TaskOutcome::RetryLater { reason }) => {
                match core
                    .strategy
                    .handle_retry(task, &reason, task.retry_count)
                    .await
                {
                    Some(next_execution) => TaskDisposition::Rescheduled { next_execution },
                    None => TaskDisposition::Failed {
                        reason: format!("重试已耗尽: {reason}"),
                    },
                }
            }
            Ok(taskengine_core::models::TaskOutcome::Failed { message }) => {
                core.strategy
                    .handle_error(task, EngineError::Execution(message))
                    .await
            }
            Err(e) => core.strategy.handle_error(task, e).await,
        }
    }
}
