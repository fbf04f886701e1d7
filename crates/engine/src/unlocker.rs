use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use taskengine_core::events::{EventPublisher, TaskEngineEvent};
use taskengine_core::models::AbortedTask;
use taskengine_core::traits::{ClusterRepository, TaskRepository};
use taskengine_core::{EngineResult, RuntimeSettings};

/// 失联节点解锁器
///
/// 独立于引擎节奏运行的后台监视器：周期性找出心跳停更的节点，
/// 强制释放它们持有的任务锁并对每个被中止的任务发布一次
/// 崩溃中止事件。开关和间隔每个周期重新读取，运行中可调。
///
/// 误判一个实际存活的节点是安全的：最坏情况是任务被重复执行，
/// 下游的幂等运行器需要容忍这一点。
pub struct StaleNodeUnlocker {
    core: Arc<UnlockerCore>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct UnlockerCore {
    task_repo: Arc<dyn TaskRepository>,
    cluster_repo: Arc<dyn ClusterRepository>,
    events: Arc<dyn EventPublisher>,
    settings: RuntimeSettings,
    running: RwLock<bool>,
    shutdown_tx: RwLock<Option<watch::Sender<bool>>>,
}

impl StaleNodeUnlocker {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        cluster_repo: Arc<dyn ClusterRepository>,
        events: Arc<dyn EventPublisher>,
        settings: RuntimeSettings,
    ) -> Self {
        Self {
            core: Arc::new(UnlockerCore {
                task_repo,
                cluster_repo,
                events,
                settings,
                running: RwLock::new(false),
                shutdown_tx: RwLock::new(None),
            }),
            handle: Mutex::new(None),
        }
    }

    /// 节点失联阈值
    ///
    /// 配置为正数时按配置使用，否则回退到集群服务的缺省超时。
    pub fn stale_node_threshold_interval(&self) -> Duration {
        self.core.stale_node_threshold_interval()
    }

    /// 失联判定时间点：心跳早于该时间的节点视为失联
    pub fn stale_node_ts_threshold(
        now: DateTime<Utc>,
        threshold_interval: Duration,
    ) -> DateTime<Utc> {
        UnlockerCore::stale_node_ts_threshold(now, threshold_interval)
    }

    /// 失联截止时间点
    ///
    /// 心跳早于截止的节点太旧不再处理；配置为非正数时退化到
    /// 纪元起点，即不设截止。
    pub fn stale_node_ts_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.core.stale_node_ts_cutoff(now)
    }

    /// 执行一轮失联检测和解锁，返回被中止的任务
    pub async fn run_cycle(&self) -> EngineResult<Vec<AbortedTask>> {
        self.core.run_cycle().await
    }

    /// 启动后台检测循环
    pub async fn start(&self) -> EngineResult<()> {
        {
            let mut running = self.core.running.write().await;
            if *running {
                return Ok(());
            }
            *running = true;
        }

        info!("启动失联节点解锁器");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut tx = self.core.shutdown_tx.write().await;
            *tx = Some(shutdown_tx);
        }

        let core = Arc::clone(&self.core);
        let handle = tokio::spawn(async move {
            core.detection_loop(shutdown_rx).await;
        });
        {
            let mut guard = self.handle.lock().await;
            *guard = Some(handle);
        }
        Ok(())
    }

    /// 停止后台检测循环
    pub async fn stop(&self) -> EngineResult<()> {
        {
            let mut running = self.core.running.write().await;
            if !*running {
                return Ok(());
            }
            *running = false;
        }

        if let Some(tx) = self.core.shutdown_tx.write().await.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.lock().await.take() {
            if let Err(e) = handle.await {
                error!("解锁器循环异常退出: {}", e);
            }
        }

        info!("失联节点解锁器已停止");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        *self.core.running.read().await
    }
}

impl UnlockerCore {
    fn stale_node_threshold_interval(&self) -> Duration {
        let configured_ms = self.settings.stale_node_interval_ms();
        if configured_ms > 0 {
            Duration::from_millis(configured_ms as u64)
        } else {
            self.cluster_repo.default_stale_timeout()
        }
    }

    fn stale_node_ts_threshold(
        now: DateTime<Utc>,
        threshold_interval: Duration,
    ) -> DateTime<Utc> {
        now - chrono::Duration::from_std(threshold_interval)
            .unwrap_or_else(|_| chrono::Duration::seconds(90))
    }

    fn stale_node_ts_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let cutoff_ms = self.settings.stale_node_cutoff_ms();
        if cutoff_ms > 0 {
            now - chrono::Duration::milliseconds(cutoff_ms)
        } else {
            DateTime::<Utc>::UNIX_EPOCH
        }
    }

    async fn run_cycle(&self) -> EngineResult<Vec<AbortedTask>> {
        let now = Utc::now();
        let threshold_interval = self.stale_node_threshold_interval();
        let threshold = Self::stale_node_ts_threshold(now, threshold_interval);
        let cutoff = self.stale_node_ts_cutoff(now);

        let nodes = self.cluster_repo.list_nodes().await?;
        let stale_node_ids: Vec<i32> = nodes
            .iter()
            .filter(|n| n.last_heartbeat < threshold && n.last_heartbeat >= cutoff)
            .map(|n| n.id)
            .collect();

        if stale_node_ids.is_empty() {
            debug!("本轮未发现失联节点");
            return Ok(Vec::new());
        }

        warn!(
            "检测到 {} 个失联节点: {:?} (阈值 {:?})",
            stale_node_ids.len(),
            stale_node_ids,
            threshold_interval
        );

        let aborted = self.task_repo.unlock_tasks_for_nodes(&stale_node_ids).await?;

        // 每个被中止的任务恰好发布一次崩溃中止事件
        for item in &aborted {
            info!(
                "强制释放任务 {} 的锁 (原持有节点 {})",
                item.task_id, item.node_id
            );
            self.events
                .publish(TaskEngineEvent::crash_aborted(item.task_id, item.node_id))
                .await?;
        }

        if !aborted.is_empty() {
            metrics::counter!("taskengine_crash_aborts_total").increment(aborted.len() as u64);
        }
        Ok(aborted)
    }

    async fn detection_loop(&self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            // 间隔每个周期重新读取，不在启动时缓存
            let interval = self.settings.unlocker_interval();
            tokio::select! {
                _ = sleep(interval) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
            }

            // 未激活时不做任何检测，但保持循环存活以便随时打开
            if !self.settings.unlocker_active() {
                continue;
            }

            if let Err(e) = self.run_cycle().await {
                error!("失联节点检测失败: {}", e);
            }
        }

        debug!("失联节点检测循环退出");
    }
}
