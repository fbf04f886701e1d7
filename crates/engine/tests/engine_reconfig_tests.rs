//! 引擎热配置与生命周期的集成测试

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;

use common::{build_node_service, fast_settings, CountdownLatch, RecordingStrategy, SpyProvider};
use taskengine_core::config::keys;
use taskengine_core::models::{ClaimRequest, NewTask};
use taskengine_core::traits::{RunnerRegistry, TaskRepository};
use taskengine_core::RuntimeSettings;
use taskengine_engine::{
    DefaultTaskProvider, EngineContext, EngineState, TaskService,
};
use taskengine_infrastructure::MemoryTaskRepository;

fn spy_service(
    repo: Arc<MemoryTaskRepository>,
    settings: RuntimeSettings,
) -> (TaskService, Arc<SpyProvider>) {
    let provider = SpyProvider::new(Arc::new(DefaultTaskProvider::new(
        Arc::clone(&repo) as Arc<dyn TaskRepository>,
        settings.clone(),
    )));

    let service = TaskService::builder(
        repo,
        Arc::new(RunnerRegistry::new()),
        EngineContext {
            node_id: 0,
            node_groups: Vec::new(),
        },
    )
    .settings(settings)
    .provider(Arc::clone(&provider) as Arc<dyn taskengine_engine::TaskProvider>)
    .build();

    (service, provider)
}

#[tokio::test]
async fn polling_interval_change_takes_effect_without_restart() {
    let repo = Arc::new(MemoryTaskRepository::new());
    let settings = RuntimeSettings::new();
    settings.set(keys::ENGINE_POLLING_INTERVAL_MS, "40");
    settings.set(keys::ENGINE_SHUTDOWN_WAIT_MS, "1000");

    let (service, provider) = spy_service(repo, settings.clone());
    service.engine().start().await.unwrap();

    // 先按40ms的节奏跑一段
    sleep(Duration::from_millis(500)).await;
    let marks_before = provider.marks().len();
    assert!(marks_before >= 5, "初始间隔下轮询次数过少: {marks_before}");

    // 运行中把间隔调大，下个周期即生效
    settings.set(keys::ENGINE_POLLING_INTERVAL_MS, "200");
    sleep(Duration::from_millis(1100)).await;

    service.engine().stop().await.unwrap();

    let intervals = provider.intervals();
    assert!(!intervals.is_empty());

    let fast_cycles = intervals
        .iter()
        .filter(|d| d.as_millis() < 120)
        .count();
    let slow_cycles = intervals
        .iter()
        .filter(|d| d.as_millis() >= 150)
        .count();

    // 两种节奏都被观察到：前段聚在40ms附近，后段聚在200ms附近
    assert!(fast_cycles >= 3, "未观察到初始节奏, 间隔: {intervals:?}");
    assert!(slow_cycles >= 2, "未观察到调大后的节奏, 间隔: {intervals:?}");
}

#[tokio::test]
async fn engine_inactive_flag_suspends_polling() {
    let repo = Arc::new(MemoryTaskRepository::new());
    let settings = RuntimeSettings::new();
    settings.set(keys::ENGINE_POLLING_INTERVAL_MS, "25");
    settings.set(keys::ENGINE_ACTIVE, "false");
    settings.set(keys::ENGINE_SHUTDOWN_WAIT_MS, "1000");

    let (service, provider) = spy_service(repo, settings.clone());
    service.engine().start().await.unwrap();

    sleep(Duration::from_millis(200)).await;
    assert!(provider.marks().is_empty(), "未激活时不应发起调度查询");

    // 运行中打开开关，轮询随即恢复
    settings.set(keys::ENGINE_ACTIVE, "true");
    sleep(Duration::from_millis(200)).await;
    assert!(!provider.marks().is_empty());

    service.engine().stop().await.unwrap();
}

#[tokio::test]
async fn engine_start_is_idempotent() {
    let repo = Arc::new(MemoryTaskRepository::new());
    let (service, _provider) = spy_service(repo, fast_settings());

    service.engine().start().await.unwrap();
    assert!(service.engine().is_running().await);

    // 重复启动是幂等的
    service.engine().start().await.unwrap();
    assert!(service.engine().is_running().await);

    service.engine().stop().await.unwrap();
    assert!(!service.engine().is_running().await);
    assert_eq!(service.engine().state().await, EngineState::Stopped);

    // 停止后可以重新启动
    service.engine().start().await.unwrap();
    assert!(service.engine().is_running().await);
    service.engine().stop().await.unwrap();
}

#[tokio::test]
async fn engine_start_reclaims_locks_left_by_previous_crash() {
    let repo = Arc::new(MemoryTaskRepository::new());
    let task = repo.create(&NewTask::new("runner")).await.unwrap();

    // 模拟本节点上次崩溃遗留的锁
    repo.claim_due_tasks(&ClaimRequest {
        node_id: 0,
        node_groups: Vec::new(),
        max_items: 10,
        exclusive: false,
        now: Utc::now(),
    })
    .await
    .unwrap();
    assert!(!repo.get_by_id(task.id).await.unwrap().unwrap().is_unlocked());

    // 引擎保持未激活，启动钩子仍应回收锁
    let settings = fast_settings();
    settings.set(keys::ENGINE_ACTIVE, "false");
    let (service, _provider) = spy_service(Arc::clone(&repo), settings);

    service.engine().start().await.unwrap();
    assert!(repo.get_by_id(task.id).await.unwrap().unwrap().is_unlocked());

    service.engine().stop().await.unwrap();
}

#[tokio::test]
async fn engine_stop_releases_remaining_locks() {
    let repo = Arc::new(MemoryTaskRepository::new());

    // 一个永远不会被执行的未来任务，外加一个被手工锁住的任务
    let locked = repo.create(&NewTask::new("runner")).await.unwrap();

    let settings = fast_settings();
    settings.set(keys::ENGINE_ACTIVE, "false");
    let (service, _provider) = spy_service(Arc::clone(&repo), settings);
    service.engine().start().await.unwrap();

    repo.claim_due_tasks(&ClaimRequest {
        node_id: 0,
        node_groups: Vec::new(),
        max_items: 10,
        exclusive: false,
        now: Utc::now(),
    })
    .await
    .unwrap();
    assert!(!repo.get_by_id(locked.id).await.unwrap().unwrap().is_unlocked());

    service.engine().stop().await.unwrap();

    // 停止后锁被归还，其他节点可以接手
    assert!(repo.get_by_id(locked.id).await.unwrap().unwrap().is_unlocked());
}

#[tokio::test]
async fn backpressure_limits_claim_batch_to_pool_capacity() {
    let repo = Arc::new(MemoryTaskRepository::new());

    let mut relevant = Vec::new();
    for _ in 0..10 {
        relevant.push(repo.create(&NewTask::new("runner")).await.unwrap().id);
    }

    let latch = CountdownLatch::new(relevant.len());
    let deletion_latch = CountdownLatch::new(relevant.len());
    let strategy = RecordingStrategy::new(
        Arc::clone(&repo),
        &relevant,
        Arc::clone(&latch),
        Arc::clone(&deletion_latch),
    );

    // 并发上限4，批量上限20：每轮认领不超过池剩余容量，
    // 但所有任务最终都会被执行完
    let service = build_node_service(
        Arc::clone(&repo),
        strategy,
        0,
        &[],
        fast_settings(),
    );

    service.engine().start().await.unwrap();
    assert!(latch.wait(Duration::from_secs(10)).await);
    assert!(deletion_latch.wait(Duration::from_secs(10)).await);
    assert_eq!(repo.count().await, 0);
    service.engine().stop().await.unwrap();
}
