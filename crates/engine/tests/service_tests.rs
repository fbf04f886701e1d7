//! 任务服务门面的集成测试

use std::sync::Arc;

use chrono::Utc;

use taskengine_core::models::{ClaimRequest, NewTask};
use taskengine_core::traits::{RunnerRegistry, TaskRepository};
use taskengine_core::{EngineError, RuntimeSettings};
use taskengine_core::config::keys;
use taskengine_engine::{EngineContext, TaskService};
use taskengine_infrastructure::MemoryTaskRepository;

fn build_service(repo: Arc<MemoryTaskRepository>) -> TaskService {
    TaskService::builder(
        repo,
        Arc::new(RunnerRegistry::new()),
        EngineContext {
            node_id: 0,
            node_groups: Vec::new(),
        },
    )
    .settings(RuntimeSettings::new())
    .build()
}

#[tokio::test]
async fn schedule_task_persists_pending_record() {
    let repo = Arc::new(MemoryTaskRepository::new());
    let service = build_service(Arc::clone(&repo));

    let created = service
        .schedule_task(
            NewTask::new("shell")
                .with_node_group("batch")
                .with_payload(serde_json::json!({"command": "true"})),
        )
        .await
        .unwrap();

    let stored = repo.get_by_id(created.id).await.unwrap().unwrap();
    assert_eq!(stored.runner, "shell");
    assert_eq!(stored.node_group.as_deref(), Some("batch"));
    assert_eq!(stored.retry_count, 0);
    assert!(stored.is_unlocked());
}

#[tokio::test]
async fn schedule_task_requires_runner_identifier() {
    let repo = Arc::new(MemoryTaskRepository::new());
    let service = build_service(repo);

    let err = service.schedule_task(NewTask::new("  ")).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTask(_)));
}

#[tokio::test]
async fn schedule_task_requires_execution_date() {
    let repo = Arc::new(MemoryTaskRepository::new());
    let service = build_service(repo);

    let mut task = NewTask::new("shell");
    task.execution_date = None;

    let err = service.schedule_task(task).await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidTask(_)));
}

#[tokio::test]
async fn cancel_removes_unclaimed_task() {
    let repo = Arc::new(MemoryTaskRepository::new());
    let service = build_service(Arc::clone(&repo));

    let created = service.schedule_task(NewTask::new("shell")).await.unwrap();
    service.cancel_task(created.id).await.unwrap();

    assert!(repo.get_by_id(created.id).await.unwrap().is_none());
}

#[tokio::test]
async fn cancel_claimed_task_reports_conflict() {
    let repo = Arc::new(MemoryTaskRepository::new());
    let service = build_service(Arc::clone(&repo));

    let created = service.schedule_task(NewTask::new("shell")).await.unwrap();
    repo.claim_due_tasks(&ClaimRequest {
        node_id: 5,
        node_groups: Vec::new(),
        max_items: 1,
        exclusive: false,
        now: Utc::now(),
    })
    .await
    .unwrap();

    // 已认领的任务取消不被保证，报告冲突而不是静默成功
    let err = service.cancel_task(created.id).await.unwrap_err();
    assert!(matches!(err, EngineError::TaskLocked { node_id: 5, .. }));
    assert!(repo.get_by_id(created.id).await.unwrap().is_some());
}

#[tokio::test]
async fn cancel_missing_task_reports_not_found() {
    let repo = Arc::new(MemoryTaskRepository::new());
    let service = build_service(repo);

    let err = service.cancel_task(999).await.unwrap_err();
    assert!(matches!(err, EngineError::TaskNotFound { id: 999 }));
}

#[tokio::test]
async fn configuration_accessors_read_live_settings() {
    let repo = Arc::new(MemoryTaskRepository::new());
    let settings = RuntimeSettings::new();
    let service = TaskService::builder(
        repo,
        Arc::new(RunnerRegistry::new()),
        EngineContext {
            node_id: 0,
            node_groups: Vec::new(),
        },
    )
    .settings(settings.clone())
    .build();

    assert_eq!(service.max_items_to_schedule(), 20);
    assert!(!service.exclusive_mode());

    settings.set(keys::ENGINE_MAX_ITEMS, "7");
    settings.set(keys::ENGINE_EXCLUSIVE_MODE, "true");

    assert_eq!(service.max_items_to_schedule(), 7);
    assert!(service.exclusive_mode());
}
