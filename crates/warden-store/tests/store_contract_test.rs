//! Behavioral contract checks shared by every [`TaskStore`] backend.
//!
//! Each check takes the store through the trait object, so the same
//! scenario runs against the in-memory backend (always) and the
//! PostgreSQL backend (ignored by default; needs Docker or
//! `WARDEN_TEST_PG_URL` -- run with `cargo test -- --ignored`).

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use warden_store::models::{
    ErrorTag, RetryConfig, ScheduleConfig, Task, TaskKind, TaskPriority, TaskStatus,
};
use warden_store::{ScanOrder, StoreError, TaskStore, TransitionFields};
use warden_test_utils::ScratchStore;

fn sample_task() -> Task {
    let mut task = Task::new(TaskKind::EvidenceCollection, TaskPriority::High, "tenant-a");
    task.submitted_by = "ops".to_owned();
    task.payload = serde_json::json!({"control_id": "CC6.1", "platform": "aws"});
    task.schedule = Some(ScheduleConfig::custom());
    task.retry_policy = Some(RetryConfig::default());
    task
}

// ---------------------------------------------------------------------------
// Shared checks
// ---------------------------------------------------------------------------

async fn check_insert_get_roundtrip(store: Arc<dyn TaskStore>, backend: &str) {
    let task = sample_task();
    let id = task.id;
    store.insert(task.clone()).await.unwrap();

    let loaded = store
        .get(id)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("[{backend}] task should exist"));
    assert_eq!(loaded.kind, TaskKind::EvidenceCollection);
    assert_eq!(loaded.payload, task.payload, "[{backend}] payload");
    assert_eq!(loaded.schedule, task.schedule, "[{backend}] schedule");
    assert_eq!(loaded.retry_policy, task.retry_policy, "[{backend}] retry policy");

    let err = store.insert(task).await.unwrap_err();
    assert!(
        matches!(err, StoreError::Duplicate(other) if other == id),
        "[{backend}] duplicate ids must be rejected"
    );
}

async fn check_pop_due_ordering(store: Arc<dyn TaskStore>, backend: &str) {
    let now = Utc::now();

    let mut low = sample_task();
    low.priority = TaskPriority::Background;
    let mut high_first = sample_task();
    high_first.priority = TaskPriority::High;
    let mut high_second = sample_task();
    high_second.priority = TaskPriority::High;

    for t in [&low, &high_first, &high_second] {
        store.insert(t.clone()).await.unwrap();
        store.enqueue(t.id, t.priority, now).await.unwrap();
    }

    let ids: Vec<Uuid> = [
        store.pop_due(now, ScanOrder::HighestFirst).await.unwrap(),
        store.pop_due(now, ScanOrder::HighestFirst).await.unwrap(),
        store.pop_due(now, ScanOrder::HighestFirst).await.unwrap(),
    ]
    .into_iter()
    .map(|t| t.unwrap().id)
    .collect();
    assert_eq!(
        ids,
        vec![high_first.id, high_second.id, low.id],
        "[{backend}] priority then submission order"
    );

    assert!(
        store
            .pop_due(now, ScanOrder::HighestFirst)
            .await
            .unwrap()
            .is_none(),
        "[{backend}] queue should be drained"
    );
}

async fn check_optimistic_locking(store: Arc<dyn TaskStore>, backend: &str) {
    let task = sample_task();
    let id = task.id;
    store.insert(task).await.unwrap();

    store
        .transition(id, TaskStatus::Pending, TaskStatus::Queued, TransitionFields::none())
        .await
        .unwrap();

    // A second writer expecting `pending` loses the race.
    let err = store
        .transition(id, TaskStatus::Pending, TaskStatus::Queued, TransitionFields::none())
        .await
        .unwrap_err();
    assert!(err.is_conflict(), "[{backend}] stale expectation must conflict");

    let assigned = store
        .transition(
            id,
            TaskStatus::Queued,
            TaskStatus::Assigned,
            TransitionFields::with_worker("worker-1"),
        )
        .await
        .unwrap();
    assert_eq!(assigned.assigned_worker.as_deref(), Some("worker-1"));

    let running = store
        .transition(id, TaskStatus::Assigned, TaskStatus::Running, TransitionFields::none())
        .await
        .unwrap();
    assert!(running.started_at.is_some(), "[{backend}] started_at stamped");
}

async fn check_dead_letter_requeue(store: Arc<dyn TaskStore>, backend: &str) {
    let mut task = sample_task();
    task.status = TaskStatus::Failed;
    task.retry_count = 3;
    task.error = Some("connection refused".to_owned());
    task.error_tag = Some(ErrorTag::Transient);
    task.completed_at = Some(Utc::now());
    let id = task.id;
    store.insert(task).await.unwrap();
    store.move_to_dead_letter(id).await.unwrap();

    let letters = store.dead_letters().await.unwrap();
    assert_eq!(letters.len(), 1, "[{backend}] one dead letter");
    assert_eq!(letters[0].task.id, id);

    let readmitted = store
        .requeue_from_dead_letter(Duration::hours(24))
        .await
        .unwrap();
    assert_eq!(readmitted, vec![id]);
    assert!(store.dead_letters().await.unwrap().is_empty());

    let snapshot = store.get(id).await.unwrap().unwrap();
    assert_eq!(snapshot.status, TaskStatus::Queued, "[{backend}] re-admitted");
    assert_eq!(snapshot.retry_count, 0, "[{backend}] retries reset");

    let claimed = store
        .pop_due(Utc::now(), ScanOrder::HighestFirst)
        .await
        .unwrap();
    assert_eq!(claimed.unwrap().id, id, "[{backend}] claimable again");
}

async fn check_dependents_index(store: Arc<dyn TaskStore>, backend: &str) {
    let dep = sample_task();
    let dep_id = dep.id;
    store.insert(dep).await.unwrap();

    let mut child = sample_task();
    child.status = TaskStatus::WaitingDeps;
    child.dependencies = vec![dep_id];
    let child_id = child.id;
    store.insert(child).await.unwrap();

    let waiting = store.dependents_waiting(dep_id).await.unwrap();
    assert_eq!(waiting.len(), 1, "[{backend}] waiting dependent found");
    assert_eq!(waiting[0].id, child_id);
}

// ---------------------------------------------------------------------------
// Memory backend
// ---------------------------------------------------------------------------

#[tokio::test]
async fn memory_insert_get_roundtrip() {
    let scratch = ScratchStore::memory();
    check_insert_get_roundtrip(scratch.handle(), scratch.backend()).await;
    scratch.teardown().await;
}

#[tokio::test]
async fn memory_pop_due_ordering() {
    let scratch = ScratchStore::memory();
    check_pop_due_ordering(scratch.handle(), scratch.backend()).await;
    scratch.teardown().await;
}

#[tokio::test]
async fn memory_optimistic_locking() {
    let scratch = ScratchStore::memory();
    check_optimistic_locking(scratch.handle(), scratch.backend()).await;
    scratch.teardown().await;
}

#[tokio::test]
async fn memory_dead_letter_requeue() {
    let scratch = ScratchStore::memory();
    check_dead_letter_requeue(scratch.handle(), scratch.backend()).await;
    scratch.teardown().await;
}

#[tokio::test]
async fn memory_dependents_index() {
    let scratch = ScratchStore::memory();
    check_dependents_index(scratch.handle(), scratch.backend()).await;
    scratch.teardown().await;
}

// ---------------------------------------------------------------------------
// PostgreSQL backend
// ---------------------------------------------------------------------------

#[tokio::test]
#[ignore = "requires PostgreSQL (Docker or WARDEN_TEST_PG_URL)"]
async fn postgres_insert_get_roundtrip() {
    let scratch = ScratchStore::postgres().await;
    check_insert_get_roundtrip(scratch.handle(), scratch.backend()).await;
    scratch.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (Docker or WARDEN_TEST_PG_URL)"]
async fn postgres_pop_due_ordering() {
    let scratch = ScratchStore::postgres().await;
    check_pop_due_ordering(scratch.handle(), scratch.backend()).await;
    scratch.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (Docker or WARDEN_TEST_PG_URL)"]
async fn postgres_optimistic_locking() {
    let scratch = ScratchStore::postgres().await;
    check_optimistic_locking(scratch.handle(), scratch.backend()).await;
    scratch.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (Docker or WARDEN_TEST_PG_URL)"]
async fn postgres_dead_letter_requeue() {
    let scratch = ScratchStore::postgres().await;
    check_dead_letter_requeue(scratch.handle(), scratch.backend()).await;
    scratch.teardown().await;
}

#[tokio::test]
#[ignore = "requires PostgreSQL (Docker or WARDEN_TEST_PG_URL)"]
async fn postgres_dependents_index() {
    let scratch = ScratchStore::postgres().await;
    check_dependents_index(scratch.handle(), scratch.backend()).await;
    scratch.teardown().await;
}
