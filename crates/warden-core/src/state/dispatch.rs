//! Semantic wrappers around [`TaskStore::transition`].
//!
//! Each helper names one edge of the task lifecycle so call sites read as
//! intent rather than as status pairs.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use warden_store::error::StoreError;
use warden_store::models::{ErrorTag, Task, TaskPriority, TaskStatus};
use warden_store::{TaskStore, TransitionFields};

/// Enqueue a pending task: `pending -> queued` plus a queue entry at
/// `ready_at`.
pub async fn enqueue_task(
    store: &dyn TaskStore,
    task_id: Uuid,
    priority: TaskPriority,
    ready_at: DateTime<Utc>,
) -> Result<Task, StoreError> {
    let task = store
        .transition(
            task_id,
            TaskStatus::Pending,
            TaskStatus::Queued,
            TransitionFields {
                scheduled_at: Some(ready_at),
                ..TransitionFields::none()
            },
        )
        .await?;
    store.enqueue(task_id, priority, ready_at).await?;
    Ok(task)
}

/// Park a pending task until its dependencies resolve:
/// `pending -> waiting_deps`.
pub async fn hold_for_dependencies(
    store: &dyn TaskStore,
    task_id: Uuid,
) -> Result<Task, StoreError> {
    store
        .transition(
            task_id,
            TaskStatus::Pending,
            TaskStatus::WaitingDeps,
            TransitionFields::none(),
        )
        .await
}

/// Release a parked task once every dependency completed:
/// `waiting_deps -> pending`.
pub async fn release_dependencies(
    store: &dyn TaskStore,
    task_id: Uuid,
) -> Result<Task, StoreError> {
    store
        .transition(
            task_id,
            TaskStatus::WaitingDeps,
            TaskStatus::Pending,
            TransitionFields::none(),
        )
        .await
}

/// Assign a claimed task to a worker: `queued -> assigned`.
pub async fn assign_task(
    store: &dyn TaskStore,
    task_id: Uuid,
    worker: &str,
) -> Result<Task, StoreError> {
    store
        .transition(
            task_id,
            TaskStatus::Queued,
            TaskStatus::Assigned,
            TransitionFields::with_worker(worker),
        )
        .await
}

/// Start execution on worker acknowledgment: `assigned -> running`.
/// Stamps `started_at`.
pub async fn start_task(store: &dyn TaskStore, task_id: Uuid) -> Result<Task, StoreError> {
    store
        .transition(
            task_id,
            TaskStatus::Assigned,
            TaskStatus::Running,
            TransitionFields::none(),
        )
        .await
}

/// Record success: `running -> completed` with output and duration.
pub async fn complete_task(
    store: &dyn TaskStore,
    task_id: Uuid,
    output: Option<serde_json::Value>,
    actual_duration_secs: Option<f64>,
) -> Result<Task, StoreError> {
    store
        .transition(
            task_id,
            TaskStatus::Running,
            TaskStatus::Completed,
            TransitionFields {
                output,
                actual_duration_secs,
                ..TransitionFields::none()
            },
        )
        .await
}

/// Schedule another attempt after a retriable failure:
/// `running|timeout -> retrying`, bumping the retry counter and recording
/// the next-attempt time.
pub async fn retry_task(
    store: &dyn TaskStore,
    task_id: Uuid,
    from: TaskStatus,
    tag: ErrorTag,
    message: &str,
    next_attempt_at: DateTime<Utc>,
) -> Result<Task, StoreError> {
    store
        .transition(
            task_id,
            from,
            TaskStatus::Retrying,
            TransitionFields {
                error: Some((tag, message.to_owned())),
                scheduled_at: Some(next_attempt_at),
                increment_retry: true,
                ..TransitionFields::none()
            },
        )
        .await
}

/// Put a retrying task back on the queue at its next-attempt time:
/// `retrying -> queued`.
pub async fn requeue_retrying(
    store: &dyn TaskStore,
    task_id: Uuid,
    priority: TaskPriority,
    ready_at: DateTime<Utc>,
) -> Result<Task, StoreError> {
    let task = store
        .transition(
            task_id,
            TaskStatus::Retrying,
            TaskStatus::Queued,
            TransitionFields::none(),
        )
        .await?;
    store.enqueue(task_id, priority, ready_at).await?;
    Ok(task)
}

/// Terminal failure: `running|timeout -> failed` with the final error.
pub async fn fail_task(
    store: &dyn TaskStore,
    task_id: Uuid,
    from: TaskStatus,
    tag: ErrorTag,
    message: &str,
) -> Result<Task, StoreError> {
    store
        .transition(
            task_id,
            from,
            TaskStatus::Failed,
            TransitionFields::with_error(tag, message),
        )
        .await
}

/// Execution deadline elapsed with no report: `running -> timeout`.
pub async fn time_out_task(store: &dyn TaskStore, task_id: Uuid) -> Result<Task, StoreError> {
    store
        .transition(
            task_id,
            TaskStatus::Running,
            TaskStatus::Timeout,
            TransitionFields::with_error(ErrorTag::Timeout, "no completion before the deadline"),
        )
        .await
}

/// Cancel from any non-terminal state; `fields` carries the cause when the
/// cancellation cascades from a failed dependency.
pub async fn cancel_task(
    store: &dyn TaskStore,
    task_id: Uuid,
    from: TaskStatus,
    fields: TransitionFields,
) -> Result<Task, StoreError> {
    store
        .transition(task_id, from, TaskStatus::Cancelled, fields)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_store::MemoryTaskStore;
    use warden_store::models::TaskKind;

    async fn seeded(store: &MemoryTaskStore) -> Uuid {
        let task = Task::new(TaskKind::SecurityScan, TaskPriority::High, "tenant");
        let id = task.id;
        store.insert(task).await.unwrap();
        id
    }

    #[tokio::test]
    async fn full_happy_path_chain() {
        let store = MemoryTaskStore::new();
        let id = seeded(&store).await;
        let now = Utc::now();

        enqueue_task(&store, id, TaskPriority::High, now).await.unwrap();
        assign_task(&store, id, "w-1").await.unwrap();
        let running = start_task(&store, id).await.unwrap();
        assert!(running.started_at.is_some());

        let done = complete_task(&store, id, Some(serde_json::json!({"ok": true})), Some(3.5))
            .await
            .unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert_eq!(done.actual_duration_secs, Some(3.5));
        assert!(done.assigned_worker.is_none());
    }

    #[tokio::test]
    async fn retry_chain_counts_attempts() {
        let store = MemoryTaskStore::new();
        let id = seeded(&store).await;
        let now = Utc::now();

        enqueue_task(&store, id, TaskPriority::High, now).await.unwrap();
        assign_task(&store, id, "w-1").await.unwrap();
        start_task(&store, id).await.unwrap();

        let next = now + chrono::Duration::seconds(60);
        let retrying = retry_task(
            &store,
            id,
            TaskStatus::Running,
            ErrorTag::Transient,
            "connection reset",
            next,
        )
        .await
        .unwrap();
        assert_eq!(retrying.retry_count, 1);
        assert_eq!(retrying.scheduled_at, Some(next));

        let queued = requeue_retrying(&store, id, TaskPriority::High, next).await.unwrap();
        assert_eq!(queued.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn timeout_feeds_the_retry_pipeline() {
        let store = MemoryTaskStore::new();
        let id = seeded(&store).await;
        let now = Utc::now();

        enqueue_task(&store, id, TaskPriority::High, now).await.unwrap();
        assign_task(&store, id, "w-1").await.unwrap();
        start_task(&store, id).await.unwrap();

        let timed_out = time_out_task(&store, id).await.unwrap();
        assert_eq!(timed_out.status, TaskStatus::Timeout);
        assert_eq!(timed_out.error_tag, Some(ErrorTag::Timeout));
        // Timeout still holds the worker association for cleanup.
        assert!(timed_out.assigned_worker.is_some());

        let retrying = retry_task(
            &store,
            id,
            TaskStatus::Timeout,
            ErrorTag::Timeout,
            "no completion before the deadline",
            now + chrono::Duration::seconds(30),
        )
        .await
        .unwrap();
        assert_eq!(retrying.retry_count, 1);
        assert!(retrying.assigned_worker.is_none());
    }

    #[tokio::test]
    async fn dependency_hold_and_release() {
        let store = MemoryTaskStore::new();
        let id = seeded(&store).await;

        hold_for_dependencies(&store, id).await.unwrap();
        let released = release_dependencies(&store, id).await.unwrap();
        assert_eq!(released.status, TaskStatus::Pending);
    }
}
