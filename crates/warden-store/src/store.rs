//! The persistence contract between the orchestration core and its backing
//! store.
//!
//! Correctness requires only (i) at-least-once dispatch and (ii) idempotent
//! status updates by task id; exactly-once execution is not promised. The
//! in-memory backend serves single-process deployments and tests; the
//! PostgreSQL backend serves distributed deployments where CLI tooling and
//! the dispatcher share state.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{DeadLetter, ErrorTag, ScheduleConfig, Task, TaskPriority, TaskStatus};

/// Queue scan direction for [`TaskStore::pop_due`].
///
/// The dispatcher normally claims from the highest-priority queue first;
/// the anti-starvation pass flips the direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrder {
    HighestFirst,
    LowestFirst,
}

/// Field updates that accompany a status transition.
///
/// Timestamps (`started_at`, `completed_at`) and worker-association
/// bookkeeping are derived from the transition itself, not passed in.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    /// Required when transitioning to `assigned`.
    pub assigned_worker: Option<String>,
    pub output: Option<serde_json::Value>,
    pub error: Option<(ErrorTag, String)>,
    pub actual_duration_secs: Option<f64>,
    /// Next-attempt time for `retrying`, or deferred ready time.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Bump the retry counter (retry-pipeline transitions only).
    pub increment_retry: bool,
}

impl TransitionFields {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_worker(worker: impl Into<String>) -> Self {
        Self {
            assigned_worker: Some(worker.into()),
            ..Self::default()
        }
    }

    pub fn with_error(tag: ErrorTag, message: impl Into<String>) -> Self {
        Self {
            error: Some((tag, message.into())),
            ..Self::default()
        }
    }
}

/// Apply a validated transition to a task snapshot in place.
///
/// Shared by every backend so the state-machine rules live in one place:
/// - the edge must exist in the state graph;
/// - `retry_count` never exceeds `max_retries`;
/// - `assigned_worker` is held only in assigned/running/timeout;
/// - `completed_at` is set exactly in completed/failed/cancelled/timeout;
/// - `started_at` is stamped on assigned -> running and cleared when the
///   task re-enters a queueable state for the next attempt.
pub fn apply_transition(
    task: &mut Task,
    to: TaskStatus,
    fields: TransitionFields,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    let from = task.status;
    if !from.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            task_id: task.id,
            from,
            to,
        });
    }

    if fields.increment_retry {
        if task.retry_count >= task.max_retries {
            return Err(StoreError::RetryExhausted {
                task_id: task.id,
                max_retries: task.max_retries,
            });
        }
        task.retry_count += 1;
    }

    if to == TaskStatus::Assigned {
        match fields.assigned_worker {
            Some(worker) => task.assigned_worker = Some(worker),
            None => return Err(StoreError::MissingWorker(task.id)),
        }
    }

    if from == TaskStatus::Assigned && to == TaskStatus::Running {
        task.started_at = Some(now);
    }

    if to.is_finished() {
        task.completed_at = Some(now);
    } else {
        task.completed_at = None;
    }

    // Queueable states start the next attempt from scratch.
    if matches!(to, TaskStatus::Queued | TaskStatus::Retrying | TaskStatus::Pending) {
        task.started_at = None;
    }

    if !to.holds_worker() {
        task.assigned_worker = None;
    }

    if let Some(output) = fields.output {
        task.output = Some(output);
    }
    if let Some((tag, message)) = fields.error {
        task.error_tag = Some(tag);
        task.error = Some(message);
    }
    if to == TaskStatus::Completed {
        task.error = None;
        task.error_tag = None;
    }
    if let Some(duration) = fields.actual_duration_secs {
        task.actual_duration_secs = Some(duration);
    }
    if let Some(at) = fields.scheduled_at {
        task.scheduled_at = Some(at);
    }

    task.status = to;
    Ok(())
}

/// Durable task state: per-priority FIFO queues, a status-indexed record
/// table, and a dead-letter queue.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task record. Rejects duplicate ids so that submission
    /// is idempotent by task id.
    async fn insert(&self, task: Task) -> Result<(), StoreError>;

    /// Latest snapshot of a task.
    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Add a claimable queue entry. Entries order by
    /// (priority, ready_at, submission order).
    async fn enqueue(
        &self,
        task_id: Uuid,
        priority: TaskPriority,
        ready_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Atomically claim the due entry scanned in `order`, returning its
    /// task snapshot. `None` when nothing is due.
    async fn pop_due(
        &self,
        now: DateTime<Utc>,
        order: ScanOrder,
    ) -> Result<Option<Task>, StoreError>;

    /// Drop a queue entry (cancellation). Returns whether one existed.
    async fn remove_queued(&self, task_id: Uuid) -> Result<bool, StoreError>;

    /// Single-writer status mutation with optimistic locking: fails with
    /// [`StoreError::StatusConflict`] when the stored status is not `from`.
    /// Returns the updated snapshot.
    async fn transition(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        fields: TransitionFields,
    ) -> Result<Task, StoreError>;

    /// Replace a task's schedule configuration (optimization pass).
    async fn update_schedule(
        &self,
        task_id: Uuid,
        schedule: ScheduleConfig,
    ) -> Result<(), StoreError>;

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError>;

    /// Every task sharing a correlation tag (workflow membership).
    async fn list_by_correlation(&self, correlation_id: &str) -> Result<Vec<Task>, StoreError>;

    /// Tasks in `waiting_deps` that list `dep_id` among their dependencies.
    async fn dependents_waiting(&self, dep_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// Queue entries due before `until`, soonest first, with their ready
    /// times.
    async fn upcoming(
        &self,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(Task, DateTime<Utc>)>, StoreError>;

    /// Entry counts per priority queue.
    async fn queue_depths(&self) -> Result<BTreeMap<TaskPriority, usize>, StoreError>;

    /// Park the final record of a failed task for operator inspection.
    async fn move_to_dead_letter(&self, task_id: Uuid) -> Result<(), StoreError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError>;

    /// Re-admit dead-lettered tasks whose `created_at` falls within
    /// `max_age`, resetting their retry counters; returns re-admitted ids.
    async fn requeue_from_dead_letter(&self, max_age: Duration) -> Result<Vec<Uuid>, StoreError>;

    /// Destroy terminal tasks whose `completed_at` precedes `cutoff`.
    /// Returns the number removed.
    async fn prune_terminal(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Drop dead letters moved before `cutoff`. Returns the number removed.
    async fn prune_dead_letters(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskKind;

    fn task() -> Task {
        Task::new(TaskKind::ComplianceCheck, TaskPriority::High, "tenant-a")
    }

    #[test]
    fn transition_rejects_invalid_edge() {
        let mut t = task();
        let err = apply_transition(
            &mut t,
            TaskStatus::Running,
            TransitionFields::none(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        assert_eq!(t.status, TaskStatus::Pending);
    }

    #[test]
    fn transition_to_assigned_requires_worker() {
        let mut t = task();
        t.status = TaskStatus::Queued;
        let err = apply_transition(
            &mut t,
            TaskStatus::Assigned,
            TransitionFields::none(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::MissingWorker(_)));
    }

    #[test]
    fn assigned_worker_held_only_while_assigned_or_running() {
        let mut t = task();
        t.status = TaskStatus::Queued;
        apply_transition(
            &mut t,
            TaskStatus::Assigned,
            TransitionFields::with_worker("w-1"),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(t.assigned_worker.as_deref(), Some("w-1"));

        apply_transition(&mut t, TaskStatus::Running, TransitionFields::none(), Utc::now())
            .unwrap();
        assert!(t.started_at.is_some());
        assert_eq!(t.assigned_worker.as_deref(), Some("w-1"));

        apply_transition(
            &mut t,
            TaskStatus::Completed,
            TransitionFields::none(),
            Utc::now(),
        )
        .unwrap();
        assert!(t.assigned_worker.is_none());
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn retry_increment_respects_max() {
        let mut t = task();
        t.status = TaskStatus::Running;
        t.max_retries = 1;

        let fields = TransitionFields {
            increment_retry: true,
            ..TransitionFields::none()
        };
        apply_transition(&mut t, TaskStatus::Retrying, fields.clone(), Utc::now()).unwrap();
        assert_eq!(t.retry_count, 1);

        t.status = TaskStatus::Running;
        let err = apply_transition(&mut t, TaskStatus::Retrying, fields, Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::RetryExhausted { .. }));
    }

    #[test]
    fn timeout_carries_completed_at_until_retry() {
        let mut t = task();
        t.status = TaskStatus::Running;
        apply_transition(&mut t, TaskStatus::Timeout, TransitionFields::none(), Utc::now())
            .unwrap();
        assert!(t.completed_at.is_some());

        let fields = TransitionFields {
            increment_retry: true,
            ..TransitionFields::none()
        };
        apply_transition(&mut t, TaskStatus::Retrying, fields, Utc::now()).unwrap();
        assert!(t.completed_at.is_none());
        assert!(t.started_at.is_none());
    }

    #[test]
    fn completion_clears_error() {
        let mut t = task();
        t.status = TaskStatus::Running;
        t.error = Some("earlier attempt".to_owned());
        t.error_tag = Some(ErrorTag::Transient);
        apply_transition(
            &mut t,
            TaskStatus::Completed,
            TransitionFields::none(),
            Utc::now(),
        )
        .unwrap();
        assert!(t.error.is_none());
        assert!(t.error_tag.is_none());
    }
}
