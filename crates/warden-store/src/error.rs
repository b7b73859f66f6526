use uuid::Uuid;

use crate::models::TaskStatus;

/// Errors surfaced by [`crate::TaskStore`] implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(Uuid),

    #[error("task {0} already exists")]
    Duplicate(Uuid),

    #[error("invalid state transition {from} -> {to} for task {task_id}")]
    InvalidTransition {
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Optimistic lock failure: the stored status did not match the caller's
    /// expectation.
    #[error("status conflict for task {task_id}: expected {expected}, found {actual}")]
    StatusConflict {
        task_id: Uuid,
        expected: TaskStatus,
        actual: TaskStatus,
    },

    #[error("retry limit reached for task {task_id} ({max_retries} attempts)")]
    RetryExhausted { task_id: Uuid, max_retries: u32 },

    #[error("transition to assigned requires a worker id for task {0}")]
    MissingWorker(Uuid),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// True when the error indicates a lost optimistic-lock race rather
    /// than a caller bug; such operations are safe to skip or re-read.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::StatusConflict { .. })
    }
}
