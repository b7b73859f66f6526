//! Task state machine helpers.
//!
//! The transition graph itself is enforced inside every [`TaskStore`]
//! backend; this module layers the orchestration-level concerns on top:
//! dependency evaluation and the semantic transition helpers in
//! [`dispatch`].

pub mod dispatch;

use anyhow::{Context, Result};
use uuid::Uuid;

use warden_store::TaskStore;
use warden_store::models::{Task, TaskStatus};

/// Aggregate status of a task's dependency set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyStatus {
    /// No dependencies, or every dependency completed.
    Satisfied,
    /// At least one dependency is still in flight.
    Waiting,
    /// A dependency ended in failed or cancelled; the dependent can never
    /// run.
    Failed(Uuid),
}

/// Evaluate a task's dependencies against the store.
///
/// Unknown dependency ids are an error: submission validates them, so a
/// missing record means the dependency was pruned while this task still
/// waited on it.
pub async fn check_dependencies(store: &dyn TaskStore, task: &Task) -> Result<DependencyStatus> {
    let mut waiting = false;
    for dep_id in &task.dependencies {
        let dep = store
            .get(*dep_id)
            .await?
            .with_context(|| format!("dependency {dep_id} of task {} not found", task.id))?;
        match dep.status {
            TaskStatus::Completed => {}
            TaskStatus::Failed | TaskStatus::Cancelled => {
                return Ok(DependencyStatus::Failed(*dep_id));
            }
            _ => waiting = true,
        }
    }
    if waiting {
        Ok(DependencyStatus::Waiting)
    } else {
        Ok(DependencyStatus::Satisfied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_store::MemoryTaskStore;
    use warden_store::models::{TaskKind, TaskPriority};

    fn task_with_status(status: TaskStatus) -> Task {
        let mut t = Task::new(TaskKind::DataValidation, TaskPriority::Medium, "tenant");
        t.status = status;
        t
    }

    #[tokio::test]
    async fn no_dependencies_is_satisfied() {
        let store = MemoryTaskStore::new();
        let task = task_with_status(TaskStatus::Pending);
        let status = check_dependencies(&store, &task).await.unwrap();
        assert_eq!(status, DependencyStatus::Satisfied);
    }

    #[tokio::test]
    async fn in_flight_dependency_waits() {
        let store = MemoryTaskStore::new();
        let dep = task_with_status(TaskStatus::Running);
        let dep_id = dep.id;
        store.insert(dep).await.unwrap();

        let mut task = task_with_status(TaskStatus::Pending);
        task.dependencies = vec![dep_id];
        let status = check_dependencies(&store, &task).await.unwrap();
        assert_eq!(status, DependencyStatus::Waiting);
    }

    #[tokio::test]
    async fn failed_dependency_poisons_the_dependent() {
        let store = MemoryTaskStore::new();
        let done = task_with_status(TaskStatus::Completed);
        let failed = task_with_status(TaskStatus::Failed);
        let done_id = done.id;
        let failed_id = failed.id;
        store.insert(done).await.unwrap();
        store.insert(failed).await.unwrap();

        let mut task = task_with_status(TaskStatus::Pending);
        task.dependencies = vec![done_id, failed_id];
        let status = check_dependencies(&store, &task).await.unwrap();
        assert_eq!(status, DependencyStatus::Failed(failed_id));
    }

    #[tokio::test]
    async fn missing_dependency_is_an_error() {
        let store = MemoryTaskStore::new();
        let mut task = task_with_status(TaskStatus::Pending);
        task.dependencies = vec![Uuid::new_v4()];
        assert!(check_dependencies(&store, &task).await.is_err());
    }
}
