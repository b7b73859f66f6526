//! PostgreSQL [`TaskStore`] backend.
//!
//! Queue claims use `FOR UPDATE SKIP LOCKED` so several dispatcher processes
//! can share one database without handing the same entry to two of them.
//! Status transitions read the row `FOR UPDATE`, validate the edge in Rust
//! (same rules as every other backend), and write the derived fields back.

use std::collections::BTreeMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use sqlx::types::Json;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{
    DeadLetter, ErrorTag, RetryConfig, ScheduleConfig, Task, TaskKind, TaskPriority, TaskStatus,
};
use crate::store::{apply_transition, ScanOrder, TaskStore, TransitionFields};

/// PostgreSQL-backed store sharing a [`PgPool`].
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

/// Database row shape for `tasks`; kept separate from [`Task`] so the domain
/// type carries no sqlx wrapper types.
#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    kind: TaskKind,
    priority: TaskPriority,
    target_worker_kind: Option<String>,
    tenant_id: String,
    submitted_by: String,
    payload: serde_json::Value,
    configuration: serde_json::Value,
    dependencies: Vec<Uuid>,
    status: TaskStatus,
    assigned_worker: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    output: Option<serde_json::Value>,
    error: Option<String>,
    error_tag: Option<ErrorTag>,
    retry_count: i32,
    max_retries: i32,
    estimated_duration_secs: f64,
    actual_duration_secs: Option<f64>,
    correlation_id: Option<String>,
    scheduled_at: Option<DateTime<Utc>>,
    schedule: Option<Json<ScheduleConfig>>,
    retry_policy: Option<Json<RetryConfig>>,
    timeout_secs: Option<i64>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            id: row.id,
            kind: row.kind,
            priority: row.priority,
            target_worker_kind: row.target_worker_kind,
            tenant_id: row.tenant_id,
            submitted_by: row.submitted_by,
            payload: row.payload,
            configuration: row.configuration,
            dependencies: row.dependencies,
            status: row.status,
            assigned_worker: row.assigned_worker,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            output: row.output,
            error: row.error,
            error_tag: row.error_tag,
            retry_count: row.retry_count.max(0) as u32,
            max_retries: row.max_retries.max(0) as u32,
            estimated_duration_secs: row.estimated_duration_secs,
            actual_duration_secs: row.actual_duration_secs,
            correlation_id: row.correlation_id,
            scheduled_at: row.scheduled_at,
            schedule: row.schedule.map(|j| j.0),
            retry_policy: row.retry_policy.map(|j| j.0),
            timeout_secs: row.timeout_secs.map(|v| v.max(0) as u64),
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct UpcomingRow {
    ready_at: DateTime<Utc>,
    #[sqlx(flatten)]
    task: TaskRow,
}

const SELECT_TASK: &str = "SELECT id, kind, priority, target_worker_kind, tenant_id, \
     submitted_by, payload, configuration, dependencies, status, assigned_worker, created_at, \
     started_at, completed_at, output, error, error_tag, retry_count, max_retries, \
     estimated_duration_secs, actual_duration_secs, correlation_id, scheduled_at, schedule, \
     retry_policy, timeout_secs FROM tasks";

async fn fetch_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Task>, StoreError> {
    let row = sqlx::query_as::<_, TaskRow>(&format!("{SELECT_TASK} WHERE id = $1"))
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;
    Ok(row.map(Task::from))
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn insert(&self, task: Task) -> Result<(), StoreError> {
        let result = sqlx::query(
            "INSERT INTO tasks (id, kind, priority, target_worker_kind, tenant_id, submitted_by, \
             payload, configuration, dependencies, status, assigned_worker, created_at, \
             started_at, completed_at, output, error, error_tag, retry_count, max_retries, \
             estimated_duration_secs, actual_duration_secs, correlation_id, scheduled_at, \
             schedule, retry_policy, timeout_secs) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, \
             $18, $19, $20, $21, $22, $23, $24, $25, $26) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(task.id)
        .bind(task.kind)
        .bind(task.priority)
        .bind(&task.target_worker_kind)
        .bind(&task.tenant_id)
        .bind(&task.submitted_by)
        .bind(&task.payload)
        .bind(&task.configuration)
        .bind(&task.dependencies)
        .bind(task.status)
        .bind(&task.assigned_worker)
        .bind(task.created_at)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(&task.output)
        .bind(&task.error)
        .bind(task.error_tag)
        .bind(task.retry_count as i32)
        .bind(task.max_retries as i32)
        .bind(task.estimated_duration_secs)
        .bind(task.actual_duration_secs)
        .bind(&task.correlation_id)
        .bind(task.scheduled_at)
        .bind(task.schedule.as_ref().map(Json))
        .bind(task.retry_policy.as_ref().map(Json))
        .bind(task.timeout_secs.map(|v| v as i64))
        .execute(&self.pool)
        .await
        .context("failed to insert task")?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Duplicate(task.id));
        }
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        fetch_task(&self.pool, task_id).await
    }

    async fn enqueue(
        &self,
        task_id: Uuid,
        priority: TaskPriority,
        ready_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.context("failed to begin tx")?;

        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM tasks WHERE id = $1)")
            .bind(task_id)
            .fetch_one(&mut *tx)
            .await
            .context("failed to check task existence")?;
        if !exists {
            return Err(StoreError::NotFound(task_id));
        }

        // Replace semantics: a task holds at most one queue entry.
        sqlx::query("DELETE FROM task_queue WHERE task_id = $1")
            .bind(task_id)
            .execute(&mut *tx)
            .await
            .context("failed to clear previous queue entry")?;

        sqlx::query("INSERT INTO task_queue (task_id, priority, ready_at) VALUES ($1, $2, $3)")
            .bind(task_id)
            .bind(priority.rank())
            .bind(ready_at)
            .execute(&mut *tx)
            .await
            .context("failed to enqueue task")?;

        tx.commit().await.context("failed to commit enqueue")?;
        Ok(())
    }

    async fn pop_due(
        &self,
        now: DateTime<Utc>,
        order: ScanOrder,
    ) -> Result<Option<Task>, StoreError> {
        let claim_sql = match order {
            ScanOrder::HighestFirst => {
                "WITH claimed AS ( \
                     SELECT seq FROM task_queue WHERE ready_at <= $1 \
                     ORDER BY priority ASC, ready_at ASC, seq ASC \
                     LIMIT 1 FOR UPDATE SKIP LOCKED) \
                 DELETE FROM task_queue q USING claimed c WHERE q.seq = c.seq \
                 RETURNING q.task_id"
            }
            ScanOrder::LowestFirst => {
                "WITH claimed AS ( \
                     SELECT seq FROM task_queue WHERE ready_at <= $1 \
                     ORDER BY priority DESC, ready_at ASC, seq ASC \
                     LIMIT 1 FOR UPDATE SKIP LOCKED) \
                 DELETE FROM task_queue q USING claimed c WHERE q.seq = c.seq \
                 RETURNING q.task_id"
            }
        };

        // Entries can outlive their task (pruning); keep claiming until one
        // resolves or the queue has nothing due.
        loop {
            let claimed: Option<Uuid> = sqlx::query_scalar(claim_sql)
                .bind(now)
                .fetch_optional(&self.pool)
                .await
                .context("failed to claim queue entry")?;

            let Some(task_id) = claimed else {
                return Ok(None);
            };

            if let Some(task) = fetch_task(&self.pool, task_id).await? {
                return Ok(Some(task));
            }
        }
    }

    async fn remove_queued(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM task_queue WHERE task_id = $1")
            .bind(task_id)
            .execute(&self.pool)
            .await
            .context("failed to remove queue entry")?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        fields: TransitionFields,
    ) -> Result<Task, StoreError> {
        let mut tx = self.pool.begin().await.context("failed to begin tx")?;

        let row = sqlx::query_as::<_, TaskRow>(&format!("{SELECT_TASK} WHERE id = $1 FOR UPDATE"))
            .bind(task_id)
            .fetch_optional(&mut *tx)
            .await
            .context("failed to lock task row")?;

        let mut task = Task::from(row.ok_or(StoreError::NotFound(task_id))?);
        if task.status != from {
            return Err(StoreError::StatusConflict {
                task_id,
                expected: from,
                actual: task.status,
            });
        }

        apply_transition(&mut task, to, fields, Utc::now())?;

        sqlx::query(
            "UPDATE tasks SET status = $2, assigned_worker = $3, started_at = $4, \
             completed_at = $5, output = $6, error = $7, error_tag = $8, retry_count = $9, \
             actual_duration_secs = $10, scheduled_at = $11 WHERE id = $1",
        )
        .bind(task.id)
        .bind(task.status)
        .bind(&task.assigned_worker)
        .bind(task.started_at)
        .bind(task.completed_at)
        .bind(&task.output)
        .bind(&task.error)
        .bind(task.error_tag)
        .bind(task.retry_count as i32)
        .bind(task.actual_duration_secs)
        .bind(task.scheduled_at)
        .execute(&mut *tx)
        .await
        .context("failed to write task transition")?;

        tx.commit().await.context("failed to commit transition")?;
        Ok(task)
    }

    async fn update_schedule(
        &self,
        task_id: Uuid,
        schedule: ScheduleConfig,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE tasks SET schedule = $2 WHERE id = $1")
            .bind(task_id)
            .bind(Json(&schedule))
            .execute(&self.pool)
            .await
            .context("failed to update task schedule")?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(task_id));
        }
        Ok(())
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "{SELECT_TASK} WHERE status = $1 ORDER BY created_at ASC"
        ))
        .bind(status)
        .fetch_all(&self.pool)
        .await
        .context("failed to list tasks by status")?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    async fn list_by_correlation(&self, correlation_id: &str) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "{SELECT_TASK} WHERE correlation_id = $1 ORDER BY created_at ASC"
        ))
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list tasks by correlation id")?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    async fn dependents_waiting(&self, dep_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let rows = sqlx::query_as::<_, TaskRow>(&format!(
            "{SELECT_TASK} WHERE status = 'waiting_deps' AND $1 = ANY(dependencies) \
             ORDER BY created_at ASC"
        ))
        .bind(dep_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list waiting dependents")?;
        Ok(rows.into_iter().map(Task::from).collect())
    }

    async fn upcoming(
        &self,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(Task, DateTime<Utc>)>, StoreError> {
        let rows = sqlx::query_as::<_, UpcomingRow>(
            "SELECT q.ready_at, t.id, t.kind, t.priority, t.target_worker_kind, t.tenant_id, \
             t.submitted_by, t.payload, t.configuration, t.dependencies, t.status, \
             t.assigned_worker, t.created_at, t.started_at, t.completed_at, t.output, t.error, \
             t.error_tag, t.retry_count, t.max_retries, t.estimated_duration_secs, \
             t.actual_duration_secs, t.correlation_id, t.scheduled_at, t.schedule, \
             t.retry_policy, t.timeout_secs \
             FROM task_queue q JOIN tasks t ON t.id = q.task_id \
             WHERE q.ready_at <= $1 ORDER BY q.ready_at ASC LIMIT $2",
        )
        .bind(until)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to list upcoming tasks")?;

        Ok(rows
            .into_iter()
            .map(|row| (Task::from(row.task), row.ready_at))
            .collect())
    }

    async fn queue_depths(&self) -> Result<BTreeMap<TaskPriority, usize>, StoreError> {
        let rows: Vec<(i16, i64)> =
            sqlx::query_as("SELECT priority, COUNT(*) FROM task_queue GROUP BY priority")
                .fetch_all(&self.pool)
                .await
                .context("failed to count queue depths")?;

        let mut depths: BTreeMap<TaskPriority, usize> =
            TaskPriority::ALL.iter().map(|p| (*p, 0)).collect();
        for (rank, count) in rows {
            if let Some(priority) = TaskPriority::from_rank(rank) {
                depths.insert(priority, count.max(0) as usize);
            }
        }
        Ok(depths)
    }

    async fn move_to_dead_letter(&self, task_id: Uuid) -> Result<(), StoreError> {
        let task = fetch_task(&self.pool, task_id)
            .await?
            .ok_or(StoreError::NotFound(task_id))?;

        let record = serde_json::to_value(&task)
            .context("failed to serialize task for dead letter")?;

        sqlx::query("INSERT INTO dead_letters (task_id, task, moved_at) VALUES ($1, $2, $3)")
            .bind(task_id)
            .bind(record)
            .bind(Utc::now())
            .execute(&self.pool)
            .await
            .context("failed to insert dead letter")?;
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        let rows: Vec<(serde_json::Value, DateTime<Utc>)> =
            sqlx::query_as("SELECT task, moved_at FROM dead_letters ORDER BY moved_at ASC")
                .fetch_all(&self.pool)
                .await
                .context("failed to list dead letters")?;

        let mut letters = Vec::with_capacity(rows.len());
        for (value, moved_at) in rows {
            let task: Task = serde_json::from_value(value)
                .context("failed to deserialize dead-lettered task")?;
            letters.push(DeadLetter { task, moved_at });
        }
        Ok(letters)
    }

    async fn requeue_from_dead_letter(&self, max_age: Duration) -> Result<Vec<Uuid>, StoreError> {
        let now = Utc::now();
        let cutoff = now - max_age;

        let rows: Vec<(i64, serde_json::Value)> =
            sqlx::query_as("SELECT id, task FROM dead_letters ORDER BY moved_at ASC")
                .fetch_all(&self.pool)
                .await
                .context("failed to read dead letters")?;

        let mut readmitted = Vec::new();
        for (letter_id, value) in rows {
            let mut task: Task = serde_json::from_value(value)
                .context("failed to deserialize dead-lettered task")?;
            if task.created_at < cutoff {
                continue;
            }

            task.retry_count = 0;
            task.status = TaskStatus::Queued;
            task.error = None;
            task.error_tag = None;
            task.completed_at = None;
            task.scheduled_at = None;

            let mut tx = self.pool.begin().await.context("failed to begin tx")?;
            sqlx::query(
                "UPDATE tasks SET status = $2, retry_count = 0, error = NULL, error_tag = NULL, \
                 completed_at = NULL, scheduled_at = NULL WHERE id = $1",
            )
            .bind(task.id)
            .bind(TaskStatus::Queued)
            .execute(&mut *tx)
            .await
            .context("failed to reset dead-lettered task")?;

            sqlx::query("DELETE FROM task_queue WHERE task_id = $1")
                .bind(task.id)
                .execute(&mut *tx)
                .await
                .context("failed to clear previous queue entry")?;
            sqlx::query("INSERT INTO task_queue (task_id, priority, ready_at) VALUES ($1, $2, $3)")
                .bind(task.id)
                .bind(task.priority.rank())
                .bind(now)
                .execute(&mut *tx)
                .await
                .context("failed to requeue dead-lettered task")?;

            sqlx::query("DELETE FROM dead_letters WHERE id = $1")
                .bind(letter_id)
                .execute(&mut *tx)
                .await
                .context("failed to remove dead letter")?;
            tx.commit().await.context("failed to commit requeue")?;

            readmitted.push(task.id);
        }
        Ok(readmitted)
    }

    async fn prune_terminal(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "DELETE FROM tasks \
             WHERE status IN ('completed', 'failed', 'cancelled') AND completed_at < $1 \
             RETURNING id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("failed to prune terminal tasks")?;

        if !ids.is_empty() {
            sqlx::query("DELETE FROM task_queue WHERE task_id = ANY($1)")
                .bind(&ids)
                .execute(&self.pool)
                .await
                .context("failed to drop queue entries of pruned tasks")?;
        }
        Ok(ids.len() as u64)
    }

    async fn prune_dead_letters(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM dead_letters WHERE moved_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .context("failed to prune dead letters")?;
        Ok(result.rows_affected())
    }
}
