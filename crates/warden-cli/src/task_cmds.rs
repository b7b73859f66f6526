//! Task-level commands: submit, status, cancel, upcoming.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use warden_core::state::dispatch;
use warden_core::{CancelResult, Orchestrator};
use warden_store::models::{RetryConfig, ScheduleConfig, Task, TaskKind, TaskPriority};
use warden_store::{pool, PostgresTaskStore, TaskStore, TransitionFields};

use crate::config::WardenConfig;

/// On-disk TOML shape of a single task submission.
#[derive(Debug, Deserialize)]
struct TaskToml {
    kind: String,
    tenant: String,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    submitted_by: String,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    depends_on: Vec<Uuid>,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    payload: Option<toml::Value>,
    #[serde(default)]
    configuration: Option<toml::Value>,
    #[serde(default)]
    retry: Option<RetryConfig>,
    #[serde(default)]
    schedule: Option<ScheduleConfig>,
}

/// An orchestrator handle over the shared database, without background
/// loops: the CLI only uses the submission/read surface; the service
/// process owns dispatching.
pub async fn connect(config: &WardenConfig) -> Result<Arc<Orchestrator>> {
    tracing::debug!(url = %config.db_config.database_url, "connecting to store");
    let pg_pool = pool::create_pool(&config.db_config).await?;
    let store: Arc<dyn TaskStore> = Arc::new(PostgresTaskStore::new(pg_pool));
    Ok(Arc::new(Orchestrator::new(store, config.core.clone())))
}

fn task_from_toml(raw: TaskToml) -> Result<Task> {
    let kind: TaskKind = raw
        .kind
        .parse()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    let priority = match raw.priority {
        Some(value) => value.parse::<TaskPriority>().map_err(|e| anyhow::anyhow!("{e}"))?,
        None => TaskPriority::default(),
    };

    let mut task = Task::new(kind, priority, raw.tenant);
    task.submitted_by = raw.submitted_by;
    task.target_worker_kind = raw.target;
    task.dependencies = raw.depends_on;
    if let Some(max_retries) = raw.max_retries {
        task.max_retries = max_retries;
    }
    task.timeout_secs = raw.timeout_secs;
    task.scheduled_at = raw.scheduled_at;
    task.correlation_id = raw.correlation_id;
    if let Some(payload) = raw.payload {
        task.payload = serde_json::to_value(payload).context("payload is not valid JSON")?;
    }
    if let Some(configuration) = raw.configuration {
        task.configuration =
            serde_json::to_value(configuration).context("configuration is not valid JSON")?;
    }
    task.retry_policy = raw.retry;
    task.schedule = raw.schedule;
    Ok(task)
}

pub async fn submit(config: &WardenConfig, file: &str) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read task file {file}"))?;
    let raw: TaskToml = toml::from_str(&contents).context("failed to parse task file")?;
    let task = task_from_toml(raw)?;

    let orchestrator = connect(config).await?;
    let task_id = orchestrator.submit(task).await?;
    println!("{task_id}");
    Ok(())
}

pub async fn status(config: &WardenConfig, task_id: Option<&str>) -> Result<()> {
    let orchestrator = connect(config).await?;

    match task_id {
        Some(raw) => {
            let task_id: Uuid = raw.parse().context("task id is not a UUID")?;
            match orchestrator.task_status(task_id).await? {
                None => println!("task {task_id} not found"),
                Some(task) => print_task(&task),
            }
        }
        None => {
            let snapshot = orchestrator.status_snapshot().await?;
            println!("queues:");
            for (priority, depth) in &snapshot.queue_depths {
                println!("  {priority:<12} {depth}");
            }
            println!("dead letters: {}", snapshot.dead_letters);
        }
    }
    Ok(())
}

fn print_task(task: &Task) {
    println!("id:          {}", task.id);
    println!("kind:        {}", task.kind);
    println!("priority:    {}", task.priority);
    println!("status:      {}", task.status);
    println!("tenant:      {}", task.tenant_id);
    if let Some(worker) = &task.assigned_worker {
        println!("worker:      {worker}");
    }
    println!("retries:     {}/{}", task.retry_count, task.max_retries);
    println!("created:     {}", task.created_at.to_rfc3339());
    if let Some(started) = task.started_at {
        println!("started:     {}", started.to_rfc3339());
    }
    if let Some(completed) = task.completed_at {
        println!("completed:   {}", completed.to_rfc3339());
    }
    if let Some(at) = task.scheduled_at {
        println!("scheduled:   {}", at.to_rfc3339());
    }
    if let Some(duration) = task.actual_duration_secs {
        println!("duration:    {duration:.2}s");
    }
    if let Some(correlation) = &task.correlation_id {
        println!("correlation: {correlation}");
    }
    if let Some(error) = &task.error {
        let tag = task
            .error_tag
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_owned());
        println!("error:       [{tag}] {error}");
    }
}

pub async fn cancel(config: &WardenConfig, task_id: &str) -> Result<()> {
    let task_id: Uuid = task_id.parse().context("task id is not a UUID")?;
    let orchestrator = connect(config).await?;

    // Queued states cancel cleanly through the orchestrator surface. For
    // assigned/running work the CLI has no message path to the worker, so
    // the cancellation is forced at the store; the worker's late report is
    // ignored by idempotent status handling.
    match orchestrator.cancel(task_id).await? {
        CancelResult::Cancelled => println!("cancelled"),
        CancelResult::AlreadyTerminal => println!("already terminal"),
        CancelResult::NotFound => println!("not found"),
        CancelResult::CancelRequested => {
            let store = orchestrator.store();
            if let Some(task) = store.get(task_id).await? {
                store.remove_queued(task_id).await?;
                dispatch::cancel_task(
                    store.as_ref(),
                    task_id,
                    task.status,
                    TransitionFields::none(),
                )
                .await?;
                println!("cancelled (was {}, forced)", task.status);
            }
        }
    }
    Ok(())
}

pub async fn upcoming(config: &WardenConfig, hours: u64) -> Result<()> {
    let orchestrator = connect(config).await?;
    let entries = orchestrator.upcoming_tasks(hours).await?;
    if entries.is_empty() {
        println!("nothing due within {hours}h");
        return Ok(());
    }
    for (task, ready_at) in entries {
        println!(
            "{}  {:<10} {:<22} {}",
            ready_at.to_rfc3339(),
            task.priority.to_string(),
            task.kind.to_string(),
            task.id
        );
    }
    Ok(())
}
