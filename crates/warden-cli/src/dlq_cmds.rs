//! Dead-letter queue and retention commands.

use anyhow::Result;
use chrono::{Duration, Utc};

use crate::config::WardenConfig;
use crate::task_cmds::connect;

pub async fn list(config: &WardenConfig) -> Result<()> {
    let orchestrator = connect(config).await?;
    let letters = orchestrator.store().dead_letters().await?;
    if letters.is_empty() {
        println!("dead-letter queue is empty");
        return Ok(());
    }
    for letter in letters {
        let tag = letter
            .task
            .error_tag
            .map(|t| t.to_string())
            .unwrap_or_else(|| "-".to_owned());
        println!(
            "{}  {:<22} retries {}/{}  [{}] {}",
            letter.task.id,
            letter.task.kind.to_string(),
            letter.task.retry_count,
            letter.task.max_retries,
            tag,
            letter.task.error.as_deref().unwrap_or(""),
        );
    }
    Ok(())
}

pub async fn requeue(config: &WardenConfig, max_age_hours: u64) -> Result<()> {
    let orchestrator = connect(config).await?;
    let readmitted = orchestrator
        .store()
        .requeue_from_dead_letter(Duration::hours(max_age_hours as i64))
        .await?;
    println!("requeued {} task(s)", readmitted.len());
    for task_id in readmitted {
        println!("  {task_id}");
    }
    Ok(())
}

pub async fn prune(config: &WardenConfig) -> Result<()> {
    let orchestrator = connect(config).await?;
    let now = Utc::now();
    let store = orchestrator.store();

    let tasks = store
        .prune_terminal(now - Duration::hours(config.core.terminal_task_retention_h as i64))
        .await?;
    let letters = store
        .prune_dead_letters(now - Duration::hours(config.core.dead_letter_retention_h as i64))
        .await?;
    println!("pruned {tasks} terminal task(s), {letters} dead letter(s)");
    Ok(())
}
