//! Background maintenance.
//!
//! Separate loops, all cancellation-guarded: the 10 s delivery sweeper,
//! the 5 s maintenance pass (execution timeouts, cancel grace windows,
//! workflow deadlines), the 30 s resource sampler, the 60 s worker-health
//! decay, the hourly retention pruner, and the hourly adaptive-schedule
//! optimizer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use warden_store::models::{ErrorTag, ScheduleKind, TaskStatus};

use crate::history::{lineage_key, ExecutionRecord};
use crate::schedule::adaptive;
use crate::state::dispatch;

use super::Orchestrator;

const DELIVERY_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(10);
const MAINTENANCE_INTERVAL: StdDuration = StdDuration::from_secs(5);
const RESOURCE_SAMPLE_INTERVAL: StdDuration = StdDuration::from_secs(30);
const HEALTH_DECAY_INTERVAL: StdDuration = StdDuration::from_secs(60);
const RETENTION_INTERVAL: StdDuration = StdDuration::from_secs(3600);
const OPTIMIZER_INTERVAL: StdDuration = StdDuration::from_secs(3600);

/// Generic cancellable interval loop.
async fn run_interval<F, Fut>(period: StdDuration, cancel: CancellationToken, mut body: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => body().await,
        }
    }
}

pub async fn run_delivery_sweeper(orchestrator: Arc<Orchestrator>, cancel: CancellationToken) {
    run_interval(DELIVERY_SWEEP_INTERVAL, cancel, || {
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            orchestrator.hub.sweep(Utc::now());
        }
    })
    .await;
}

pub async fn run_maintenance(orchestrator: Arc<Orchestrator>, cancel: CancellationToken) {
    run_interval(MAINTENANCE_INTERVAL, cancel, || {
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            if let Err(err) = orchestrator.sweep_timeouts().await {
                warn!(error = %err, "timeout sweep failed");
            }
            if let Err(err) = orchestrator.sweep_cancel_grace().await {
                warn!(error = %err, "cancel-grace sweep failed");
            }
            if let Err(err) = orchestrator.sweep_workflow_deadlines().await {
                warn!(error = %err, "workflow deadline sweep failed");
            }
        }
    })
    .await;
}

pub async fn run_resource_sampler(orchestrator: Arc<Orchestrator>, cancel: CancellationToken) {
    run_interval(RESOURCE_SAMPLE_INTERVAL, cancel, || {
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            match orchestrator.store.queue_depths().await {
                Ok(depths) => {
                    let queued = depths.values().sum();
                    orchestrator.resources.record_queue_depth(queued);
                }
                Err(err) => warn!(error = %err, "queue depth sampling failed"),
            }
            orchestrator.resources.sample_system();
        }
    })
    .await;
}

pub async fn run_health_decay(orchestrator: Arc<Orchestrator>, cancel: CancellationToken) {
    run_interval(HEALTH_DECAY_INTERVAL, cancel, || {
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            let changes = orchestrator.registry.decay_health(
                Utc::now(),
                Duration::minutes(orchestrator.config.worker_degrade_after_min as i64),
                Duration::minutes(orchestrator.config.worker_unhealthy_after_min as i64),
            );
            for (instance_id, health) in changes {
                warn!(instance_id = %instance_id, health = %health, "worker health decayed");
            }
        }
    })
    .await;
}

pub async fn run_retention_pruner(orchestrator: Arc<Orchestrator>, cancel: CancellationToken) {
    run_interval(RETENTION_INTERVAL, cancel, || {
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            if let Err(err) = orchestrator.prune_retention().await {
                warn!(error = %err, "retention pruning failed");
            }
        }
    })
    .await;
}

pub async fn run_schedule_optimizer(orchestrator: Arc<Orchestrator>, cancel: CancellationToken) {
    run_interval(OPTIMIZER_INTERVAL, cancel, || {
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            match orchestrator.optimize_schedules().await {
                Ok(0) => {}
                Ok(updated) => info!(updated, "adaptive schedules optimized"),
                Err(err) => warn!(error = %err, "schedule optimization failed"),
            }
        }
    })
    .await;
}

impl Orchestrator {
    /// Time out running tasks past their execution deadline, and reclaim
    /// assigned tasks whose worker never acknowledged the request.
    pub async fn sweep_timeouts(&self) -> Result<()> {
        let now = Utc::now();

        for task in self.store.list_by_status(TaskStatus::Running).await? {
            let timeout = task
                .timeout_secs
                .unwrap_or(self.config.default_task_timeout_s);
            let anchor = task.started_at.unwrap_or(task.created_at);
            if now <= anchor + Duration::seconds(timeout as i64) {
                continue;
            }

            let timed_out = match dispatch::time_out_task(self.store.as_ref(), task.id).await {
                Ok(task) => task,
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err.into()),
            };
            warn!(task_id = %task.id, timeout_secs = timeout, "task timed out");

            if let Some(worker) = &timed_out.assigned_worker {
                self.registry.release(worker, task.id, false, None);
            }
            self.resources.record_execution_end(task.id);
            self.history.record(
                &lineage_key(&timed_out),
                ExecutionRecord {
                    task_id: task.id,
                    started_at: anchor,
                    duration_secs: (now - anchor).num_milliseconds() as f64 / 1000.0,
                    success: false,
                    error: Some("execution timeout".to_owned()),
                    items_collected: 0,
                    resource_usage: HashMap::new(),
                },
            );

            self.handle_failure(
                &timed_out,
                TaskStatus::Timeout,
                ErrorTag::Timeout,
                "execution timeout",
                None,
            )
            .await?;
        }

        // Assigned tasks whose TaskRequest was never acknowledged: force
        // them through the state chain so retry handling can take over.
        for task in self.store.list_by_status(TaskStatus::Assigned).await? {
            let timeout = task
                .timeout_secs
                .unwrap_or(self.config.default_task_timeout_s);
            let anchor = task.scheduled_at.unwrap_or(task.created_at);
            if now <= anchor + Duration::seconds(timeout as i64) {
                continue;
            }

            debug!(task_id = %task.id, "reclaiming unacknowledged assignment");
            if dispatch::start_task(self.store.as_ref(), task.id).await.is_err() {
                continue;
            }
            let timed_out = match dispatch::time_out_task(self.store.as_ref(), task.id).await {
                Ok(task) => task,
                Err(_) => continue,
            };
            if let Some(worker) = &timed_out.assigned_worker {
                self.registry.release(worker, task.id, false, None);
            }
            self.resources.record_execution_end(task.id);
            self.handle_failure(
                &timed_out,
                TaskStatus::Timeout,
                ErrorTag::Timeout,
                "worker never acknowledged the task request",
                None,
            )
            .await?;
        }

        Ok(())
    }

    /// Force cancellations whose grace window has elapsed without a
    /// worker acknowledgment.
    pub async fn sweep_cancel_grace(&self) -> Result<()> {
        let grace = Duration::seconds(self.config.cancel_grace_s as i64);
        let now = Utc::now();
        let expired: Vec<Uuid> = self
            .cancels()
            .iter()
            .filter(|(_, requested)| now - **requested > grace)
            .map(|(task_id, _)| *task_id)
            .collect();

        for task_id in expired {
            debug!(task_id = %task_id, "cancel grace expired, forcing cancellation");
            self.finalize_cancel(task_id).await?;
        }
        Ok(())
    }

    /// Cancel every non-terminal task of workflows past their deadline.
    pub async fn sweep_workflow_deadlines(&self) -> Result<()> {
        let now = Utc::now();
        let expired: Vec<String> = {
            let mut watches = self.watches();
            let expired: Vec<String> = watches
                .iter()
                .filter(|(_, watch)| watch.deadline.is_some_and(|deadline| now > deadline))
                .map(|(workflow, _)| workflow.clone())
                .collect();
            for workflow in &expired {
                watches.remove(workflow);
            }
            expired
        };

        for workflow in expired {
            warn!(workflow_id = %workflow, "workflow deadline expired, cancelling tasks");
            for task in self.store.list_by_correlation(&workflow).await? {
                if !task.status.is_terminal() {
                    self.finalize_cancel(task.id).await?;
                }
            }
        }
        Ok(())
    }

    /// Destroy terminal tasks and dead letters past their retention
    /// windows.
    pub async fn prune_retention(&self) -> Result<()> {
        let now = Utc::now();
        let terminal_cutoff =
            now - Duration::hours(self.config.terminal_task_retention_h as i64);
        let dlq_cutoff = now - Duration::hours(self.config.dead_letter_retention_h as i64);

        let pruned_tasks = self.store.prune_terminal(terminal_cutoff).await?;
        let pruned_letters = self.store.prune_dead_letters(dlq_cutoff).await?;
        if pruned_tasks > 0 || pruned_letters > 0 {
            info!(pruned_tasks, pruned_letters, "retention pruning done");
        }
        Ok(())
    }

    /// Rewrite adaptive schedules that have accumulated enough history.
    /// Returns the number of tasks updated.
    pub async fn optimize_schedules(&self) -> Result<usize> {
        let mut updated = 0;
        for status in [
            TaskStatus::Pending,
            TaskStatus::Queued,
            TaskStatus::WaitingDeps,
            TaskStatus::Retrying,
        ] {
            for task in self.store.list_by_status(status).await? {
                let Some(cfg) = &task.schedule else {
                    continue;
                };
                if cfg.kind != ScheduleKind::Adaptive {
                    continue;
                }
                let records = self.history.for_lineage(&lineage_key(&task));
                if let Some(optimized) = adaptive::optimize_schedule(cfg, &records) {
                    self.store.update_schedule(task.id, optimized).await?;
                    updated += 1;
                    debug!(task_id = %task.id, "schedule optimized from history");
                }
            }
        }
        Ok(updated)
    }
}
