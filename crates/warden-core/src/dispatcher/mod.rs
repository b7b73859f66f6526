//! Dispatcher: turns queued tasks into running tasks on the best
//! available worker.
//!
//! One loop per process serializes matching decisions; the loop never
//! awaits worker execution, only the store and the hub. Each tick claims a
//! bounded batch of due entries and either dispatches them or defers them
//! back onto the queue (blackout exit, resource backoff, no-worker
//! backoff). Every Nth tick, if the top non-empty queue has been busy past
//! the starvation window, the scan direction flips so low-priority work
//! still gets through.

pub mod select;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_store::models::{Task, TaskPriority, TaskStatus};
use warden_store::{ScanOrder, StoreError, TaskStore};

use crate::comms::{CommunicationHub, Message, MessagePriority, MessageType, Recipient};
use crate::config::CoreConfig;
use crate::registry::CapabilityRegistry;
use crate::resources::ResourceMonitor;
use crate::schedule;
use crate::state::dispatch;

/// Message priority a task's dispatch request travels at.
fn message_priority(priority: TaskPriority) -> MessagePriority {
    match priority {
        TaskPriority::Critical => MessagePriority::Critical,
        TaskPriority::High => MessagePriority::High,
        TaskPriority::Medium => MessagePriority::Normal,
        TaskPriority::Low | TaskPriority::Background => MessagePriority::Low,
    }
}

/// What a single claim attempt did.
enum TickAction {
    Dispatched,
    Deferred,
    Skipped,
}

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    registry: Arc<CapabilityRegistry>,
    hub: Arc<CommunicationHub>,
    resources: Arc<ResourceMonitor>,
    config: CoreConfig,
}

struct StarvationTracker {
    /// The top non-empty priority and since when it has stayed non-empty.
    busy: Option<(TaskPriority, Instant)>,
}

impl StarvationTracker {
    fn new() -> Self {
        Self { busy: None }
    }

    /// Update with this tick's queue depths; returns true when the top
    /// queue has been continuously non-empty past `window` while lower
    /// priorities also hold work.
    fn update(
        &mut self,
        depths: &std::collections::BTreeMap<TaskPriority, usize>,
        window: Duration,
    ) -> bool {
        let top = depths
            .iter()
            .find(|(_, depth)| **depth > 0)
            .map(|(priority, _)| *priority);

        let Some(top) = top else {
            self.busy = None;
            return false;
        };

        let since = match self.busy {
            Some((priority, since)) if priority == top => since,
            _ => {
                self.busy = Some((top, Instant::now()));
                return false;
            }
        };

        let lower_has_work = depths
            .iter()
            .any(|(priority, depth)| *priority > top && *depth > 0);
        since.elapsed() >= window && lower_has_work
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        registry: Arc<CapabilityRegistry>,
        hub: Arc<CommunicationHub>,
        resources: Arc<ResourceMonitor>,
        config: CoreConfig,
    ) -> Self {
        Self {
            store,
            registry,
            hub,
            resources,
            config,
        }
    }

    /// Run the dispatch loop until cancellation.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.dispatcher_tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut tracker = StarvationTracker::new();
        let mut tick: u64 = 0;

        info!(
            tick_ms = self.config.dispatcher_tick_ms,
            max_workers = self.config.max_workers,
            "dispatcher started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("dispatcher stopped");
                    return;
                }
                _ = interval.tick() => {
                    tick += 1;
                    if let Err(err) = self.tick(tick, &mut tracker).await {
                        warn!(error = %err, "dispatcher tick failed, backing off");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    async fn tick(&self, tick: u64, tracker: &mut StarvationTracker) -> Result<()> {
        let depths = self
            .store
            .queue_depths()
            .await
            .context("failed to read queue depths")?;
        // Keep the monitor's queued count current for the resource gate.
        self.resources
            .record_queue_depth(depths.values().sum());

        let starving = tracker.update(
            &depths,
            Duration::from_secs(self.config.antistarvation_window_s),
        );
        let scan_tick = self.config.antistarvation_scan_every_n_ticks.max(1);
        let order = if starving && tick % scan_tick == 0 {
            debug!("anti-starvation scan: claiming lowest priority first");
            ScanOrder::LowestFirst
        } else {
            ScanOrder::HighestFirst
        };

        for _ in 0..self.config.dispatch_batch_per_tick.max(1) {
            // Respect the global in-flight ceiling.
            let in_flight: u32 = self
                .registry
                .instances()
                .iter()
                .map(|i| i.capacity_used)
                .sum();
            if in_flight as usize >= self.config.max_workers {
                break;
            }

            let now = Utc::now();
            let Some(task) = self.store.pop_due(now, order).await? else {
                break;
            };

            match self.dispatch_one(task).await? {
                TickAction::Dispatched | TickAction::Deferred => {}
                TickAction::Skipped => continue,
            }
        }
        Ok(())
    }

    /// Try to place one claimed task; defers put the entry back with a new
    /// ready time.
    async fn dispatch_one(&self, task: Task) -> Result<TickAction> {
        let now = Utc::now();

        // A retrying task's queue entry comes due at its next-attempt
        // time; claiming it finalizes `retrying -> queued`.
        let task = if task.status == TaskStatus::Retrying {
            match self
                .store
                .transition(
                    task.id,
                    TaskStatus::Retrying,
                    TaskStatus::Queued,
                    warden_store::TransitionFields::none(),
                )
                .await
            {
                Ok(task) => task,
                Err(StoreError::StatusConflict { actual, .. }) => {
                    debug!(task_id = %task.id, status = %actual, "retry entry lost its race");
                    return Ok(TickAction::Skipped);
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            task
        };

        // The entry may have outlived its validity (cancelled or already
        // re-dispatched elsewhere).
        if task.status != TaskStatus::Queued {
            debug!(task_id = %task.id, status = %task.status, "skipping stale queue entry");
            return Ok(TickAction::Skipped);
        }

        let default_tz = self.config.blackout_check_tz.as_str();
        if let Some(cfg) = &task.schedule {
            // Blackout gate: park until the window exits.
            if schedule::in_blackout(cfg, now, default_tz) {
                let ready_at = schedule::next_blackout_exit(cfg, now, default_tz);
                debug!(task_id = %task.id, ready_at = %ready_at, "deferring for blackout window");
                self.store.enqueue(task.id, task.priority, ready_at).await?;
                return Ok(TickAction::Deferred);
            }

            // Resource gate.
            let snapshot = self.resources.snapshot();
            let cpu_short = cfg
                .min_cpu_available
                .is_some_and(|min| snapshot.cpu_available_pct < min);
            let memory_short = cfg
                .min_memory_available
                .is_some_and(|min| snapshot.memory_available_pct < min);
            if cpu_short || memory_short {
                // Backlog pressure stretches the defer: a saturated system
                // with a deep queue will not recover within one window.
                let mut defer_secs = self.config.resource_defer_s;
                if snapshot.queued_tasks > self.config.max_workers {
                    defer_secs = defer_secs.saturating_mul(2);
                }
                let ready_at = now + chrono::Duration::seconds(defer_secs as i64);
                debug!(
                    task_id = %task.id,
                    cpu = snapshot.cpu_available_pct,
                    memory = snapshot.memory_available_pct,
                    queued = snapshot.queued_tasks,
                    defer_secs,
                    "deferring for resource saturation"
                );
                self.store.enqueue(task.id, task.priority, ready_at).await?;
                return Ok(TickAction::Deferred);
            }

            // Per-kind concurrency cap.
            if let Some(target) = &task.target_worker_kind {
                if self.registry.load_for_kind(target) >= cfg.max_concurrent {
                    let ready_at =
                        now + chrono::Duration::seconds(self.config.no_worker_defer_s as i64);
                    self.store.enqueue(task.id, task.priority, ready_at).await?;
                    return Ok(TickAction::Deferred);
                }
            }
        }

        let candidates = self.registry.candidates_for(
            task.kind,
            &task.tenant_id,
            task.target_worker_kind.as_deref(),
        );
        let Some(best) = select::select_best(candidates) else {
            let ready_at = now + chrono::Duration::seconds(self.config.no_worker_defer_s as i64);
            debug!(task_id = %task.id, kind = %task.kind, "no capable worker, deferring");
            self.store.enqueue(task.id, task.priority, ready_at).await?;
            return Ok(TickAction::Deferred);
        };

        // Reserve first so a concurrent tick cannot oversubscribe the
        // instance; roll the reservation back if the assignment loses a
        // race with cancellation.
        if let Err(err) = self.registry.reserve(&best.instance_id, task.id) {
            debug!(task_id = %task.id, error = %err, "reservation lost, deferring");
            let ready_at = now + chrono::Duration::seconds(self.config.no_worker_defer_s as i64);
            self.store.enqueue(task.id, task.priority, ready_at).await?;
            return Ok(TickAction::Deferred);
        }

        match dispatch::assign_task(self.store.as_ref(), task.id, &best.instance_id).await {
            Ok(_) => {}
            Err(StoreError::StatusConflict { actual, .. }) => {
                self.registry.release(&best.instance_id, task.id, false, None);
                debug!(task_id = %task.id, status = %actual, "assignment lost to a concurrent transition");
                return Ok(TickAction::Skipped);
            }
            Err(err) => {
                self.registry.release(&best.instance_id, task.id, false, None);
                return Err(err.into());
            }
        }

        self.resources.record_execution_start(task.id);

        let request = Message::new(
            "orchestrator",
            Recipient::instance(best.instance_id.clone()),
            MessageType::TaskRequest,
            message_priority(task.priority),
        )
        .with_payload(serde_json::json!({
            "task_id": task.id,
            "kind": task.kind,
            "payload": task.payload,
            "configuration": task.configuration,
            "timeout_secs": task.timeout_secs.unwrap_or(self.config.default_task_timeout_s),
            "attempt": task.retry_count + 1,
        }))
        .with_context(serde_json::json!({"task_id": task.id}))
        .expecting_response(self.config.default_message_response_timeout_s);
        let request = match &task.correlation_id {
            Some(correlation) => request.with_correlation(correlation.clone()),
            None => request,
        };

        let delivered = self.hub.send(&request)?;
        if delivered == 0 {
            warn!(
                task_id = %task.id,
                worker = %best.instance_id,
                "task request not delivered; timeout sweeper will reclaim"
            );
        }

        info!(
            task_id = %task.id,
            kind = %task.kind,
            worker = %best.instance_id,
            priority = %task.priority,
            "task dispatched"
        );
        Ok(TickAction::Dispatched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn depths(entries: &[(TaskPriority, usize)]) -> BTreeMap<TaskPriority, usize> {
        let mut map: BTreeMap<TaskPriority, usize> =
            TaskPriority::ALL.iter().map(|p| (*p, 0)).collect();
        for (priority, depth) in entries {
            map.insert(*priority, *depth);
        }
        map
    }

    #[test]
    fn starvation_requires_sustained_pressure_and_lower_work() {
        let mut tracker = StarvationTracker::new();
        let window = Duration::from_millis(0);

        // First observation only arms the tracker.
        assert!(!tracker.update(
            &depths(&[(TaskPriority::Critical, 3), (TaskPriority::Background, 1)]),
            window
        ));
        // Sustained (zero window) with lower-priority work: starving.
        assert!(tracker.update(
            &depths(&[(TaskPriority::Critical, 3), (TaskPriority::Background, 1)]),
            window
        ));
        // No lower-priority work: nothing to rescue.
        assert!(!tracker.update(&depths(&[(TaskPriority::Critical, 3)]), window));
    }

    #[test]
    fn starvation_resets_when_the_top_drains() {
        let mut tracker = StarvationTracker::new();
        let window = Duration::from_millis(0);

        tracker.update(
            &depths(&[(TaskPriority::Critical, 1), (TaskPriority::Low, 1)]),
            window,
        );
        // Critical drains; High becomes the top and the timer restarts.
        assert!(!tracker.update(
            &depths(&[(TaskPriority::High, 1), (TaskPriority::Low, 1)]),
            window
        ));
        assert!(tracker.update(
            &depths(&[(TaskPriority::High, 1), (TaskPriority::Low, 1)]),
            window
        ));
    }

    #[test]
    fn message_priority_mapping() {
        assert_eq!(
            message_priority(TaskPriority::Critical),
            MessagePriority::Critical
        );
        assert_eq!(message_priority(TaskPriority::Medium), MessagePriority::Normal);
        assert_eq!(
            message_priority(TaskPriority::Background),
            MessagePriority::Low
        );
    }
}
