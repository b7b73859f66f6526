//! Orchestrator: the public surface of the core.
//!
//! Owns task records end to end: submission, workflow expansion and
//! coordination, dependency resolution, completion/failure handling with
//! retry scheduling, cancellation with a grace window, and the background
//! maintenance documented in [`sweeper`].
//!
//! Every mutation funnels through the store's optimistic-locked transition
//! so concurrent reporters (worker callbacks, sweepers, CLI cancellation)
//! cannot produce a state outside the task state machine.

pub mod sweeper;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use warden_store::models::{ErrorTag, Task, TaskStatus};
use warden_store::{StoreError, TaskStore, TransitionFields};

use crate::comms::{
    CommunicationHub, CommunicationStats, CoordinationOutcome, Message, MessagePriority,
    MessageType, ProtocolMatrix, Recipient, WireEnvelope,
};
use crate::config::CoreConfig;
use crate::dispatcher::Dispatcher;
use crate::history::{lineage_key, ExecutionHistory, ExecutionRecord};
use crate::registry::{CapabilityRegistry, WorkerCapability, WorkerInstance};
use crate::resources::ResourceMonitor;
use crate::retry;
use crate::schedule;
use crate::state::{check_dependencies, dispatch, DependencyStatus};
use crate::workflow::{expand_workflow, WorkflowDefinition};

/// Worker-reported result of a successful run.
#[derive(Debug, Clone, Default)]
pub struct CompletionReport {
    pub output: Option<serde_json::Value>,
    pub items_collected: u64,
    pub resource_usage: HashMap<String, f64>,
}

/// Outcome of a cancellation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelResult {
    /// The task was cancelled on the spot.
    Cancelled,
    /// The task is with a worker; a CancelRequest went out and the grace
    /// window is running.
    CancelRequested,
    /// The task had already reached a terminal state.
    AlreadyTerminal,
    NotFound,
}

/// Result of submitting a workflow.
#[derive(Debug, Clone)]
pub struct WorkflowSubmission {
    pub workflow_id: Uuid,
    pub task_ids: Vec<Uuid>,
    /// Present when the workflow declared coordination participants.
    pub coordination: Option<CoordinationOutcome>,
}

/// Point-in-time view of the whole system.
#[derive(Debug, Clone)]
pub struct OrchestratorStatus {
    pub queue_depths: std::collections::BTreeMap<warden_store::models::TaskPriority, usize>,
    pub workers_total: usize,
    pub workers_active: usize,
    pub active_tasks: usize,
    pub dead_letters: usize,
}

struct WorkflowWatch {
    timeout: Duration,
    /// Set when the workflow's first task starts running.
    deadline: Option<DateTime<Utc>>,
}

pub struct Orchestrator {
    store: Arc<dyn TaskStore>,
    registry: Arc<CapabilityRegistry>,
    hub: Arc<CommunicationHub>,
    resources: Arc<ResourceMonitor>,
    history: Arc<ExecutionHistory>,
    config: CoreConfig,
    pending_cancels: Mutex<HashMap<Uuid, DateTime<Utc>>>,
    workflow_watches: Mutex<HashMap<String, WorkflowWatch>>,
    cancel_token: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn TaskStore>, config: CoreConfig) -> Self {
        let registry = Arc::new(CapabilityRegistry::new());
        let hub = Arc::new(CommunicationHub::new(
            Arc::clone(&registry),
            ProtocolMatrix::with_defaults(),
            config.default_message_response_timeout_s,
        ));
        Self {
            store,
            registry,
            hub,
            resources: Arc::new(ResourceMonitor::new()),
            history: Arc::new(ExecutionHistory::new()),
            config,
            pending_cancels: Mutex::new(HashMap::new()),
            workflow_watches: Mutex::new(HashMap::new()),
            cancel_token: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<CommunicationHub> {
        &self.hub
    }

    pub fn resources(&self) -> &Arc<ResourceMonitor> {
        &self.resources
    }

    pub fn history(&self) -> &Arc<ExecutionHistory> {
        &self.history
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    fn cancels(&self) -> MutexGuard<'_, HashMap<Uuid, DateTime<Utc>>> {
        self.pending_cancels.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn watches(&self) -> MutexGuard<'_, HashMap<String, WorkflowWatch>> {
        self.workflow_watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------
    // Submission surface
    // -----------------------------------------------------------------

    /// Submit a task. Returns its id; duplicate ids are rejected so the
    /// call is idempotent by task id.
    pub async fn submit(&self, mut task: Task) -> Result<Uuid> {
        if task.tenant_id.is_empty() {
            bail!("task {} has no tenant", task.id);
        }

        // Dependencies must exist and stay inside the tenant.
        for dep_id in &task.dependencies {
            let dep = self
                .store
                .get(*dep_id)
                .await?
                .with_context(|| format!("unknown dependency {dep_id}"))?;
            if dep.tenant_id != task.tenant_id {
                bail!(
                    "dependency {dep_id} belongs to tenant {}, task {} to {}",
                    dep.tenant_id,
                    task.id,
                    task.tenant_id
                );
            }
        }

        task.status = TaskStatus::Pending;
        let task_id = task.id;
        let priority = task.priority;
        let ready_at = task.scheduled_at.unwrap_or_else(Utc::now);

        self.store.insert(task.clone()).await?;

        match check_dependencies(self.store.as_ref(), &task).await? {
            DependencyStatus::Satisfied => {
                dispatch::enqueue_task(self.store.as_ref(), task_id, priority, ready_at).await?;
            }
            DependencyStatus::Waiting => {
                dispatch::hold_for_dependencies(self.store.as_ref(), task_id).await?;
            }
            DependencyStatus::Failed(dep_id) => {
                dispatch::cancel_task(
                    self.store.as_ref(),
                    task_id,
                    TaskStatus::Pending,
                    TransitionFields::with_error(
                        ErrorTag::DependencyFailed,
                        format!("dependency {dep_id} failed before submission"),
                    ),
                )
                .await?;
            }
        }

        info!(task_id = %task_id, kind = %task.kind, priority = %priority, "task submitted");
        Ok(task_id)
    }

    /// Expand and submit a workflow.
    ///
    /// When the definition names coordination participants, a two-phase
    /// round runs first; anything short of [`CoordinationOutcome::Coordinated`]
    /// submits nothing.
    pub async fn submit_workflow(
        &self,
        definition: &WorkflowDefinition,
    ) -> Result<WorkflowSubmission> {
        let workflow_id = definition.id;
        let mut coordination = None;

        if !definition.participants.is_empty() {
            let outcome = self
                .hub
                .coordinate(
                    &workflow_id.to_string(),
                    &definition.participants,
                    self.config.default_message_response_timeout_s,
                    StdDuration::from_secs(60),
                )
                .await;
            coordination = Some(outcome);
            if outcome != CoordinationOutcome::Coordinated {
                warn!(
                    workflow_id = %workflow_id,
                    outcome = ?outcome,
                    "workflow coordination did not succeed; nothing submitted"
                );
                return Ok(WorkflowSubmission {
                    workflow_id,
                    task_ids: Vec::new(),
                    coordination,
                });
            }
        }

        if let Some(minutes) = definition.timeout_minutes {
            self.watches().insert(
                workflow_id.to_string(),
                WorkflowWatch {
                    timeout: Duration::minutes(minutes as i64),
                    deadline: None,
                },
            );
        }

        let tasks = expand_workflow(definition);
        let mut task_ids = Vec::with_capacity(tasks.len());
        for task in tasks {
            task_ids.push(self.submit(task).await?);
        }

        info!(
            workflow_id = %workflow_id,
            tasks = task_ids.len(),
            "workflow submitted"
        );
        Ok(WorkflowSubmission {
            workflow_id,
            task_ids,
            coordination,
        })
    }

    // -----------------------------------------------------------------
    // Worker surface
    // -----------------------------------------------------------------

    /// Register a worker: registry record, hub subscription, and a
    /// CapabilityAnnounce broadcast. The returned receiver is the worker's
    /// message feed.
    pub async fn register_worker(
        &self,
        instance: WorkerInstance,
        capability: WorkerCapability,
    ) -> mpsc::Receiver<WireEnvelope> {
        let instance_id = instance.instance_id.clone();
        let worker_kind = instance.worker_kind.clone();
        let announce_payload = serde_json::json!({
            "instance_id": instance_id,
            "worker_kind": worker_kind,
            "tenant_id": instance.tenant_id,
            "max_capacity": instance.max_capacity,
            "capability": capability,
        });

        self.registry.register(instance, capability);
        let receiver = self.hub.register_worker(&worker_kind, &instance_id);

        let announce = Message::new(
            worker_kind.clone(),
            Recipient::Broadcast,
            MessageType::CapabilityAnnounce,
            MessagePriority::Normal,
        )
        .with_payload(announce_payload);
        if let Err(err) = self.hub.send(&announce) {
            warn!(instance_id = %instance_id, error = %err, "capability announce failed");
        }

        info!(instance_id = %instance_id, worker_kind = %worker_kind, "worker registered");
        receiver
    }

    pub fn unregister_worker(&self, instance_id: &str) {
        self.hub.unregister_worker(instance_id);
        self.registry.unregister(instance_id);
        info!(instance_id = %instance_id, "worker unregistered");
    }

    /// Idempotent heartbeat keyed by instance id.
    pub fn heartbeat(
        &self,
        instance_id: &str,
        load: u32,
        health: warden_store::models::WorkerHealth,
    ) -> Result<()> {
        self.registry.heartbeat(instance_id, load, health)
    }

    /// Worker acknowledgment of a delivered message.
    ///
    /// An ack of a TaskRequest is the worker accepting the task: the task
    /// moves `assigned -> running` and the workflow deadline starts if this
    /// is the workflow's first running task. An ack of a CancelRequest
    /// finalizes the cancellation immediately.
    pub async fn ack(&self, message_id: Uuid) -> Result<()> {
        let Some(message) = self.hub.ack(message_id) else {
            // Unknown or repeated ack: a no-op by contract.
            return Ok(());
        };

        let task_id = message
            .context
            .get("task_id")
            .and_then(|v| serde_json::from_value::<Uuid>(v.clone()).ok());

        match message.message_type {
            MessageType::TaskRequest => {
                let Some(task_id) = task_id else {
                    return Ok(());
                };
                match dispatch::start_task(self.store.as_ref(), task_id).await {
                    Ok(task) => {
                        self.mark_workflow_started(&task);
                        debug!(task_id = %task_id, "task running");
                    }
                    Err(StoreError::StatusConflict { actual, .. }) => {
                        debug!(task_id = %task_id, status = %actual, "late task-request ack ignored");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            MessageType::CancelRequest => {
                if let Some(task_id) = task_id {
                    self.finalize_cancel(task_id).await?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn mark_workflow_started(&self, task: &Task) {
        let Some(correlation) = &task.correlation_id else {
            return;
        };
        let mut watches = self.watches();
        if let Some(watch) = watches.get_mut(correlation) {
            if watch.deadline.is_none() {
                watch.deadline = Some(Utc::now() + watch.timeout);
            }
        }
    }

    // -----------------------------------------------------------------
    // Completion / failure
    // -----------------------------------------------------------------

    /// Record a successful run.
    ///
    /// Idempotent: reporting completion on an already-completed task is a
    /// no-op. Reports racing a cancellation or timeout are dropped.
    pub async fn report_completion(&self, task_id: Uuid, report: CompletionReport) -> Result<()> {
        let task = self
            .store
            .get(task_id)
            .await?
            .with_context(|| format!("task {task_id} not found"))?;

        let task = match task.status {
            TaskStatus::Completed => return Ok(()),
            TaskStatus::Running => task,
            // The worker finished before its TaskRequest ack was
            // processed; pull the task through `running` first.
            TaskStatus::Assigned => {
                let started = dispatch::start_task(self.store.as_ref(), task_id).await?;
                self.mark_workflow_started(&started);
                started
            }
            other => {
                debug!(task_id = %task_id, status = %other, "completion report ignored");
                return Ok(());
            }
        };

        let now = Utc::now();
        let duration = task
            .started_at
            .map(|started| (now - started).num_milliseconds() as f64 / 1000.0);

        let completed = dispatch::complete_task(
            self.store.as_ref(),
            task_id,
            report.output.clone(),
            duration,
        )
        .await?;

        if let Some(worker) = &task.assigned_worker {
            self.registry.release(worker, task_id, true, duration);
        }
        self.resources.record_execution_end(task_id);
        self.history.record(
            &lineage_key(&completed),
            ExecutionRecord {
                task_id,
                started_at: task.started_at.unwrap_or(now),
                duration_secs: duration.unwrap_or_default(),
                success: true,
                error: None,
                items_collected: report.items_collected,
                resource_usage: report.resource_usage.clone(),
            },
        );

        info!(
            task_id = %task_id,
            duration_secs = duration.unwrap_or_default(),
            "task completed"
        );

        self.publish_context_update(&completed, &report);
        self.resolve_dependents(task_id).await?;
        self.reschedule_recurring(&completed).await?;
        Ok(())
    }

    fn publish_context_update(&self, task: &Task, report: &CompletionReport) {
        let update = Message::new(
            "orchestrator",
            Recipient::Broadcast,
            MessageType::ContextUpdate,
            MessagePriority::Low,
        )
        .with_payload(serde_json::json!({
            "task_id": task.id,
            "kind": task.kind,
            "output": report.output,
            "items_collected": report.items_collected,
        }));
        let update = match &task.correlation_id {
            Some(correlation) => update.with_correlation(correlation.clone()),
            None => update,
        };
        if let Err(err) = self.hub.send(&update) {
            warn!(task_id = %task.id, error = %err, "context update failed");
        }
    }

    /// Record a failed run and route it through the retry engine.
    pub async fn report_failure(
        &self,
        task_id: Uuid,
        tag: ErrorTag,
        message: &str,
        retry_recommended: Option<bool>,
    ) -> Result<()> {
        let task = self
            .store
            .get(task_id)
            .await?
            .with_context(|| format!("task {task_id} not found"))?;

        let task = match task.status {
            TaskStatus::Running => task,
            TaskStatus::Assigned => {
                let started = dispatch::start_task(self.store.as_ref(), task_id).await?;
                self.mark_workflow_started(&started);
                started
            }
            other => {
                debug!(task_id = %task_id, status = %other, "failure report ignored");
                return Ok(());
            }
        };

        if let Some(worker) = &task.assigned_worker {
            self.registry.record_error(worker, message);
            self.registry.release(worker, task_id, false, None);
        }
        self.resources.record_execution_end(task_id);

        let now = Utc::now();
        self.history.record(
            &lineage_key(&task),
            ExecutionRecord {
                task_id,
                started_at: task.started_at.unwrap_or(now),
                duration_secs: task
                    .started_at
                    .map(|started| (now - started).num_milliseconds() as f64 / 1000.0)
                    .unwrap_or_default(),
                success: false,
                error: Some(message.to_owned()),
                items_collected: 0,
                resource_usage: HashMap::new(),
            },
        );

        self.handle_failure(&task, TaskStatus::Running, tag, message, retry_recommended)
            .await
    }

    /// Shared failure routing for worker reports and timeouts.
    ///
    /// `from` is the state the task currently sits in (`running` for
    /// reports, `timeout` for the sweeper).
    pub(crate) async fn handle_failure(
        &self,
        task: &Task,
        from: TaskStatus,
        tag: ErrorTag,
        message: &str,
        retry_recommended: Option<bool>,
    ) -> Result<()> {
        let mut policy = task.retry_policy.clone().unwrap_or_default();
        // The task record's budget is authoritative over the policy's.
        policy.max_attempts = task.max_retries;

        if retry::should_retry(&policy, task.retry_count, tag, retry_recommended) {
            let attempt = task.retry_count + 1;
            let now = Utc::now();
            let next_attempt_at = retry::next_attempt_at(&policy, attempt, now);

            dispatch::retry_task(
                self.store.as_ref(),
                task.id,
                from,
                tag,
                message,
                next_attempt_at,
            )
            .await?;
            self.store
                .enqueue(task.id, task.priority, next_attempt_at)
                .await?;

            info!(
                task_id = %task.id,
                attempt,
                next_attempt_at = %next_attempt_at,
                tag = %tag,
                "task scheduled for retry"
            );
        } else {
            dispatch::fail_task(self.store.as_ref(), task.id, from, tag, message).await?;
            self.store.move_to_dead_letter(task.id).await?;
            warn!(task_id = %task.id, tag = %tag, error = message, "task failed terminally");
            self.cascade_dependency_failure(task.id).await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Dependency resolution
    // -----------------------------------------------------------------

    /// Re-evaluate tasks waiting on a freshly-terminal dependency.
    async fn resolve_dependents(&self, dep_id: Uuid) -> Result<()> {
        let waiting = self.store.dependents_waiting(dep_id).await?;
        for dependent in waiting {
            match check_dependencies(self.store.as_ref(), &dependent).await? {
                DependencyStatus::Satisfied => {
                    dispatch::release_dependencies(self.store.as_ref(), dependent.id).await?;
                    dispatch::enqueue_task(
                        self.store.as_ref(),
                        dependent.id,
                        dependent.priority,
                        Utc::now(),
                    )
                    .await?;
                    debug!(task_id = %dependent.id, "dependencies satisfied, task released");
                }
                DependencyStatus::Waiting => {}
                DependencyStatus::Failed(failed_dep) => {
                    self.cancel_dependent(&dependent, failed_dep).await?;
                }
            }
        }
        Ok(())
    }

    /// Cancel every transitive dependent of a failed or cancelled task.
    async fn cascade_dependency_failure(&self, failed_id: Uuid) -> Result<()> {
        let mut frontier = vec![failed_id];
        while let Some(dep_id) = frontier.pop() {
            for dependent in self.store.dependents_waiting(dep_id).await? {
                self.cancel_dependent(&dependent, dep_id).await?;
                frontier.push(dependent.id);
            }
        }
        Ok(())
    }

    async fn cancel_dependent(&self, dependent: &Task, failed_dep: Uuid) -> Result<()> {
        let result = dispatch::cancel_task(
            self.store.as_ref(),
            dependent.id,
            dependent.status,
            TransitionFields::with_error(
                ErrorTag::DependencyFailed,
                format!("dependency {failed_dep} failed"),
            ),
        )
        .await;
        match result {
            Ok(_) => {
                info!(
                    task_id = %dependent.id,
                    dependency = %failed_dep,
                    "task cancelled: dependency failed"
                );
                Ok(())
            }
            Err(err) if err.is_conflict() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    // -----------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------

    /// Cancel a task.
    ///
    /// Pending/queued/waiting work is cancelled immediately. Assigned or
    /// running work gets a best-effort CancelRequest; if the worker does
    /// not acknowledge within the grace window the sweeper forces the
    /// cancellation anyway.
    pub async fn cancel(&self, task_id: Uuid) -> Result<CancelResult> {
        let Some(task) = self.store.get(task_id).await? else {
            return Ok(CancelResult::NotFound);
        };

        if task.status.is_terminal() {
            return Ok(CancelResult::AlreadyTerminal);
        }

        match task.status {
            TaskStatus::Pending
            | TaskStatus::Queued
            | TaskStatus::WaitingDeps
            | TaskStatus::Retrying
            | TaskStatus::Timeout => {
                self.store.remove_queued(task_id).await?;
                dispatch::cancel_task(
                    self.store.as_ref(),
                    task_id,
                    task.status,
                    TransitionFields::none(),
                )
                .await?;
                self.cascade_dependency_failure(task_id).await?;
                info!(task_id = %task_id, "task cancelled");
                Ok(CancelResult::Cancelled)
            }
            TaskStatus::Assigned | TaskStatus::Running => {
                if let Some(worker) = &task.assigned_worker {
                    let request = Message::new(
                        "orchestrator",
                        Recipient::instance(worker.clone()),
                        MessageType::CancelRequest,
                        MessagePriority::High,
                    )
                    .with_payload(serde_json::json!({"task_id": task_id}))
                    .with_context(serde_json::json!({"task_id": task_id}))
                    .expecting_response(self.config.cancel_grace_s);
                    if let Err(err) = self.hub.send(&request) {
                        warn!(task_id = %task_id, error = %err, "cancel request failed to send");
                    }
                }
                self.cancels().insert(task_id, Utc::now());
                info!(task_id = %task_id, "cancel requested, grace window running");
                Ok(CancelResult::CancelRequested)
            }
            // Terminal states returned above.
            _ => Ok(CancelResult::AlreadyTerminal),
        }
    }

    /// Force a cancellation through, releasing worker capacity.
    pub(crate) async fn finalize_cancel(&self, task_id: Uuid) -> Result<()> {
        self.cancels().remove(&task_id);
        let Some(task) = self.store.get(task_id).await? else {
            return Ok(());
        };
        if task.status.is_terminal() {
            return Ok(());
        }

        self.store.remove_queued(task_id).await?;
        let result = dispatch::cancel_task(
            self.store.as_ref(),
            task_id,
            task.status,
            TransitionFields::none(),
        )
        .await;
        match result {
            Ok(_) => {}
            Err(err) if err.is_conflict() => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        if let Some(worker) = &task.assigned_worker {
            self.registry.release(worker, task_id, false, None);
        }
        self.resources.record_execution_end(task_id);
        self.cascade_dependency_failure(task_id).await?;
        info!(task_id = %task_id, "cancellation finalized");
        Ok(())
    }

    // -----------------------------------------------------------------
    // Recurring tasks
    // -----------------------------------------------------------------

    /// Spawn the successor run of a recurring task.
    ///
    /// Recurrence is modeled as a chain of task records sharing a lineage
    /// (the correlation id), so every run keeps its own auditable record.
    async fn reschedule_recurring(&self, task: &Task) -> Result<()> {
        let Some(cfg) = &task.schedule else {
            return Ok(());
        };
        if !cfg.is_recurring() {
            return Ok(());
        }

        let lineage = lineage_key(task);
        let records = self.history.for_lineage(&lineage);
        let next_at = schedule::next_run(
            cfg,
            Utc::now(),
            &records,
            &self.config.blackout_check_tz,
        );

        let mut successor = task.clone();
        successor.id = Uuid::new_v4();
        successor.status = TaskStatus::Pending;
        successor.assigned_worker = None;
        successor.created_at = Utc::now();
        successor.started_at = None;
        successor.completed_at = None;
        successor.output = None;
        successor.error = None;
        successor.error_tag = None;
        successor.retry_count = 0;
        successor.actual_duration_secs = None;
        successor.scheduled_at = Some(next_at);
        successor.correlation_id = Some(lineage);
        successor.dependencies = Vec::new();

        let successor_id = self.submit(successor).await?;
        debug!(
            task_id = %task.id,
            successor_id = %successor_id,
            next_run = %next_at,
            "recurring task rescheduled"
        );
        Ok(())
    }

    // -----------------------------------------------------------------
    // Read surface
    // -----------------------------------------------------------------

    pub async fn task_status(&self, task_id: Uuid) -> Result<Option<Task>> {
        Ok(self.store.get(task_id).await?)
    }

    /// Queue entries due within the horizon, soonest first.
    pub async fn upcoming_tasks(
        &self,
        horizon_hours: u64,
    ) -> Result<Vec<(Task, DateTime<Utc>)>> {
        let until = Utc::now() + Duration::hours(horizon_hours as i64);
        Ok(self.store.upcoming(until, 100).await?)
    }

    pub async fn status_snapshot(&self) -> Result<OrchestratorStatus> {
        let (workers_total, workers_active) = self.registry.worker_counts();
        Ok(OrchestratorStatus {
            queue_depths: self.store.queue_depths().await?,
            workers_total,
            workers_active,
            active_tasks: self.resources.active_tasks(),
            dead_letters: self.store.dead_letters().await?.len(),
        })
    }

    pub fn communication_stats(&self) -> CommunicationStats {
        self.hub.stats()
    }

    /// Record a worker's answer in an open coordination round.
    pub fn record_coordination_response(
        &self,
        coordination_id: Uuid,
        worker_kind: &str,
        ready: bool,
    ) {
        self.hub
            .record_coordination_response(coordination_id, worker_kind, ready);
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Start the background machinery: dispatcher loop, delivery sweeper,
    /// maintenance sweeper, resource sampler, health decay, retention
    /// pruning, and the hourly schedule optimizer.
    pub fn start(self: &Arc<Self>) {
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            Arc::clone(&self.hub),
            Arc::clone(&self.resources),
            self.config.clone(),
        );
        let cancel = self.cancel_token.clone();
        let mut handles = self.background.lock().unwrap_or_else(|e| e.into_inner());
        handles.push(tokio::spawn(async move {
            dispatcher.run(cancel).await;
        }));
        handles.push(tokio::spawn(sweeper::run_delivery_sweeper(
            Arc::clone(self),
            self.cancel_token.clone(),
        )));
        handles.push(tokio::spawn(sweeper::run_maintenance(
            Arc::clone(self),
            self.cancel_token.clone(),
        )));
        handles.push(tokio::spawn(sweeper::run_resource_sampler(
            Arc::clone(self),
            self.cancel_token.clone(),
        )));
        handles.push(tokio::spawn(sweeper::run_health_decay(
            Arc::clone(self),
            self.cancel_token.clone(),
        )));
        handles.push(tokio::spawn(sweeper::run_retention_pruner(
            Arc::clone(self),
            self.cancel_token.clone(),
        )));
        handles.push(tokio::spawn(sweeper::run_schedule_optimizer(
            Arc::clone(self),
            self.cancel_token.clone(),
        )));
        info!("orchestrator started");
    }

    /// Stop background tasks and wait for them to drain.
    pub async fn shutdown(&self) {
        self.cancel_token.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.background.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("orchestrator stopped");
    }
}
