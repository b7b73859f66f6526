//! Capability registry: the live table of connected worker instances and
//! the per-kind capability declarations.
//!
//! The registry is the exclusive owner of worker-instance records. Other
//! components read snapshots; capacity counters and heartbeat updates are
//! atomic per instance under the registry lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use warden_store::models::{TaskKind, WorkerHealth};

/// What a worker kind can do, declared at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerCapability {
    pub worker_kind: String,
    pub supported_tasks: Vec<TaskKind>,
    pub supported_platforms: Vec<String>,
    pub supported_frameworks: Vec<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(default = "default_execution_secs")]
    pub average_execution_secs: f64,
    /// Suitability per task kind, in [0, 1].
    #[serde(default)]
    pub specialization: HashMap<TaskKind, f64>,
    /// Soft routing hints: kinds this worker usually consumes output from.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Artifact names the worker produces.
    #[serde(default)]
    pub outputs: Vec<String>,
}

fn default_max_concurrent() -> u32 {
    3
}

fn default_execution_secs() -> f64 {
    60.0
}

impl WorkerCapability {
    pub fn new(worker_kind: impl Into<String>, supported_tasks: Vec<TaskKind>) -> Self {
        Self {
            worker_kind: worker_kind.into(),
            supported_tasks,
            supported_platforms: Vec::new(),
            supported_frameworks: Vec::new(),
            max_concurrent: default_max_concurrent(),
            average_execution_secs: default_execution_secs(),
            specialization: HashMap::new(),
            depends_on: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn accepts(&self, kind: TaskKind) -> bool {
        self.supported_tasks.contains(&kind)
    }

    /// Specialization score for a kind, defaulting to 0.5 when undeclared.
    pub fn specialization_for(&self, kind: TaskKind) -> f64 {
        self.specialization
            .get(&kind)
            .copied()
            .unwrap_or(0.5)
            .clamp(0.0, 1.0)
    }
}

/// Runtime record of one connected worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInstance {
    pub instance_id: String,
    pub worker_kind: String,
    pub tenant_id: String,
    pub active: bool,
    pub current_tasks: HashSet<Uuid>,
    pub capacity_used: u32,
    pub max_capacity: u32,
    pub total_runs: u64,
    pub total_tasks_completed: u64,
    pub total_execution_secs: f64,
    pub success_rate: f64,
    pub last_activity: DateTime<Utc>,
    pub health: WorkerHealth,
    pub error_count: u64,
    pub last_error: Option<String>,
}

impl WorkerInstance {
    pub fn new(
        instance_id: impl Into<String>,
        worker_kind: impl Into<String>,
        tenant_id: impl Into<String>,
        max_capacity: u32,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            worker_kind: worker_kind.into(),
            tenant_id: tenant_id.into(),
            active: true,
            current_tasks: HashSet::new(),
            capacity_used: 0,
            max_capacity: max_capacity.max(1),
            total_runs: 0,
            total_tasks_completed: 0,
            total_execution_secs: 0.0,
            success_rate: 1.0,
            last_activity: Utc::now(),
            health: WorkerHealth::Healthy,
            error_count: 0,
            last_error: None,
        }
    }

    pub fn has_spare_capacity(&self) -> bool {
        self.capacity_used < self.max_capacity
    }
}

/// Dispatch-relevant view of a candidate instance.
#[derive(Debug, Clone)]
pub struct CandidateSnapshot {
    pub instance_id: String,
    pub worker_kind: String,
    pub capacity_used: u32,
    pub max_capacity: u32,
    pub success_rate: f64,
    pub specialization: f64,
}

#[derive(Default)]
struct Inner {
    instances: HashMap<String, WorkerInstance>,
    capabilities: HashMap<String, WorkerCapability>,
}

/// Owner of the worker-instance table.
#[derive(Default)]
pub struct CapabilityRegistry {
    inner: Mutex<Inner>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an instance and (re)declare its kind's capability. An existing
    /// instance with the same id is replaced.
    pub fn register(&self, instance: WorkerInstance, capability: WorkerCapability) {
        let mut inner = self.lock();
        inner
            .capabilities
            .insert(capability.worker_kind.clone(), capability);
        inner.instances.insert(instance.instance_id.clone(), instance);
    }

    /// Remove an instance. Returns the removed record.
    pub fn unregister(&self, instance_id: &str) -> Option<WorkerInstance> {
        self.lock().instances.remove(instance_id)
    }

    pub fn instance(&self, instance_id: &str) -> Option<WorkerInstance> {
        self.lock().instances.get(instance_id).cloned()
    }

    pub fn instances(&self) -> Vec<WorkerInstance> {
        self.lock().instances.values().cloned().collect()
    }

    pub fn capability_for(&self, worker_kind: &str) -> Option<WorkerCapability> {
        self.lock().capabilities.get(worker_kind).cloned()
    }

    /// True when the instance exists, is active, and is not unhealthy.
    /// Used by the hub's delivery filter.
    pub fn is_deliverable(&self, instance_id: &str) -> bool {
        self.lock()
            .instances
            .get(instance_id)
            .is_some_and(|i| i.active && i.health != WorkerHealth::Unhealthy)
    }

    /// Idempotent heartbeat keyed by instance id.
    pub fn heartbeat(&self, instance_id: &str, load: u32, health: WorkerHealth) -> Result<()> {
        let mut inner = self.lock();
        let Some(instance) = inner.instances.get_mut(instance_id) else {
            bail!("unknown worker instance {instance_id}");
        };
        instance.capacity_used = load.min(instance.max_capacity);
        instance.health = health;
        instance.active = health != WorkerHealth::Unhealthy;
        instance.last_activity = Utc::now();
        Ok(())
    }

    /// Reserve one slot of capacity for a task.
    pub fn reserve(&self, instance_id: &str, task_id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        let Some(instance) = inner.instances.get_mut(instance_id) else {
            bail!("unknown worker instance {instance_id}");
        };
        if !instance.has_spare_capacity() {
            bail!(
                "worker {instance_id} is saturated ({}/{})",
                instance.capacity_used,
                instance.max_capacity
            );
        }
        instance.current_tasks.insert(task_id);
        instance.capacity_used += 1;
        instance.last_activity = Utc::now();
        Ok(())
    }

    /// Release a reserved slot and fold the run into the rolling stats.
    ///
    /// Unknown instances are ignored: the worker may have unregistered
    /// while its last task was still in flight.
    pub fn release(
        &self,
        instance_id: &str,
        task_id: Uuid,
        success: bool,
        duration_secs: Option<f64>,
    ) {
        let mut inner = self.lock();
        let Some(instance) = inner.instances.get_mut(instance_id) else {
            return;
        };
        instance.current_tasks.remove(&task_id);
        instance.capacity_used = instance.capacity_used.saturating_sub(1);

        let runs = instance.total_runs as f64;
        let outcome = if success { 1.0 } else { 0.0 };
        instance.success_rate = (instance.success_rate * runs + outcome) / (runs + 1.0);
        instance.total_runs += 1;

        if success {
            instance.total_tasks_completed += 1;
            if let Some(duration) = duration_secs {
                instance.total_execution_secs += duration;
            }
        }
        instance.last_activity = Utc::now();
    }

    /// Record a worker-reported failure against the instance.
    pub fn record_error(&self, instance_id: &str, error: &str) {
        let mut inner = self.lock();
        if let Some(instance) = inner.instances.get_mut(instance_id) {
            instance.error_count += 1;
            instance.last_error = Some(error.to_owned());
            instance.last_activity = Utc::now();
        }
    }

    /// Instances able to take a task of `kind` for `tenant` right now.
    ///
    /// Filters: declared capability for the kind, tenant equality, active,
    /// not unhealthy, spare capacity, and the optional target-kind
    /// restriction.
    pub fn candidates_for(
        &self,
        kind: TaskKind,
        tenant_id: &str,
        target_worker_kind: Option<&str>,
    ) -> Vec<CandidateSnapshot> {
        let inner = self.lock();
        inner
            .instances
            .values()
            .filter(|i| i.active && i.health != WorkerHealth::Unhealthy)
            .filter(|i| i.tenant_id == tenant_id)
            .filter(|i| i.has_spare_capacity())
            .filter(|i| target_worker_kind.is_none_or(|target| i.worker_kind == target))
            .filter_map(|i| {
                let capability = inner.capabilities.get(&i.worker_kind)?;
                if !capability.accepts(kind) {
                    return None;
                }
                Some(CandidateSnapshot {
                    instance_id: i.instance_id.clone(),
                    worker_kind: i.worker_kind.clone(),
                    capacity_used: i.capacity_used,
                    max_capacity: i.max_capacity,
                    success_rate: i.success_rate,
                    specialization: capability.specialization_for(kind),
                })
            })
            .collect()
    }

    /// Count of currently running tasks across instances of a worker kind.
    pub fn load_for_kind(&self, worker_kind: &str) -> u32 {
        self.lock()
            .instances
            .values()
            .filter(|i| i.worker_kind == worker_kind)
            .map(|i| i.capacity_used)
            .sum()
    }

    /// Degrade instances that have gone quiet: Degraded after
    /// `degrade_after` without activity, Unhealthy (and inactive) after
    /// `unhealthy_after`. Returns `(instance_id, new_health)` for each
    /// change.
    pub fn decay_health(
        &self,
        now: DateTime<Utc>,
        degrade_after: Duration,
        unhealthy_after: Duration,
    ) -> Vec<(String, WorkerHealth)> {
        let mut inner = self.lock();
        let mut changes = Vec::new();
        for instance in inner.instances.values_mut() {
            let idle = now - instance.last_activity;
            let target = if idle > unhealthy_after {
                WorkerHealth::Unhealthy
            } else if idle > degrade_after {
                WorkerHealth::Degraded
            } else {
                continue;
            };
            if instance.health != target {
                instance.health = target;
                if target == WorkerHealth::Unhealthy {
                    instance.active = false;
                }
                changes.push((instance.instance_id.clone(), target));
            }
        }
        changes
    }

    pub fn worker_counts(&self) -> (usize, usize) {
        let inner = self.lock();
        let total = inner.instances.len();
        let active = inner.instances.values().filter(|i| i.active).count();
        (total, active)
    }
}
