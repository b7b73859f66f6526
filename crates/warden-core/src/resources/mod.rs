//! Resource monitor: system CPU/memory headroom and per-task execution
//! markers.
//!
//! A background loop (30 s cadence, owned by the orchestrator) refreshes
//! the snapshot from `sysinfo` and the store's queue depths; the
//! dispatcher reads the latest snapshot to gate resource-constrained
//! tasks and refreshes the queued count on every tick. Until the first
//! sample lands, full availability is assumed so a cold start never
//! blocks dispatch.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use sysinfo::System;
use uuid::Uuid;

/// Latest observed availability (percent of total) and load counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSnapshot {
    pub cpu_available_pct: f64,
    pub memory_available_pct: f64,
    /// Tasks currently between dispatch and a terminal report.
    pub active_tasks: usize,
    /// Entries sitting in the priority queues, per the last depth sample.
    pub queued_tasks: usize,
    pub sampled_at: DateTime<Utc>,
}

impl ResourceSnapshot {
    fn full() -> Self {
        Self {
            cpu_available_pct: 100.0,
            memory_available_pct: 100.0,
            active_tasks: 0,
            queued_tasks: 0,
            sampled_at: Utc::now(),
        }
    }
}

struct State {
    snapshot: ResourceSnapshot,
    history: VecDeque<ResourceSnapshot>,
    active: HashSet<Uuid>,
    queued: usize,
}

/// Owner of system-availability state.
pub struct ResourceMonitor {
    state: Mutex<State>,
}

const HISTORY_CAPACITY: usize = 1000;

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                snapshot: ResourceSnapshot::full(),
                history: VecDeque::new(),
                active: HashSet::new(),
                queued: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Refresh the snapshot from the operating system.
    pub fn sample_system(&self) {
        let sys = System::new_all();
        let cpu_used = f64::from(sys.global_cpu_info().cpu_usage());
        let total_memory = sys.total_memory() as f64;
        let used_memory = sys.used_memory() as f64;
        let memory_used_pct = if total_memory > 0.0 {
            used_memory / total_memory * 100.0
        } else {
            0.0
        };

        self.store_sample(
            (100.0 - cpu_used).clamp(0.0, 100.0),
            (100.0 - memory_used_pct).clamp(0.0, 100.0),
        );
    }

    /// Record an availability sample directly (tests and embedders with
    /// their own metrics source).
    pub fn store_sample(&self, cpu_available_pct: f64, memory_available_pct: f64) {
        let mut state = self.lock();
        let snapshot = ResourceSnapshot {
            cpu_available_pct,
            memory_available_pct,
            active_tasks: state.active.len(),
            queued_tasks: state.queued,
            sampled_at: Utc::now(),
        };
        if state.history.len() == HISTORY_CAPACITY {
            state.history.pop_front();
        }
        state.history.push_back(snapshot.clone());
        state.snapshot = snapshot;
    }

    /// Update the queued-entry count from the store's queue depths.
    pub fn record_queue_depth(&self, queued: usize) {
        self.lock().queued = queued;
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        let state = self.lock();
        let mut snapshot = state.snapshot.clone();
        snapshot.active_tasks = state.active.len();
        snapshot.queued_tasks = state.queued;
        snapshot
    }

    pub fn record_execution_start(&self, task_id: Uuid) {
        self.lock().active.insert(task_id);
    }

    pub fn record_execution_end(&self, task_id: Uuid) {
        self.lock().active.remove(&task_id);
    }

    pub fn active_tasks(&self) -> usize {
        self.lock().active.len()
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_fully_available() {
        let monitor = ResourceMonitor::new();
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.cpu_available_pct, 100.0);
        assert_eq!(snapshot.memory_available_pct, 100.0);
        assert_eq!(snapshot.active_tasks, 0);
        assert_eq!(snapshot.queued_tasks, 0);
    }

    #[test]
    fn stored_samples_replace_the_snapshot() {
        let monitor = ResourceMonitor::new();
        monitor.store_sample(35.0, 60.0);
        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.cpu_available_pct, 35.0);
        assert_eq!(snapshot.memory_available_pct, 60.0);
    }

    #[test]
    fn execution_markers_track_active_tasks() {
        let monitor = ResourceMonitor::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        monitor.record_execution_start(a);
        monitor.record_execution_start(b);
        assert_eq!(monitor.snapshot().active_tasks, 2);
        monitor.record_execution_end(a);
        assert_eq!(monitor.active_tasks(), 1);
        // Ending an unknown task is a no-op.
        monitor.record_execution_end(a);
        assert_eq!(monitor.active_tasks(), 1);
    }

    #[test]
    fn queue_depth_flows_into_the_snapshot() {
        let monitor = ResourceMonitor::new();
        monitor.record_queue_depth(17);
        assert_eq!(monitor.snapshot().queued_tasks, 17);

        // A fresh system sample carries the latest queue count.
        monitor.store_sample(50.0, 50.0);
        assert_eq!(monitor.snapshot().queued_tasks, 17);

        monitor.record_queue_depth(0);
        assert_eq!(monitor.snapshot().queued_tasks, 0);
    }

    #[test]
    fn system_sampling_produces_percentages() {
        let monitor = ResourceMonitor::new();
        monitor.sample_system();
        let snapshot = monitor.snapshot();
        assert!((0.0..=100.0).contains(&snapshot.cpu_available_pct));
        assert!((0.0..=100.0).contains(&snapshot.memory_available_pct));
    }
}
