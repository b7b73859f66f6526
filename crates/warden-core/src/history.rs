//! Bounded execution history.
//!
//! Per-lineage ring of the most recent run outcomes; feeds the adaptive
//! schedule planner and the hourly optimization pass. Recurring tasks are
//! respawned under fresh ids, so rings are keyed by lineage (correlation id
//! when present, otherwise the task id).

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use warden_store::models::Task;

/// Outcome of a single run.
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub task_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_secs: f64,
    pub success: bool,
    pub error: Option<String>,
    pub items_collected: u64,
    pub resource_usage: HashMap<String, f64>,
}

/// The lineage key a task's runs accumulate under.
pub fn lineage_key(task: &Task) -> String {
    task.correlation_id
        .clone()
        .unwrap_or_else(|| task.id.to_string())
}

/// Ring buffers of recent [`ExecutionRecord`]s, bounded per lineage.
pub struct ExecutionHistory {
    rings: Mutex<HashMap<String, VecDeque<ExecutionRecord>>>,
    capacity: usize,
}

impl ExecutionHistory {
    /// Default bound on records kept per lineage.
    pub const DEFAULT_CAPACITY: usize = 100;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rings: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<ExecutionRecord>>> {
        self.rings.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a record, evicting the oldest entry once the ring is full.
    pub fn record(&self, key: &str, record: ExecutionRecord) {
        let mut rings = self.lock();
        let ring = rings.entry(key.to_owned()).or_default();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(record);
    }

    /// Snapshot of the records for a lineage, oldest first.
    pub fn for_lineage(&self, key: &str) -> Vec<ExecutionRecord> {
        self.lock()
            .get(key)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn run_count(&self, key: &str) -> usize {
        self.lock().get(key).map_or(0, |ring| ring.len())
    }

    /// Lineage keys with any recorded history.
    pub fn lineages(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }
}

impl Default for ExecutionHistory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(success: bool) -> ExecutionRecord {
        ExecutionRecord {
            task_id: Uuid::new_v4(),
            started_at: Utc::now(),
            duration_secs: 10.0,
            success,
            error: None,
            items_collected: 0,
            resource_usage: HashMap::new(),
        }
    }

    #[test]
    fn ring_is_bounded() {
        let history = ExecutionHistory::with_capacity(3);
        for _ in 0..10 {
            history.record("job", record(true));
        }
        assert_eq!(history.run_count("job"), 3);
    }

    #[test]
    fn lineages_are_independent() {
        let history = ExecutionHistory::new();
        history.record("a", record(true));
        history.record("b", record(false));
        assert_eq!(history.run_count("a"), 1);
        assert_eq!(history.run_count("b"), 1);
        assert!(history.for_lineage("c").is_empty());
    }

    #[test]
    fn lineage_key_prefers_correlation_id() {
        use warden_store::models::{TaskKind, TaskPriority};
        let mut task = Task::new(TaskKind::SecurityScan, TaskPriority::Medium, "t");
        assert_eq!(lineage_key(&task), task.id.to_string());
        task.correlation_id = Some("wf-1".to_owned());
        assert_eq!(lineage_key(&task), "wf-1");
    }
}
