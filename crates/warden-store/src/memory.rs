//! In-memory [`TaskStore`] backend.
//!
//! Single-process owner state: one mutex guards the task table, the
//! per-priority queues, and the dead-letter list. Queue entries order by
//! (ready_at, submission seq) inside each priority; claims scan priorities
//! in the requested direction.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{DeadLetter, ScheduleConfig, Task, TaskPriority, TaskStatus};
use crate::store::{apply_transition, ScanOrder, TaskStore, TransitionFields};

#[derive(Default)]
struct Inner {
    tasks: HashMap<Uuid, Task>,
    queues: BTreeMap<TaskPriority, BTreeMap<(DateTime<Utc>, i64), Uuid>>,
    /// task id -> queue key, for O(1) revocation.
    queued: HashMap<Uuid, (TaskPriority, DateTime<Utc>, i64)>,
    dead_letters: Vec<DeadLetter>,
    seq: i64,
}

/// Mutex-guarded in-memory store.
#[derive(Default)]
pub struct MemoryTaskStore {
    inner: Mutex<Inner>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lock only means another thread panicked mid-update of
        // plain data; the state itself stays consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Inner {
    fn drop_queue_entry(&mut self, task_id: Uuid) -> bool {
        if let Some((priority, ready_at, seq)) = self.queued.remove(&task_id) {
            if let Some(queue) = self.queues.get_mut(&priority) {
                queue.remove(&(ready_at, seq));
            }
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, task: Task) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.tasks.contains_key(&task.id) {
            return Err(StoreError::Duplicate(task.id));
        }
        inner.tasks.insert(task.id, task);
        Ok(())
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.lock().tasks.get(&task_id).cloned())
    }

    async fn enqueue(
        &self,
        task_id: Uuid,
        priority: TaskPriority,
        ready_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.tasks.contains_key(&task_id) {
            return Err(StoreError::NotFound(task_id));
        }
        // Re-enqueueing replaces any previous entry.
        inner.drop_queue_entry(task_id);
        inner.seq += 1;
        let seq = inner.seq;
        inner
            .queues
            .entry(priority)
            .or_default()
            .insert((ready_at, seq), task_id);
        inner.queued.insert(task_id, (priority, ready_at, seq));
        Ok(())
    }

    async fn pop_due(
        &self,
        now: DateTime<Utc>,
        order: ScanOrder,
    ) -> Result<Option<Task>, StoreError> {
        let mut inner = self.lock();
        let priorities: Vec<TaskPriority> = match order {
            ScanOrder::HighestFirst => TaskPriority::ALL.to_vec(),
            ScanOrder::LowestFirst => TaskPriority::ALL.iter().rev().copied().collect(),
        };

        for priority in priorities {
            loop {
                let entry = inner
                    .queues
                    .get(&priority)
                    .and_then(|queue| queue.first_key_value())
                    .map(|(key, id)| (*key, *id));

                let Some(((ready_at, seq), task_id)) = entry else {
                    break;
                };
                if ready_at > now {
                    break;
                }

                if let Some(queue) = inner.queues.get_mut(&priority) {
                    queue.remove(&(ready_at, seq));
                }
                inner.queued.remove(&task_id);

                // Entries can outlive their task (pruning); skip those.
                if let Some(task) = inner.tasks.get(&task_id) {
                    return Ok(Some(task.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn remove_queued(&self, task_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.lock().drop_queue_entry(task_id))
    }

    async fn transition(
        &self,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        fields: TransitionFields,
    ) -> Result<Task, StoreError> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;

        if task.status != from {
            return Err(StoreError::StatusConflict {
                task_id,
                expected: from,
                actual: task.status,
            });
        }

        // Apply to a copy so a rejected transition leaves the record
        // untouched.
        let mut updated = task.clone();
        apply_transition(&mut updated, to, fields, Utc::now())?;
        *task = updated.clone();
        Ok(updated)
    }

    async fn update_schedule(
        &self,
        task_id: Uuid,
        schedule: ScheduleConfig,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get_mut(&task_id)
            .ok_or(StoreError::NotFound(task_id))?;
        task.schedule = Some(schedule);
        Ok(())
    }

    async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, StoreError> {
        let inner = self.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn list_by_correlation(&self, correlation_id: &str) -> Result<Vec<Task>, StoreError> {
        let inner = self.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.correlation_id.as_deref() == Some(correlation_id))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn dependents_waiting(&self, dep_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let inner = self.lock();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::WaitingDeps && t.dependencies.contains(&dep_id))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    async fn upcoming(
        &self,
        until: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<(Task, DateTime<Utc>)>, StoreError> {
        let inner = self.lock();
        let mut entries: Vec<(Task, DateTime<Utc>)> = Vec::new();
        for queue in inner.queues.values() {
            for ((ready_at, _seq), task_id) in queue {
                if *ready_at > until {
                    break;
                }
                if let Some(task) = inner.tasks.get(task_id) {
                    entries.push((task.clone(), *ready_at));
                }
            }
        }
        entries.sort_by_key(|(_, ready_at)| *ready_at);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn queue_depths(&self) -> Result<BTreeMap<TaskPriority, usize>, StoreError> {
        let inner = self.lock();
        let mut depths = BTreeMap::new();
        for priority in TaskPriority::ALL {
            let depth = inner.queues.get(&priority).map_or(0, |q| q.len());
            depths.insert(priority, depth);
        }
        Ok(depths)
    }

    async fn move_to_dead_letter(&self, task_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let task = inner
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or(StoreError::NotFound(task_id))?;
        inner.dead_letters.push(DeadLetter {
            task,
            moved_at: Utc::now(),
        });
        Ok(())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        Ok(self.lock().dead_letters.clone())
    }

    async fn requeue_from_dead_letter(&self, max_age: Duration) -> Result<Vec<Uuid>, StoreError> {
        let now = Utc::now();
        let cutoff = now - max_age;
        let mut inner = self.lock();

        let mut readmitted = Vec::new();
        let mut kept = Vec::new();
        for letter in std::mem::take(&mut inner.dead_letters) {
            if letter.task.created_at >= cutoff {
                readmitted.push(letter.task);
            } else {
                kept.push(letter);
            }
        }
        inner.dead_letters = kept;

        let mut ids = Vec::new();
        for mut task in readmitted {
            // Operator re-admission: counters reset, straight back into the
            // queue at its own priority.
            task.retry_count = 0;
            task.status = TaskStatus::Queued;
            task.error = None;
            task.error_tag = None;
            task.completed_at = None;
            task.scheduled_at = None;
            let id = task.id;
            let priority = task.priority;
            inner.tasks.insert(id, task);
            inner.seq += 1;
            let seq = inner.seq;
            inner
                .queues
                .entry(priority)
                .or_default()
                .insert((now, seq), id);
            inner.queued.insert(id, (priority, now, seq));
            ids.push(id);
        }
        Ok(ids)
    }

    async fn prune_terminal(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let stale: Vec<Uuid> = inner
            .tasks
            .values()
            .filter(|t| {
                t.status.is_terminal() && t.completed_at.is_some_and(|done| done < cutoff)
            })
            .map(|t| t.id)
            .collect();
        for id in &stale {
            inner.tasks.remove(id);
            inner.drop_queue_entry(*id);
        }
        Ok(stale.len() as u64)
    }

    async fn prune_dead_letters(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let before = inner.dead_letters.len();
        inner.dead_letters.retain(|l| l.moved_at >= cutoff);
        Ok((before - inner.dead_letters.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ErrorTag, TaskKind};

    fn task(priority: TaskPriority) -> Task {
        Task::new(TaskKind::EvidenceCollection, priority, "tenant-a")
    }

    async fn insert_and_enqueue(
        store: &MemoryTaskStore,
        priority: TaskPriority,
        ready_at: DateTime<Utc>,
    ) -> Uuid {
        let mut t = task(priority);
        t.status = TaskStatus::Queued;
        let id = t.id;
        store.insert(t).await.unwrap();
        store.enqueue(id, priority, ready_at).await.unwrap();
        id
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_id() {
        let store = MemoryTaskStore::new();
        let t = task(TaskPriority::Medium);
        let dup = t.clone();
        store.insert(t).await.unwrap();
        let err = store.insert(dup).await.unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(_)));
    }

    #[tokio::test]
    async fn pop_due_respects_fifo_within_priority() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let first = insert_and_enqueue(&store, TaskPriority::Medium, now).await;
        let second = insert_and_enqueue(&store, TaskPriority::Medium, now).await;

        let a = store.pop_due(now, ScanOrder::HighestFirst).await.unwrap();
        let b = store.pop_due(now, ScanOrder::HighestFirst).await.unwrap();
        assert_eq!(a.unwrap().id, first);
        assert_eq!(b.unwrap().id, second);
    }

    #[tokio::test]
    async fn pop_due_prefers_higher_priority() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let low = insert_and_enqueue(&store, TaskPriority::Background, now).await;
        let high = insert_and_enqueue(&store, TaskPriority::Critical, now).await;

        let a = store.pop_due(now, ScanOrder::HighestFirst).await.unwrap();
        assert_eq!(a.unwrap().id, high);
        let b = store.pop_due(now, ScanOrder::HighestFirst).await.unwrap();
        assert_eq!(b.unwrap().id, low);
    }

    #[tokio::test]
    async fn lowest_first_scan_flips_the_order() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let low = insert_and_enqueue(&store, TaskPriority::Background, now).await;
        let _high = insert_and_enqueue(&store, TaskPriority::Critical, now).await;

        let a = store.pop_due(now, ScanOrder::LowestFirst).await.unwrap();
        assert_eq!(a.unwrap().id, low);
    }

    #[tokio::test]
    async fn pop_due_skips_future_entries() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let _future =
            insert_and_enqueue(&store, TaskPriority::High, now + Duration::seconds(60)).await;

        let claimed = store.pop_due(now, ScanOrder::HighestFirst).await.unwrap();
        assert!(claimed.is_none());

        let later = now + Duration::seconds(61);
        let claimed = store.pop_due(later, ScanOrder::HighestFirst).await.unwrap();
        assert!(claimed.is_some());
    }

    #[tokio::test]
    async fn remove_queued_revokes_entry() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let id = insert_and_enqueue(&store, TaskPriority::High, now).await;

        assert!(store.remove_queued(id).await.unwrap());
        assert!(!store.remove_queued(id).await.unwrap());
        let claimed = store.pop_due(now, ScanOrder::HighestFirst).await.unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn transition_enforces_optimistic_lock() {
        let store = MemoryTaskStore::new();
        let t = task(TaskPriority::Medium);
        let id = t.id;
        store.insert(t).await.unwrap();

        let err = store
            .transition(
                id,
                TaskStatus::Queued,
                TaskStatus::Assigned,
                TransitionFields::with_worker("w-1"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::StatusConflict { .. }));

        store
            .transition(
                id,
                TaskStatus::Pending,
                TaskStatus::Queued,
                TransitionFields::none(),
            )
            .await
            .unwrap();
        let snapshot = store.get(id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn dead_letter_requeue_resets_retry_state() {
        let store = MemoryTaskStore::new();
        let mut t = task(TaskPriority::High);
        t.status = TaskStatus::Failed;
        t.retry_count = 3;
        t.error = Some("boom".to_owned());
        t.error_tag = Some(ErrorTag::Transient);
        t.completed_at = Some(Utc::now());
        let id = t.id;
        store.insert(t).await.unwrap();
        store.move_to_dead_letter(id).await.unwrap();
        assert_eq!(store.dead_letters().await.unwrap().len(), 1);

        let readmitted = store
            .requeue_from_dead_letter(Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(readmitted, vec![id]);
        assert!(store.dead_letters().await.unwrap().is_empty());

        let snapshot = store.get(id).await.unwrap().unwrap();
        assert_eq!(snapshot.status, TaskStatus::Queued);
        assert_eq!(snapshot.retry_count, 0);
        assert!(snapshot.error.is_none());

        let claimed = store
            .pop_due(Utc::now(), ScanOrder::HighestFirst)
            .await
            .unwrap();
        assert_eq!(claimed.unwrap().id, id);
    }

    #[tokio::test]
    async fn dead_letter_requeue_skips_old_tasks() {
        let store = MemoryTaskStore::new();
        let mut t = task(TaskPriority::High);
        t.status = TaskStatus::Failed;
        t.created_at = Utc::now() - Duration::hours(48);
        let id = t.id;
        store.insert(t).await.unwrap();
        store.move_to_dead_letter(id).await.unwrap();

        let readmitted = store
            .requeue_from_dead_letter(Duration::hours(24))
            .await
            .unwrap();
        assert!(readmitted.is_empty());
        assert_eq!(store.dead_letters().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn prune_terminal_removes_only_old_finished_tasks() {
        let store = MemoryTaskStore::new();

        let mut old = task(TaskPriority::Medium);
        old.status = TaskStatus::Completed;
        old.completed_at = Some(Utc::now() - Duration::hours(48));
        let old_id = old.id;

        let mut fresh = task(TaskPriority::Medium);
        fresh.status = TaskStatus::Completed;
        fresh.completed_at = Some(Utc::now());
        let fresh_id = fresh.id;

        let mut running = task(TaskPriority::Medium);
        running.status = TaskStatus::Running;
        let running_id = running.id;

        store.insert(old).await.unwrap();
        store.insert(fresh).await.unwrap();
        store.insert(running).await.unwrap();

        let removed = store
            .prune_terminal(Utc::now() - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(old_id).await.unwrap().is_none());
        assert!(store.get(fresh_id).await.unwrap().is_some());
        assert!(store.get(running_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn upcoming_orders_by_ready_time() {
        let store = MemoryTaskStore::new();
        let now = Utc::now();
        let later = insert_and_enqueue(&store, TaskPriority::Low, now + Duration::minutes(30)).await;
        let sooner = insert_and_enqueue(&store, TaskPriority::Low, now + Duration::minutes(5)).await;
        let _far =
            insert_and_enqueue(&store, TaskPriority::Low, now + Duration::hours(30)).await;

        let horizon = now + Duration::hours(24);
        let upcoming = store.upcoming(horizon, 10).await.unwrap();
        let ids: Vec<Uuid> = upcoming.iter().map(|(t, _)| t.id).collect();
        assert_eq!(ids, vec![sooner, later]);
    }
}
