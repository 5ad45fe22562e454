//! Storage backends for the task queue.
//!
//! [`TaskStore`] is the durable seam of the queue: every state transition
//! goes through it, so a store that survives restarts makes the whole queue
//! survive restarts. [`InMemoryTaskStore`] backs tests and single-process
//! runs; the SQLite store lives in `database::repositories::task`.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::task_queue::{Task, TaskState};
use crate::Result;

/// Reason recorded on tasks that exceeded the stall limit.
pub const STALLED_FAILURE_REASON: &str = "task stalled more than allowable limit";

/// Per-state task counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl TaskCounts {
    /// Tasks not yet picked up (waiting or scheduled for a retry).
    pub fn pending(&self) -> u64 {
        self.waiting + self.delayed
    }

    pub(crate) fn bump(&mut self, state: TaskState) {
        match state {
            TaskState::Waiting => self.waiting += 1,
            TaskState::Active => self.active += 1,
            TaskState::Delayed => self.delayed += 1,
            TaskState::Completed => self.completed += 1,
            TaskState::Failed => self.failed += 1,
        }
    }
}

/// Result of a stalled-task sweep.
#[derive(Debug, Default)]
pub struct StalledRecovery {
    /// Tasks returned to the waiting state.
    pub requeued: Vec<Task>,
    /// Tasks failed for stalling too often.
    pub failed: Vec<Task>,
}

impl StalledRecovery {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Persistence operations required by the task queue.
///
/// Transitions out of `Active` are owner-checked: they only apply when the
/// caller still holds the lock, and return `false` otherwise.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: &Task) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Task>>;

    /// Atomically claim the highest-priority runnable task of `queue`.
    ///
    /// Claiming increments `attempts_made`, resets progress and locks the
    /// task to `worker_id` until `lock_until`.
    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>>;

    async fn extend_lock(
        &self,
        id: &str,
        worker_id: &str,
        lock_until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Replace the payload of a task.
    async fn update_data(&self, id: &str, data: &Value) -> Result<bool>;

    /// Raise the progress of a task. Lower values are ignored.
    async fn update_progress(&self, id: &str, progress: u8) -> Result<bool>;

    async fn mark_completed(
        &self,
        id: &str,
        worker_id: &str,
        return_value: &Value,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn mark_failed(
        &self,
        id: &str,
        worker_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Put an active task back on the queue to run again at `run_at`.
    async fn mark_delayed(
        &self,
        id: &str,
        worker_id: &str,
        reason: &str,
        run_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Release active tasks whose lock expired before `now`.
    ///
    /// A task that has stalled more than `max_stalled_count` times is failed
    /// instead of requeued.
    async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        max_stalled_count: u32,
    ) -> Result<StalledRecovery>;

    async fn remove(&self, id: &str) -> Result<bool>;

    async fn counts(&self, queue: &str) -> Result<TaskCounts>;

    /// Keep only the `keep` most recently finished tasks of `queue` in `state`.
    async fn trim_finished(&self, queue: &str, state: TaskState, keep: u32) -> Result<u64>;

    /// Delete up to `limit` finished tasks that finished before `cutoff`.
    async fn purge_finished_before(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<u64>;
}

#[derive(Debug, Clone)]
struct StoredTask {
    seq: u64,
    task: Task,
}

/// Task store held entirely in memory.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: DashMap<String, StoredTask>,
    seq: AtomicU64,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn with_owned_active<F>(&self, id: &str, worker_id: &str, apply: F) -> bool
    where
        F: FnOnce(&mut Task),
    {
        let Some(mut entry) = self.tasks.get_mut(id) else {
            return false;
        };
        let task = &mut entry.task;
        if task.state != TaskState::Active || task.lock_owner.as_deref() != Some(worker_id) {
            return false;
        }
        apply(task);
        task.lock_owner = None;
        task.locked_until = None;
        true
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &Task) -> Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        self.tasks.insert(
            task.id.clone(),
            StoredTask {
                seq,
                task: task.clone(),
            },
        );
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.get(id).map(|e| e.task.clone()))
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lock_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Task>> {
        loop {
            let candidate = self
                .tasks
                .iter()
                .filter(|e| e.task.queue == queue && e.task.is_runnable(now))
                .min_by(|a, b| {
                    b.task
                        .priority
                        .cmp(&a.task.priority)
                        .then(a.seq.cmp(&b.seq))
                })
                .map(|e| e.key().clone());

            let Some(id) = candidate else {
                return Ok(None);
            };

            // Another worker may have claimed it between the scan and here.
            if let Some(mut entry) = self.tasks.get_mut(&id)
                && entry.task.is_runnable(now)
            {
                let task = &mut entry.task;
                task.state = TaskState::Active;
                task.attempts_made += 1;
                task.progress = 0;
                task.lock_owner = Some(worker_id.to_string());
                task.locked_until = Some(lock_until);
                task.processed_at = Some(now);
                return Ok(Some(task.clone()));
            }
        }
    }

    async fn extend_lock(
        &self,
        id: &str,
        worker_id: &str,
        lock_until: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(mut entry) = self.tasks.get_mut(id) else {
            return Ok(false);
        };
        let task = &mut entry.task;
        if task.state != TaskState::Active || task.lock_owner.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        task.locked_until = Some(lock_until);
        Ok(true)
    }

    async fn update_data(&self, id: &str, data: &Value) -> Result<bool> {
        Ok(match self.tasks.get_mut(id) {
            Some(mut entry) => {
                entry.task.data = data.clone();
                true
            }
            None => false,
        })
    }

    async fn update_progress(&self, id: &str, progress: u8) -> Result<bool> {
        let progress = progress.min(100);
        Ok(match self.tasks.get_mut(id) {
            Some(mut entry) if entry.task.progress < progress => {
                entry.task.progress = progress;
                true
            }
            _ => false,
        })
    }

    async fn mark_completed(
        &self,
        id: &str,
        worker_id: &str,
        return_value: &Value,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.with_owned_active(id, worker_id, |task| {
            task.state = TaskState::Completed;
            task.return_value = Some(return_value.clone());
            task.finished_at = Some(now);
        }))
    }

    async fn mark_failed(
        &self,
        id: &str,
        worker_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.with_owned_active(id, worker_id, |task| {
            task.state = TaskState::Failed;
            task.failed_reason = Some(reason.to_string());
            task.finished_at = Some(now);
        }))
    }

    async fn mark_delayed(
        &self,
        id: &str,
        worker_id: &str,
        reason: &str,
        run_at: DateTime<Utc>,
    ) -> Result<bool> {
        Ok(self.with_owned_active(id, worker_id, |task| {
            task.state = TaskState::Delayed;
            task.failed_reason = Some(reason.to_string());
            task.run_at = run_at;
        }))
    }

    async fn recover_stalled(
        &self,
        now: DateTime<Utc>,
        max_stalled_count: u32,
    ) -> Result<StalledRecovery> {
        let expired: Vec<String> = self
            .tasks
            .iter()
            .filter(|e| e.task.is_lock_expired(now))
            .map(|e| e.key().clone())
            .collect();

        let mut recovery = StalledRecovery::default();
        for id in expired {
            let Some(mut entry) = self.tasks.get_mut(&id) else {
                continue;
            };
            let task = &mut entry.task;
            if !task.is_lock_expired(now) {
                continue;
            }
            task.stalled_count += 1;
            task.lock_owner = None;
            task.locked_until = None;
            if task.stalled_count > max_stalled_count {
                task.state = TaskState::Failed;
                task.failed_reason = Some(STALLED_FAILURE_REASON.to_string());
                task.finished_at = Some(now);
                recovery.failed.push(task.clone());
            } else {
                task.state = TaskState::Waiting;
                task.run_at = now;
                recovery.requeued.push(task.clone());
            }
        }
        Ok(recovery)
    }

    async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.tasks.remove(id).is_some())
    }

    async fn counts(&self, queue: &str) -> Result<TaskCounts> {
        let mut counts = TaskCounts::default();
        for entry in self.tasks.iter().filter(|e| e.task.queue == queue) {
            counts.bump(entry.task.state);
        }
        Ok(counts)
    }

    async fn trim_finished(&self, queue: &str, state: TaskState, keep: u32) -> Result<u64> {
        let mut finished: Vec<(DateTime<Utc>, u64, String)> = self
            .tasks
            .iter()
            .filter(|e| e.task.queue == queue && e.task.state == state)
            .map(|e| {
                (
                    e.task.finished_at.unwrap_or(e.task.created_at),
                    e.seq,
                    e.key().clone(),
                )
            })
            .collect();

        // Newest first; everything past `keep` goes.
        finished.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        let mut removed = 0;
        for (_, _, id) in finished.into_iter().skip(keep as usize) {
            if self.tasks.remove(&id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn purge_finished_before(&self, cutoff: DateTime<Utc>, limit: u32) -> Result<u64> {
        let stale: Vec<String> = self
            .tasks
            .iter()
            .filter(|e| {
                e.task.state.is_terminal() && e.task.finished_at.is_some_and(|at| at < cutoff)
            })
            .take(limit as usize)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for id in stale {
            if self.tasks.remove(&id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::task_queue::EnqueueOptions;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    fn task(queue: &str, priority: i32) -> Task {
        Task::new(
            queue,
            "test",
            json!({}),
            &EnqueueOptions::default().with_priority(priority),
        )
    }

    #[tokio::test]
    async fn test_claim_is_fifo_within_priority() {
        let store = InMemoryTaskStore::new();
        let first = task("q", 0);
        let second = task("q", 0);
        let urgent = task("q", 5);
        store.insert(&first).await.unwrap();
        store.insert(&second).await.unwrap();
        store.insert(&urgent).await.unwrap();

        let now = Utc::now();
        let lock = now + ChronoDuration::seconds(30);
        let order: Vec<String> = [
            store.claim_next("q", "w", lock, now).await.unwrap(),
            store.claim_next("q", "w", lock, now).await.unwrap(),
            store.claim_next("q", "w", lock, now).await.unwrap(),
        ]
        .into_iter()
        .map(|t| t.unwrap().id)
        .collect();

        assert_eq!(order, vec![urgent.id, first.id, second.id]);
        assert!(store.claim_next("q", "w", lock, now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_ignores_other_queues_and_future_tasks() {
        let store = InMemoryTaskStore::new();
        let other = task("other", 0);
        let mut later = task("q", 0);
        later.state = TaskState::Delayed;
        later.run_at = Utc::now() + ChronoDuration::minutes(5);
        store.insert(&other).await.unwrap();
        store.insert(&later).await.unwrap();

        let now = Utc::now();
        let claimed = store
            .claim_next("q", "w", now + ChronoDuration::seconds(30), now)
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let store = InMemoryTaskStore::new();
        let t = task("q", 0);
        store.insert(&t).await.unwrap();

        assert!(store.update_progress(&t.id, 30).await.unwrap());
        assert!(!store.update_progress(&t.id, 10).await.unwrap());
        assert!(store.update_progress(&t.id, 250).await.unwrap());
        assert_eq!(store.get(&t.id).await.unwrap().unwrap().progress, 100);
    }

    #[tokio::test]
    async fn test_transitions_require_lock_owner() {
        let store = InMemoryTaskStore::new();
        let t = task("q", 0);
        store.insert(&t).await.unwrap();
        let now = Utc::now();
        store
            .claim_next("q", "owner", now + ChronoDuration::seconds(30), now)
            .await
            .unwrap();

        assert!(
            !store
                .mark_completed(&t.id, "intruder", &json!(1), now)
                .await
                .unwrap()
        );
        assert!(
            store
                .mark_completed(&t.id, "owner", &json!(1), now)
                .await
                .unwrap()
        );
        let done = store.get(&t.id).await.unwrap().unwrap();
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(done.return_value, Some(json!(1)));
        assert!(done.lock_owner.is_none());
    }

    #[tokio::test]
    async fn test_stalled_task_requeued_then_failed() {
        let store = InMemoryTaskStore::new();
        let t = task("q", 0);
        store.insert(&t).await.unwrap();

        let now = Utc::now();
        store.claim_next("q", "w", now, now).await.unwrap();
        let later = now + ChronoDuration::seconds(1);
        let first = store.recover_stalled(later, 1).await.unwrap();
        assert_eq!(first.requeued.len(), 1);
        assert_eq!(
            store.get(&t.id).await.unwrap().unwrap().state,
            TaskState::Waiting
        );

        store.claim_next("q", "w", later, later).await.unwrap();
        let second = store
            .recover_stalled(later + ChronoDuration::seconds(1), 1)
            .await
            .unwrap();
        assert_eq!(second.failed.len(), 1);
        let failed = store.get(&t.id).await.unwrap().unwrap();
        assert_eq!(failed.state, TaskState::Failed);
        assert_eq!(failed.failed_reason.as_deref(), Some(STALLED_FAILURE_REASON));
    }

    #[tokio::test]
    async fn test_trim_keeps_most_recent() {
        let store = InMemoryTaskStore::new();
        let base = Utc::now();
        let mut ids = Vec::new();
        for i in 0..4 {
            let mut t = task("q", 0);
            t.state = TaskState::Completed;
            t.finished_at = Some(base + ChronoDuration::seconds(i));
            ids.push(t.id.clone());
            store.insert(&t).await.unwrap();
        }

        let removed = store
            .trim_finished("q", TaskState::Completed, 2)
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert!(store.get(&ids[0]).await.unwrap().is_none());
        assert!(store.get(&ids[3]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_purge_only_touches_finished() {
        let store = InMemoryTaskStore::new();
        let mut old_done = task("q", 0);
        old_done.state = TaskState::Failed;
        old_done.finished_at = Some(Utc::now() - ChronoDuration::days(10));
        let waiting = task("q", 0);
        store.insert(&old_done).await.unwrap();
        store.insert(&waiting).await.unwrap();

        let removed = store
            .purge_finished_before(Utc::now() - ChronoDuration::days(7), 100)
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.len(), 1);
    }
}
