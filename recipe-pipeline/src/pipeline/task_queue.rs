//! Durable named task queues.
//!
//! The queue owns task lifecycle rules (claiming, retries with exponential
//! backoff, stall recovery, retention) and delegates storage to a
//! [`TaskStore`]. Workers in any process sharing the same store see the same
//! tasks; finish notifications fall back to polling the store so waiters in
//! other processes still observe completion.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::task_store::{InMemoryTaskStore, TaskCounts, TaskStore};
use crate::{Error, Result};

/// Configuration for the task queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueConfig {
    /// Pending depth at which enqueues start logging warnings.
    pub warning_threshold: u64,
    /// Pending depth at which enqueues are rejected.
    pub critical_threshold: u64,
    /// Interval between stalled-task sweeps.
    pub stalled_check_interval_ms: u64,
    /// How many times a task may stall before it is failed.
    pub max_stalled_count: u32,
    /// Store poll interval used by finish waiters.
    pub finished_poll_interval_ms: u64,
    /// Capacity of the task event channel.
    pub event_capacity: usize,
}

impl Default for TaskQueueConfig {
    fn default() -> Self {
        Self {
            warning_threshold: 100,
            critical_threshold: 1000,
            stalled_check_interval_ms: 30_000,
            max_stalled_count: 1,
            finished_poll_interval_ms: 1_000,
            event_capacity: 1024,
        }
    }
}

/// Status of queue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueDepthStatus {
    Normal,
    Warning,
    Critical,
}

/// Task lifecycle state.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TaskState {
    /// Ready to be claimed.
    Waiting,
    /// Claimed by a worker holding the lock.
    Active,
    /// Scheduled to run again after `run_at`.
    Delayed,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Options applied when a task is enqueued.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    /// Total attempts before the task fails for good.
    pub attempts: u32,
    /// Base delay of the exponential retry backoff.
    pub backoff: Duration,
    /// Delay before the first attempt.
    pub delay: Option<Duration>,
    /// Higher runs first.
    pub priority: i32,
    /// Number of completed tasks of this queue to retain.
    pub keep_completed: Option<u32>,
    /// Number of failed tasks of this queue to retain.
    pub keep_failed: Option<u32>,
    /// Explicit task ID. A random one is generated otherwise.
    pub task_id: Option<String>,
    /// Reject the enqueue when the queue is at critical depth. Without it
    /// a critical depth is only logged.
    pub reject_at_critical: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::from_secs(2),
            delay: None,
            priority: 0,
            keep_completed: None,
            keep_failed: None,
            task_id: None,
            reject_at_critical: false,
        }
    }
}

impl EnqueueOptions {
    pub fn with_attempts(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retention(mut self, keep_completed: Option<u32>, keep_failed: Option<u32>) -> Self {
        self.keep_completed = keep_completed;
        self.keep_failed = keep_failed;
        self
    }

    pub fn with_task_id(mut self, id: impl Into<String>) -> Self {
        self.task_id = Some(id.into());
        self
    }

    pub fn with_depth_limit(mut self) -> Self {
        self.reject_at_critical = true;
        self
    }
}

/// A unit of work on a named queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub data: Value,
    pub state: TaskState,
    pub priority: i32,
    /// Completion percentage, 0-100. Only ever increases within an attempt.
    pub progress: u8,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub stalled_count: u32,
    pub lock_owner: Option<String>,
    pub locked_until: Option<DateTime<Utc>>,
    /// Earliest time the task may be claimed.
    pub run_at: DateTime<Utc>,
    pub return_value: Option<Value>,
    pub failed_reason: Option<String>,
    pub keep_completed: Option<u32>,
    pub keep_failed: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        queue: impl Into<String>,
        name: impl Into<String>,
        data: Value,
        options: &EnqueueOptions,
    ) -> Self {
        let now = Utc::now();
        let (state, run_at) = match options.delay.and_then(|d| TimeDelta::from_std(d).ok()) {
            Some(delay) if delay > TimeDelta::zero() => (TaskState::Delayed, now + delay),
            _ => (TaskState::Waiting, now),
        };

        Self {
            id: options
                .task_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            queue: queue.into(),
            name: name.into(),
            data,
            state,
            priority: options.priority,
            progress: 0,
            attempts_made: 0,
            max_attempts: options.attempts.max(1),
            backoff_ms: options.backoff.as_millis() as u64,
            stalled_count: 0,
            lock_owner: None,
            locked_until: None,
            run_at,
            return_value: None,
            failed_reason: None,
            keep_completed: options.keep_completed,
            keep_failed: options.keep_failed,
            created_at: now,
            processed_at: None,
            finished_at: None,
        }
    }

    /// Whether a worker may claim this task at `now`.
    pub fn is_runnable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.state, TaskState::Waiting | TaskState::Delayed) && self.run_at <= now
    }

    pub fn is_lock_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == TaskState::Active && self.locked_until.is_some_and(|until| until < now)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// Delay before the next attempt: `backoff * 2^(attempts_made - 1)`.
    pub fn retry_delay(&self) -> Duration {
        let exponent = self.attempts_made.saturating_sub(1).min(20);
        Duration::from_millis(self.backoff_ms.saturating_mul(1u64 << exponent))
    }

    /// Deserialize the payload.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

/// How a task finished.
#[derive(Debug, Clone, PartialEq)]
pub enum FinishedTask {
    Completed(Value),
    Failed(String),
}

impl FinishedTask {
    fn from_task(task: &Task) -> Option<Self> {
        match task.state {
            TaskState::Completed => Some(Self::Completed(
                task.return_value.clone().unwrap_or(Value::Null),
            )),
            TaskState::Failed => Some(Self::Failed(
                task.failed_reason
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            )),
            _ => None,
        }
    }
}

/// Lifecycle notification for a task.
#[derive(Debug, Clone)]
pub struct TaskEvent {
    pub task_id: String,
    pub queue: String,
    pub kind: TaskEventKind,
}

#[derive(Debug, Clone)]
pub enum TaskEventKind {
    Enqueued,
    Active { attempt: u32 },
    Progress(u8),
    Retrying { attempt: u32, delay_ms: u64 },
    Stalled,
    Completed(Value),
    Failed(String),
}

/// The task queue service.
pub struct TaskQueue {
    config: TaskQueueConfig,
    store: Arc<dyn TaskStore>,
    /// Wakes idle workers of a queue when a task is added.
    notifiers: DashMap<String, Arc<Notify>>,
    events: broadcast::Sender<TaskEvent>,
}

impl TaskQueue {
    /// Create a queue over `store` with default configuration.
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self::with_config(TaskQueueConfig::default(), store)
    }

    pub fn with_config(config: TaskQueueConfig, store: Arc<dyn TaskStore>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(16));
        Self {
            config,
            store,
            notifiers: DashMap::new(),
            events,
        }
    }

    /// Create a queue backed by an [`InMemoryTaskStore`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryTaskStore::new()))
    }

    pub fn config(&self) -> &TaskQueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Subscribe to task lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    /// Notifier signalled whenever a task becomes available on `queue`.
    pub fn notifier(&self, queue: &str) -> Arc<Notify> {
        self.notifiers
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    fn emit(&self, task: &Task, kind: TaskEventKind) {
        // No receivers is fine.
        let _ = self.events.send(TaskEvent {
            task_id: task.id.clone(),
            queue: task.queue.clone(),
            kind,
        });
    }

    /// Enqueue a task and return a handle to it.
    pub async fn enqueue<T: Serialize>(
        self: &Arc<Self>,
        queue: &str,
        name: &str,
        payload: &T,
        options: EnqueueOptions,
    ) -> Result<TaskHandle> {
        let depth = self.depth(queue).await?;
        match self.depth_status_for(depth) {
            QueueDepthStatus::Critical if options.reject_at_critical => {
                return Err(Error::validation(format!(
                    "queue {} is at critical depth ({} pending)",
                    queue, depth
                )));
            }
            QueueDepthStatus::Critical => {
                warn!(queue, depth, "Queue depth at critical threshold");
            }
            QueueDepthStatus::Warning => {
                warn!(queue, depth, "Queue depth above warning threshold");
            }
            QueueDepthStatus::Normal => {}
        }

        let task = Task::new(queue, name, serde_json::to_value(payload)?, &options);
        self.store.insert(&task).await?;

        debug!(
            task_id = %task.id,
            queue,
            name,
            state = %task.state,
            "Enqueued task"
        );

        self.emit(&task, TaskEventKind::Enqueued);
        self.notifier(queue).notify_one();

        Ok(self.handle(&task.id, queue))
    }

    /// Handle to an existing task.
    pub fn handle(self: &Arc<Self>, task_id: &str, queue: &str) -> TaskHandle {
        TaskHandle {
            id: task_id.to_string(),
            queue: queue.to_string(),
            task_queue: self.clone(),
        }
    }

    /// Claim the next runnable task of `queue` for `worker_id`.
    pub async fn claim(
        &self,
        queue: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<Option<Task>> {
        let now = Utc::now();
        let task = self
            .store
            .claim_next(queue, worker_id, lock_deadline(now, lock_duration)?, now)
            .await?;

        if let Some(task) = &task {
            debug!(
                task_id = %task.id,
                queue,
                worker_id,
                attempt = task.attempts_made,
                "Claimed task"
            );
            self.emit(
                task,
                TaskEventKind::Active {
                    attempt: task.attempts_made,
                },
            );
        }
        Ok(task)
    }

    /// Renew the lock held by `worker_id`. Returns `false` if the lock was lost.
    pub async fn extend_lock(
        &self,
        task_id: &str,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<bool> {
        self.store
            .extend_lock(task_id, worker_id, lock_deadline(Utc::now(), lock_duration)?)
            .await
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.store.get(task_id).await
    }

    async fn require_task(&self, task_id: &str) -> Result<Task> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| Error::not_found("Task", task_id))
    }

    /// Raise the progress of a task. Values at or below the current progress are ignored.
    pub async fn update_progress(&self, task_id: &str, progress: u8) -> Result<()> {
        let progress = progress.min(100);
        if self.store.update_progress(task_id, progress).await? {
            let _ = self.events.send(TaskEvent {
                task_id: task_id.to_string(),
                queue: String::new(),
                kind: TaskEventKind::Progress(progress),
            });
        }
        Ok(())
    }

    /// Replace the payload of a task.
    pub async fn update_data(&self, task_id: &str, data: &Value) -> Result<()> {
        if self.store.update_data(task_id, data).await? {
            Ok(())
        } else {
            Err(Error::not_found("Task", task_id))
        }
    }

    /// Current payload of a task, as stored.
    pub async fn current_data(&self, task_id: &str) -> Result<Value> {
        Ok(self.require_task(task_id).await?.data)
    }

    /// Record a successful attempt and apply the retention policy.
    pub async fn complete(&self, task: &Task, worker_id: &str, return_value: Value) -> Result<()> {
        let now = Utc::now();
        if !self
            .store
            .mark_completed(&task.id, worker_id, &return_value, now)
            .await?
        {
            warn!(task_id = %task.id, worker_id, "Lost lock before completing task");
            return Err(Error::InvalidStateTransition {
                from: "stale lock".to_string(),
                to: TaskState::Completed.to_string(),
            });
        }

        debug!(task_id = %task.id, queue = %task.queue, "Task completed");
        self.emit(task, TaskEventKind::Completed(return_value));

        if let Some(keep) = task.keep_completed {
            self.trim(&task.queue, TaskState::Completed, keep).await;
        }
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// With attempts left the task is moved to `Delayed` and retried after
    /// `backoff * 2^(attempts_made - 1)`; otherwise it fails for good.
    pub async fn fail(&self, task: &Task, worker_id: &str, reason: &str) -> Result<TaskState> {
        if task.has_attempts_left() {
            let delay = task.retry_delay();
            let run_at = lock_deadline(Utc::now(), delay)?;
            if !self
                .store
                .mark_delayed(&task.id, worker_id, reason, run_at)
                .await?
            {
                warn!(task_id = %task.id, worker_id, "Lost lock before scheduling retry");
                return Ok(TaskState::Active);
            }

            info!(
                task_id = %task.id,
                queue = %task.queue,
                attempt = task.attempts_made,
                max_attempts = task.max_attempts,
                delay_ms = delay.as_millis() as u64,
                reason,
                "Task attempt failed, retry scheduled"
            );
            self.emit(
                task,
                TaskEventKind::Retrying {
                    attempt: task.attempts_made,
                    delay_ms: delay.as_millis() as u64,
                },
            );
            self.schedule_wakeup(&task.queue, delay);
            return Ok(TaskState::Delayed);
        }

        if !self
            .store
            .mark_failed(&task.id, worker_id, reason, Utc::now())
            .await?
        {
            warn!(task_id = %task.id, worker_id, "Lost lock before failing task");
            return Ok(TaskState::Active);
        }

        warn!(
            task_id = %task.id,
            queue = %task.queue,
            attempts = task.attempts_made,
            reason,
            "Task failed"
        );
        self.emit(task, TaskEventKind::Failed(reason.to_string()));

        if let Some(keep) = task.keep_failed {
            self.trim(&task.queue, TaskState::Failed, keep).await;
        }
        Ok(TaskState::Failed)
    }

    fn schedule_wakeup(&self, queue: &str, delay: Duration) {
        let notify = self.notifier(queue);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            notify.notify_one();
        });
    }

    async fn trim(&self, queue: &str, state: TaskState, keep: u32) {
        match self.store.trim_finished(queue, state, keep).await {
            Ok(0) => {}
            Ok(removed) => debug!(queue, %state, removed, "Trimmed finished tasks"),
            Err(e) => warn!(queue, %state, error = %e, "Failed to trim finished tasks"),
        }
    }

    pub async fn remove_task(&self, task_id: &str) -> Result<bool> {
        self.store.remove(task_id).await
    }

    pub async fn counts(&self, queue: &str) -> Result<TaskCounts> {
        self.store.counts(queue).await
    }

    /// Number of tasks waiting to run on `queue`.
    pub async fn depth(&self, queue: &str) -> Result<u64> {
        Ok(self.counts(queue).await?.pending())
    }

    pub async fn depth_status(&self, queue: &str) -> Result<QueueDepthStatus> {
        Ok(self.depth_status_for(self.depth(queue).await?))
    }

    fn depth_status_for(&self, depth: u64) -> QueueDepthStatus {
        if depth >= self.config.critical_threshold {
            QueueDepthStatus::Critical
        } else if depth >= self.config.warning_threshold {
            QueueDepthStatus::Warning
        } else {
            QueueDepthStatus::Normal
        }
    }

    /// Wait until a task completes or fails for good.
    ///
    /// Resolves immediately for tasks that already finished. `timeout`
    /// bounds the wait; exceeding it yields [`Error::Timeout`].
    pub async fn wait_until_finished(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> Result<FinishedTask> {
        let wait = self.wait_for_finish(task_id);
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| Error::Timeout(format!("waiting for task {}", task_id)))?,
            None => wait.await,
        }
    }

    async fn wait_for_finish(&self, task_id: &str) -> Result<FinishedTask> {
        // Subscribe before the first read so no finish event slips between.
        let mut events = self.events.subscribe();
        let mut poll = tokio::time::interval(Duration::from_millis(
            self.config.finished_poll_interval_ms.max(1),
        ));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    let task = self.require_task(task_id).await?;
                    if let Some(finished) = FinishedTask::from_task(&task) {
                        return Ok(finished);
                    }
                }
                event = events.recv() => match event {
                    Ok(event) if event.task_id == task_id => match event.kind {
                        TaskEventKind::Completed(value) => {
                            return Ok(FinishedTask::Completed(value));
                        }
                        TaskEventKind::Failed(reason) => return Ok(FinishedTask::Failed(reason)),
                        _ => {}
                    },
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(task_id, skipped, "Finish waiter lagged, re-reading store");
                        poll.reset_immediately();
                    }
                    Err(RecvError::Closed) => {
                        return Err(Error::Other("task event channel closed".to_string()));
                    }
                }
            }
        }
    }

    /// Run one stalled-task sweep. Returns the number of tasks touched.
    pub async fn recover_stalled(&self) -> Result<usize> {
        let recovery = self
            .store
            .recover_stalled(Utc::now(), self.config.max_stalled_count)
            .await?;

        for task in &recovery.requeued {
            warn!(
                task_id = %task.id,
                queue = %task.queue,
                stalled_count = task.stalled_count,
                "Task lock expired, returned to queue"
            );
            self.emit(task, TaskEventKind::Stalled);
            self.notifier(&task.queue).notify_one();
        }
        for task in &recovery.failed {
            error!(
                task_id = %task.id,
                queue = %task.queue,
                stalled_count = task.stalled_count,
                "Task stalled too many times, failing"
            );
            self.emit(
                task,
                TaskEventKind::Failed(
                    task.failed_reason
                        .clone()
                        .unwrap_or_else(|| "stalled".to_string()),
                ),
            );
        }

        Ok(recovery.requeued.len() + recovery.failed.len())
    }

    /// Periodically return tasks with expired locks to the queue.
    pub fn start_stall_monitor(self: &Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        let queue = self.clone();
        let every = Duration::from_millis(self.config.stalled_check_interval_ms.max(1));
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = queue.recover_stalled().await {
                            warn!(error = %e, "Stalled task sweep failed");
                        }
                    }
                }
            }
            debug!("Stall monitor stopped");
        })
    }
}

fn lock_deadline(now: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>> {
    let delta = TimeDelta::from_std(duration)
        .map_err(|e| Error::config(format!("duration out of range: {}", e)))?;
    Ok(now + delta)
}

/// Handle to a single task on a queue.
#[derive(Clone)]
pub struct TaskHandle {
    id: String,
    queue: String,
    task_queue: Arc<TaskQueue>,
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .finish()
    }
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub async fn update_progress(&self, progress: u8) -> Result<()> {
        self.task_queue.update_progress(&self.id, progress).await
    }

    pub async fn update_data<T: Serialize>(&self, data: &T) -> Result<()> {
        self.task_queue
            .update_data(&self.id, &serde_json::to_value(data)?)
            .await
    }

    pub async fn current_data(&self) -> Result<Value> {
        self.task_queue.current_data(&self.id).await
    }

    pub async fn current_data_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.current_data().await?)?)
    }

    /// Live read of the `cancelled` flag in the stored payload.
    ///
    /// Cancellation is cooperative: whoever cancels sets the flag through
    /// [`TaskQueue::update_data`], the handler polls it here.
    pub async fn is_cancelled(&self) -> Result<bool> {
        let data = self.current_data().await?;
        Ok(data
            .get("cancelled")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    pub async fn task(&self) -> Result<Task> {
        self.task_queue.require_task(&self.id).await
    }

    pub async fn state(&self) -> Result<TaskState> {
        Ok(self.task().await?.state)
    }

    pub async fn wait_until_finished(&self, timeout: Option<Duration>) -> Result<FinishedTask> {
        self.task_queue.wait_until_finished(&self.id, timeout).await
    }
}
