//! Worker pool implementation for queue processing.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::processors::{TaskContext, TaskHandler};
use super::task_queue::{Task, TaskQueue};

/// Configuration for a worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of tasks processed in parallel.
    pub max_workers: usize,
    /// Lock duration of a claimed task. Renewed by a heartbeat every half period.
    pub lock_duration_ms: u64,
    /// Task timeout in seconds.
    ///
    /// If a task exceeds this duration, the handler future is dropped and the
    /// attempt counts as failed. Handlers must be cancel-safe.
    pub task_timeout_secs: u64,
    /// Poll interval in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            lock_duration_ms: 30_000,
            task_timeout_secs: 3600, // 1 hour
            poll_interval_ms: 500,
        }
    }
}

impl WorkerPoolConfig {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms.max(1))
    }
}

/// A pool of workers consuming one named queue.
pub struct WorkerPool {
    /// Queue consumed by this pool.
    queue_name: String,
    config: WorkerPoolConfig,
    /// Number of workers currently running a task.
    active_workers: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl WorkerPool {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self::with_config(queue_name, WorkerPoolConfig::default())
    }

    pub fn with_config(queue_name: impl Into<String>, config: WorkerPoolConfig) -> Self {
        Self {
            queue_name: queue_name.into(),
            config,
            active_workers: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Start the worker pool.
    pub fn start(&self, task_queue: Arc<TaskQueue>, handler: Arc<dyn TaskHandler>) {
        let poll_interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let task_timeout = Duration::from_secs(self.config.task_timeout_secs);
        let lock_duration = self.config.lock_duration();
        let instance = uuid::Uuid::new_v4().simple().to_string();

        info!(
            "Starting {} worker pool ({}) with {} workers",
            self.queue_name,
            handler.name(),
            self.config.max_workers
        );

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            warn!("{} worker pool already stopped", self.queue_name);
            return;
        };

        for i in 0..self.config.max_workers.max(1) {
            let worker = Worker {
                id: format!("{}-{}-{}", self.queue_name, &instance[..8], i),
                queue_name: self.queue_name.clone(),
                task_queue: task_queue.clone(),
                handler: handler.clone(),
                active_workers: self.active_workers.clone(),
                lock_duration,
                task_timeout,
            };
            let cancellation_token = self.cancellation_token.clone();
            let notifier = task_queue.notifier(&self.queue_name);

            join_set.spawn(async move {
                debug!("{} worker {} started", worker.queue_name, worker.id);

                loop {
                    if cancellation_token.is_cancelled() {
                        debug!("{} worker {} shutting down", worker.queue_name, worker.id);
                        break;
                    }

                    let task = match worker
                        .task_queue
                        .claim(&worker.queue_name, &worker.id, worker.lock_duration)
                        .await
                    {
                        Ok(Some(task)) => task,
                        Ok(None) => {
                            // Wait for a task or timeout
                            tokio::select! {
                                _ = cancellation_token.cancelled() => break,
                                _ = notifier.notified() => {}
                                _ = tokio::time::sleep(poll_interval) => {}
                            }
                            continue;
                        }
                        Err(e) => {
                            error!("Error claiming task on {}: {}", worker.queue_name, e);
                            tokio::select! {
                                _ = cancellation_token.cancelled() => break,
                                _ = tokio::time::sleep(poll_interval) => {}
                            }
                            continue;
                        }
                    };

                    let span = info_span!(
                        "task",
                        task_id = %task.id,
                        queue = %worker.queue_name,
                        attempt = task.attempts_made
                    );
                    worker.run(task).instrument(span).await;
                }
            });
        }
    }

    /// Stop the worker pool, letting in-flight tasks finish.
    pub async fn stop(&self) {
        info!("Stopping {} worker pool", self.queue_name);
        self.cancellation_token.cancel();

        // Take the join set out of the mutex before awaiting
        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("{} worker pool stopped", self.queue_name);
    }

    /// Get the number of workers currently running a task.
    pub fn active_count(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}

struct Worker {
    id: String,
    queue_name: String,
    task_queue: Arc<TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    active_workers: Arc<AtomicUsize>,
    lock_duration: Duration,
    task_timeout: Duration,
}

impl Worker {
    async fn run(&self, task: Task) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
        debug!("{} processing task {}", self.handler.name(), task.id);

        let heartbeat = CancellationToken::new();
        let heartbeat_handle = spawn_heartbeat(
            self.task_queue.clone(),
            task.id.clone(),
            self.id.clone(),
            self.lock_duration,
            heartbeat.clone(),
        );

        let ctx = TaskContext::new(
            task.clone(),
            self.task_queue.handle(&task.id, &self.queue_name),
            self.id.clone(),
        );
        let result = tokio::time::timeout(self.task_timeout, self.handler.handle(&ctx)).await;

        heartbeat.cancel();
        let _ = heartbeat_handle.await;

        let outcome = match result {
            Ok(Ok(value)) => self.task_queue.complete(&task, &self.id, value).await,
            Ok(Err(e)) => self
                .task_queue
                .fail(&task, &self.id, &e.to_string())
                .await
                .map(|_| ()),
            Err(_) => self
                .task_queue
                .fail(&task, &self.id, "Task timed out")
                .await
                .map(|_| ()),
        };
        if let Err(e) = outcome {
            warn!("Failed to record outcome of task {}: {}", task.id, e);
        }

        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Keep renewing the lock of an active task until `stop` fires.
fn spawn_heartbeat(
    task_queue: Arc<TaskQueue>,
    task_id: String,
    worker_id: String,
    lock_duration: Duration,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(lock_duration / 2);
        // First tick fires immediately; the claim just set the lock.
        tick.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tick.tick() => {
                    match task_queue.extend_lock(&task_id, &worker_id, lock_duration).await {
                        Ok(true) => debug!("Renewed lock of task {}", task_id),
                        Ok(false) => {
                            warn!("Lost lock of task {}; another worker may pick it up", task_id);
                            break;
                        }
                        Err(e) => warn!("Failed to renew lock of task {}: {}", task_id, e),
                    }
                }
            }
        }
    })
}
