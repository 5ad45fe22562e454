//! Task handler trait and related types.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::Result;
use crate::pipeline::progress::ProgressReporter;
use crate::pipeline::task_queue::{Task, TaskHandle};

/// A claimed task as seen by its handler.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Snapshot of the task at claim time.
    pub task: Task,
    /// Live handle for progress, payload reads and payload updates.
    pub handle: TaskHandle,
    /// Worker holding the lock.
    pub worker_id: String,
}

impl TaskContext {
    pub fn new(task: Task, handle: TaskHandle, worker_id: impl Into<String>) -> Self {
        Self {
            task,
            handle,
            worker_id: worker_id.into(),
        }
    }

    /// Payload as enqueued (or as last updated before the claim).
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        self.task.payload()
    }

    pub fn progress(&self) -> ProgressReporter {
        ProgressReporter::new(self.handle.clone())
    }
}

/// Processes tasks of one queue.
///
/// `Ok` completes the task with the returned value. `Err` counts as a failed
/// attempt and is retried while the task has attempts left.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Handler name, used in logs.
    fn name(&self) -> &'static str;

    async fn handle(&self, ctx: &TaskContext) -> Result<Value>;
}
