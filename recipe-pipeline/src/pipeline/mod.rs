//! Recipe generation pipeline.
//!
//! Two named queues share one [`TaskQueue`]:
//! - `recipe-generation`: one task per request, run by [`RecipeOrchestrator`]
//! - `image-generation`: one task per recipe step, run by [`ImageTaskHandler`]
//!
//! The orchestrator fans out image tasks and waits for all of them; partial
//! results are published as they arrive. [`PipelineManager`] owns the worker
//! pools and the background maintenance tasks.

pub mod fan_out;
mod manager;
pub mod processors;
pub mod progress;
pub mod purge;
pub mod retry;
pub mod task_queue;
pub mod task_store;
pub mod worker_pool;

/// Queue of top-level generation requests.
pub const RECIPE_QUEUE: &str = "recipe-generation";
/// Queue of per-step image tasks.
pub const IMAGE_QUEUE: &str = "image-generation";

pub use fan_out::{ImageFanOut, assemble};
pub use manager::{
    GenerationStatus, PipelineManager, PipelineManagerConfig, PipelineServices, PipelineStats,
};
pub use processors::{
    ImageHandlerConfig, ImageTaskHandler, RecipeOrchestrator, TaskContext, TaskHandler,
};
pub use progress::ProgressReporter;
pub use purge::{PurgeConfig, TaskPurgeService};
pub use retry::retry_with_backoff;
pub use task_queue::{
    EnqueueOptions, FinishedTask, QueueDepthStatus, Task, TaskEvent, TaskEventKind, TaskHandle,
    TaskQueue, TaskQueueConfig, TaskState,
};
pub use task_store::{InMemoryTaskStore, TaskCounts, TaskStore};
pub use worker_pool::{WorkerPool, WorkerPoolConfig};
