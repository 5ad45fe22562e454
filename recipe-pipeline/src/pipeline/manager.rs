//! Pipeline Manager: owns the queues' worker pools and background tasks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fan_out::ImageFanOut;
use super::processors::{ImageHandlerConfig, ImageTaskHandler, RecipeOrchestrator};
use super::purge::{PurgeConfig, TaskPurgeService};
use super::task_queue::{EnqueueOptions, FinishedTask, QueueDepthStatus, TaskQueue, TaskState};
use super::task_store::TaskCounts;
use super::worker_pool::{WorkerPool, WorkerPoolConfig};
use super::{IMAGE_QUEUE, RECIPE_QUEUE};
use crate::config::AppConfig;
use crate::domain::{GenerationOutcome, GenerationTask};
use crate::services::{
    ByteFetcher, ContentGenerator, ImageGenerator, ObjectStorage, PartialRecipe,
    ProgressPublisher, RecipeStore,
};
use crate::{Error, Result};

/// Name given to enqueued generation tasks.
const GENERATION_TASK_NAME: &str = "generate-recipe";

/// Configuration for the Pipeline Manager.
#[derive(Debug, Clone)]
pub struct PipelineManagerConfig {
    pub recipe_pool: WorkerPoolConfig,
    pub image_pool: WorkerPoolConfig,
    pub recipe_enqueue: EnqueueOptions,
    pub image_enqueue: EnqueueOptions,
    pub image_handler: ImageHandlerConfig,
    /// Upper bound on the orchestrator's wait for image tasks.
    pub image_wait_timeout: Duration,
    pub purge: PurgeConfig,
}

impl Default for PipelineManagerConfig {
    fn default() -> Self {
        Self {
            recipe_pool: WorkerPoolConfig {
                max_workers: 2,
                lock_duration_ms: 60_000,
                ..Default::default()
            },
            image_pool: WorkerPoolConfig {
                max_workers: 3,
                lock_duration_ms: 300_000,
                ..Default::default()
            },
            recipe_enqueue: EnqueueOptions::default(),
            image_enqueue: EnqueueOptions::default().with_attempts(4, Duration::from_secs(2)),
            image_handler: ImageHandlerConfig::default(),
            image_wait_timeout: Duration::from_secs(600),
            purge: PurgeConfig::default(),
        }
    }
}

impl PipelineManagerConfig {
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            recipe_pool: config.recipe_queue.worker_pool(),
            image_pool: config.image_queue.worker_pool(),
            recipe_enqueue: config.recipe_queue.enqueue_options(),
            image_enqueue: config.image_queue.enqueue_options(),
            image_handler: ImageHandlerConfig {
                stage_retry: config.image_stage_retry.clone(),
                fetch_timeout: config.image_fetch_timeout(),
            },
            image_wait_timeout: config.image_wait_timeout(),
            purge: config.purge.clone(),
        }
    }
}

/// External collaborators of the pipeline.
#[derive(Clone)]
pub struct PipelineServices {
    pub content: Arc<dyn ContentGenerator>,
    pub images: Arc<dyn ImageGenerator>,
    pub fetcher: Arc<dyn ByteFetcher>,
    pub storage: Arc<dyn ObjectStorage>,
    pub recipes: Arc<dyn RecipeStore>,
    pub publisher: Arc<dyn ProgressPublisher>,
}

/// Snapshot of a generation request as seen by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStatus {
    pub task_id: String,
    pub state: TaskState,
    pub progress: u8,
    pub attempts_made: u32,
    /// Set once the task completed.
    pub outcome: Option<GenerationOutcome>,
    /// Set if the task failed outside the orchestrator (timeout, stall).
    pub failed_reason: Option<String>,
}

/// Queue statistics for both pipeline queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub recipe: TaskCounts,
    pub image: TaskCounts,
    pub recipe_depth_status: QueueDepthStatus,
}

/// The Pipeline Manager service.
pub struct PipelineManager {
    config: PipelineManagerConfig,
    queue: Arc<TaskQueue>,
    publisher: Arc<dyn ProgressPublisher>,
    orchestrator: Arc<RecipeOrchestrator>,
    image_handler: Arc<ImageTaskHandler>,
    recipe_pool: WorkerPool,
    image_pool: WorkerPool,
    purge_service: Arc<TaskPurgeService>,
    cancellation_token: CancellationToken,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl PipelineManager {
    pub fn new(
        config: PipelineManagerConfig,
        queue: Arc<TaskQueue>,
        services: PipelineServices,
    ) -> Self {
        let fan_out = ImageFanOut::new(
            queue.clone(),
            config.image_enqueue.clone(),
            config.image_wait_timeout,
        );
        let orchestrator = Arc::new(RecipeOrchestrator::new(
            services.content,
            services.publisher.clone(),
            services.recipes,
            fan_out,
        ));
        let image_handler = Arc::new(ImageTaskHandler::new(
            services.images,
            services.fetcher,
            services.storage,
            services.publisher.clone(),
            config.image_handler.clone(),
        ));
        let purge_service = Arc::new(TaskPurgeService::new(
            config.purge.clone(),
            queue.store().clone(),
        ));

        Self {
            recipe_pool: WorkerPool::with_config(RECIPE_QUEUE, config.recipe_pool.clone()),
            image_pool: WorkerPool::with_config(IMAGE_QUEUE, config.image_pool.clone()),
            config,
            queue,
            publisher: services.publisher,
            orchestrator,
            image_handler,
            purge_service,
            cancellation_token: CancellationToken::new(),
            background: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn config(&self) -> &PipelineManagerConfig {
        &self.config
    }

    /// Start worker pools, the stall monitor and the purge loop.
    pub async fn start(&self) -> Result<()> {
        info!("Starting Pipeline Manager");

        // Tasks left active by a previous process get their locks checked first.
        let recovered = self.queue.recover_stalled().await?;
        if recovered > 0 {
            info!(recovered, "Recovered stalled tasks from previous run");
        }

        self.image_pool
            .start(self.queue.clone(), self.image_handler.clone());
        self.recipe_pool
            .start(self.queue.clone(), self.orchestrator.clone());

        let mut background = self.background.lock();
        background.push(
            self.queue
                .start_stall_monitor(self.cancellation_token.child_token()),
        );
        if self.config.purge.retention_hours > 0 {
            background.push(
                self.purge_service
                    .start_background_task(self.cancellation_token.child_token()),
            );
        }

        info!("Pipeline Manager started");
        Ok(())
    }

    /// Enqueue a generation request. Returns the task id.
    pub async fn submit(&self, request: GenerationTask) -> Result<String> {
        if request.query.trim().is_empty() {
            return Err(Error::validation("query must not be empty"));
        }
        if request.persist && request.user_id.is_none() {
            warn!(recipe_id = %request.id, "Persistence requested without a user id");
        }

        let handle = self
            .queue
            .enqueue(
                RECIPE_QUEUE,
                GENERATION_TASK_NAME,
                &request,
                self.config.recipe_enqueue.clone().with_depth_limit(),
            )
            .await?;

        info!(
            task_id = %handle.id(),
            recipe_id = %request.id,
            request_id = %request.request_id,
            "Generation request submitted"
        );
        Ok(handle.id().to_string())
    }

    /// Request cancellation of a generation task.
    ///
    /// Returns `false` if the task already finished. A running task stops
    /// at its next checkpoint; a waiting one stops as soon as it is claimed.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let task = self
            .queue
            .get_task(task_id)
            .await?
            .ok_or_else(|| Error::not_found("Task", task_id))?;
        if task.queue != RECIPE_QUEUE {
            return Err(Error::validation(format!(
                "task {} is not a generation task",
                task_id
            )));
        }
        if task.state.is_terminal() {
            debug!(task_id, state = %task.state, "Cancel ignored for finished task");
            return Ok(false);
        }

        let mut data = task.data;
        match data.as_object_mut() {
            Some(fields) => {
                fields.insert("cancelled".to_string(), Value::Bool(true));
            }
            None => return Err(Error::validation("generation payload is not an object")),
        }
        self.queue.update_data(task_id, &data).await?;

        info!(task_id, "Cancellation requested");
        Ok(true)
    }

    pub async fn status(&self, task_id: &str) -> Result<Option<GenerationStatus>> {
        let Some(task) = self.queue.get_task(task_id).await? else {
            return Ok(None);
        };

        let outcome = match (&task.state, &task.return_value) {
            (TaskState::Completed, Some(value)) => {
                Some(serde_json::from_value::<GenerationOutcome>(value.clone())?)
            }
            _ => None,
        };

        Ok(Some(GenerationStatus {
            task_id: task.id,
            state: task.state,
            progress: task.progress,
            attempts_made: task.attempts_made,
            outcome,
            failed_reason: task.failed_reason.filter(|_| task.state == TaskState::Failed),
        }))
    }

    /// Wait for a generation task to reach its terminal outcome.
    ///
    /// A task that failed at the queue level (timeout, stall) is reported
    /// as [`GenerationOutcome::Failed`].
    pub async fn wait_for_result(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> Result<GenerationOutcome> {
        match self.queue.wait_until_finished(task_id, timeout).await? {
            FinishedTask::Completed(value) => Ok(serde_json::from_value(value)?),
            FinishedTask::Failed(reason) => Ok(GenerationOutcome::failed(reason)),
        }
    }

    /// Latest partial result published for `request_id`.
    pub async fn partial(&self, request_id: &str) -> Result<Option<PartialRecipe>> {
        self.publisher.get_partial(request_id).await
    }

    pub async fn stats(&self) -> Result<PipelineStats> {
        Ok(PipelineStats {
            recipe: self.queue.counts(RECIPE_QUEUE).await?,
            image: self.queue.counts(IMAGE_QUEUE).await?,
            recipe_depth_status: self.queue.depth_status(RECIPE_QUEUE).await?,
        })
    }

    /// Stop accepting work and drain.
    ///
    /// The recipe pool stops first so in-flight generations can still
    /// collect their images.
    pub async fn shutdown(&self) {
        info!("Stopping Pipeline Manager");

        self.recipe_pool.stop().await;
        self.image_pool.stop().await;

        self.cancellation_token.cancel();
        let background: Vec<_> = self.background.lock().drain(..).collect();
        for handle in background {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        info!("Pipeline Manager stopped");
    }
}
