//! Service container for dependency injection.
//!
//! Builds every collaborator from [`AppConfig`] and owns their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{
    HttpByteFetcher, InMemoryProgressPublisher, InMemoryRecipeStore, LocalObjectStorage,
    OpenAiContentGenerator, OpenAiImageGenerator, RecipeStore,
};
use crate::Result;
use crate::config::AppConfig;
use crate::database::repositories::{SqlxRecipeStore, SqlxTaskStore};
use crate::database::{self, DbPool};
use crate::pipeline::{
    InMemoryTaskStore, PipelineManager, PipelineManagerConfig, PipelineServices, TaskQueue,
    TaskStore,
};
use crate::utils::http_client;

/// Idle connections kept per external host.
const HTTP_POOL_MAX_IDLE_PER_HOST: usize = 8;

/// Service container holding all application services.
pub struct ServiceContainer {
    pub config: AppConfig,
    /// Present when a database URL is configured.
    pub pool: Option<DbPool>,
    pub recipes: Arc<dyn RecipeStore>,
    pub publisher: Arc<InMemoryProgressPublisher>,
    pub pipeline_manager: Arc<PipelineManager>,
    cancellation_token: CancellationToken,
    background: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceContainer {
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("Initializing service container");

        let pool = match &config.database.url {
            Some(url) => Some(database::connect(url, config.database.max_connections).await?),
            None => {
                warn!("DATABASE_URL not set, tasks and recipes are kept in memory only");
                None
            }
        };

        let (task_store, recipes): (Arc<dyn TaskStore>, Arc<dyn RecipeStore>) = match &pool {
            Some(pool) => (
                Arc::new(SqlxTaskStore::new(pool.clone())),
                Arc::new(SqlxRecipeStore::new(pool.clone())),
            ),
            None => (
                Arc::new(InMemoryTaskStore::new()),
                Arc::new(InMemoryRecipeStore::new()),
            ),
        };

        // Per-request timeouts come from each endpoint's configuration.
        let client = http_client::build_client(Duration::ZERO, HTTP_POOL_MAX_IDLE_PER_HOST)?;
        if config.content_service.api_key.is_none() || config.image_service.api_key.is_none() {
            warn!("No API key configured for the content or image service");
        }

        let publisher = Arc::new(InMemoryProgressPublisher::new(config.publisher.ttl()));
        let services = PipelineServices {
            content: Arc::new(OpenAiContentGenerator::new(
                client.clone(),
                config.content_service.clone(),
            )),
            images: Arc::new(OpenAiImageGenerator::new(
                client.clone(),
                config.image_service.clone(),
            )),
            fetcher: Arc::new(HttpByteFetcher::new(client)),
            storage: Arc::new(LocalObjectStorage::new(
                config.storage.root_dir.clone(),
                config.storage.public_base_url.clone(),
            )),
            recipes: recipes.clone(),
            publisher: publisher.clone(),
        };

        let queue = Arc::new(TaskQueue::with_config(config.task_queue.clone(), task_store));
        let pipeline_manager = Arc::new(PipelineManager::new(
            PipelineManagerConfig::from_app(&config),
            queue,
            services,
        ));

        info!("Service container initialized");

        Ok(Self {
            config,
            pool,
            recipes,
            publisher,
            pipeline_manager,
            cancellation_token: CancellationToken::new(),
            background: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// Start the pipeline and background maintenance.
    pub async fn initialize(&self) -> Result<()> {
        self.pipeline_manager.start().await?;
        let sweep = self
            .publisher
            .start_expiry_sweep(self.cancellation_token.child_token());
        self.background.lock().push(sweep);
        info!("Services initialized");
        Ok(())
    }

    /// Drain the pipeline, stop background tasks and close the database.
    pub async fn shutdown(&self) {
        info!("Shutting down services");
        self.pipeline_manager.shutdown().await;

        self.cancellation_token.cancel();
        let background: Vec<_> = self.background.lock().drain(..).collect();
        for handle in background {
            let _ = handle.await;
        }

        if let Some(pool) = &self.pool {
            pool.close().await;
        }
        info!("Services shut down");
    }
}
