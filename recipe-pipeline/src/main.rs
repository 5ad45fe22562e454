use std::time::Duration;

use anyhow::Context;
use recipe_pipeline::config::AppConfig;
use recipe_pipeline::domain::GenerationTask;
use recipe_pipeline::logging;
use recipe_pipeline::services::ServiceContainer;
use tokio_util::sync::CancellationToken;

/// How long a one-shot run waits for its result.
const ONE_SHOT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration (reads .env first)
    let config = AppConfig::from_env().context("loading configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit
    let (logging, _log_guard) = logging::init_logging(&config.log)?;
    let shutdown = CancellationToken::new();
    logging.start_retention_cleanup(shutdown.child_token());

    let container = ServiceContainer::new(config).await?;
    container.initialize().await?;
    tracing::info!("recipe-pipeline started");

    let query: Vec<String> = std::env::args().skip(1).collect();
    let result = if query.is_empty() {
        tokio::signal::ctrl_c()
            .await
            .context("waiting for Ctrl-C")?;
        tracing::info!("Shutdown signal received");
        Ok(())
    } else {
        run_once(&container, query.join(" ")).await
    };

    container.shutdown().await;
    shutdown.cancel();
    result
}

/// Submit one query, wait for its outcome and print it as JSON.
async fn run_once(container: &ServiceContainer, query: String) -> anyhow::Result<()> {
    let request_id = uuid::Uuid::new_v4().to_string();
    let request = GenerationTask::new(query, request_id).with_progressive_display(true);

    let manager = &container.pipeline_manager;
    let task_id = manager.submit(request).await?;
    let outcome = manager
        .wait_for_result(&task_id, Some(ONE_SHOT_TIMEOUT))
        .await?;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}
