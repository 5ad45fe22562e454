//! Recipe generation orchestrator.
//!
//! Drives one generation request from query to finished recipe:
//! content generation, image fan-out, fan-in and persistence. Cancellation
//! is cooperative and observed at fixed checkpoints.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{Instrument, error, info, info_span, warn};

use super::traits::{TaskContext, TaskHandler};
use crate::Result;
use crate::domain::{GenerationOutcome, GenerationTask, Recipe, parse_generated_recipe};
use crate::pipeline::fan_out::{Dispatch, ImageFanOut, assemble};
use crate::pipeline::progress::{CONTENT_READY_PROGRESS, ProgressReporter};
use crate::pipeline::task_queue::TaskHandle;
use crate::services::{ContentGenerator, ProgressPublisher, RecipeStore};

const STARTED_PROGRESS: u8 = 5;

/// Point in the run at which cancellation is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
enum Checkpoint {
    /// Before any external call.
    Start,
    /// After content generation, before any image task exists.
    ContentReady,
    /// After every image task has finished.
    ImagesCollected,
}

/// Handler of the recipe-generation queue.
pub struct RecipeOrchestrator {
    content: Arc<dyn ContentGenerator>,
    publisher: Arc<dyn ProgressPublisher>,
    recipes: Arc<dyn RecipeStore>,
    fan_out: ImageFanOut,
}

impl RecipeOrchestrator {
    pub fn new(
        content: Arc<dyn ContentGenerator>,
        publisher: Arc<dyn ProgressPublisher>,
        recipes: Arc<dyn RecipeStore>,
        fan_out: ImageFanOut,
    ) -> Self {
        Self {
            content,
            publisher,
            recipes,
            fan_out,
        }
    }

    /// Run one request to its terminal outcome.
    ///
    /// Never fails: errors become [`GenerationOutcome::Failed`] with progress
    /// forced to 100.
    pub async fn run(&self, request: &GenerationTask, handle: &TaskHandle) -> GenerationOutcome {
        let progress = ProgressReporter::new(handle.clone());
        match self.execute(request, handle, &progress).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Recipe generation failed");
                progress.report(100).await;
                GenerationOutcome::failed(e.to_string())
            }
        }
    }

    async fn execute(
        &self,
        request: &GenerationTask,
        handle: &TaskHandle,
        progress: &ProgressReporter,
    ) -> Result<GenerationOutcome> {
        progress.report(STARTED_PROGRESS).await;
        if cancelled_at(handle, Checkpoint::Start).await? {
            return Ok(GenerationOutcome::Cancelled);
        }

        let raw = self
            .content
            .generate(&request.query, request.user_preferences.as_ref())
            .await?;
        let generated = parse_generated_recipe(&raw)?;
        let mut recipe = Recipe::from_generated(&request.id, &request.query, generated);
        info!(
            title = %recipe.title,
            steps = recipe.steps.len(),
            "Recipe content generated"
        );

        progress.report(CONTENT_READY_PROGRESS).await;
        if cancelled_at(handle, Checkpoint::ContentReady).await? {
            return Ok(GenerationOutcome::Cancelled);
        }

        if request.progressive_display {
            self.publish_initial(&request.request_id, &recipe);
        }

        let snapshot = request.progressive_display.then_some(&recipe);
        let handles = match self
            .fan_out
            .dispatch(handle, request, &recipe, snapshot, progress)
            .await?
        {
            Dispatch::Dispatched(handles) => handles,
            Dispatch::Cancelled { .. } => return Ok(GenerationOutcome::Cancelled),
        };

        let outcomes = self.fan_out.collect(&handles).await;

        if cancelled_at(handle, Checkpoint::ImagesCollected).await? {
            return Ok(GenerationOutcome::Cancelled);
        }

        let applied = assemble(&mut recipe, outcomes);
        recipe.quality_score = Some(recipe.compute_quality_score());
        info!(
            images = applied,
            steps = recipe.steps.len(),
            quality_score = recipe.quality_score,
            "Recipe assembled"
        );

        self.persist(request, &recipe).await;

        progress.report(100).await;
        Ok(GenerationOutcome::completed(recipe))
    }

    /// Publish the imageless recipe shape without waiting for the store.
    fn publish_initial(&self, request_id: &str, recipe: &Recipe) {
        let publisher = self.publisher.clone();
        let request_id = request_id.to_string();
        let recipe = recipe.clone();
        tokio::spawn(
            async move {
                if let Err(e) = publisher.publish_partial(&request_id, &recipe, None).await {
                    warn!(error = %e, "Failed to publish initial recipe");
                }
            }
            .in_current_span(),
        );
    }

    async fn persist(&self, request: &GenerationTask, recipe: &Recipe) {
        if !request.persist {
            return;
        }
        let Some(user_id) = request.user_id.as_deref() else {
            warn!("Persistence requested without a user, skipping");
            return;
        };
        if let Err(e) = self.recipes.save(recipe, user_id).await {
            error!(user_id, error = %e, "Failed to persist recipe");
        }
    }
}

async fn cancelled_at(handle: &TaskHandle, checkpoint: Checkpoint) -> Result<bool> {
    let cancelled = handle.is_cancelled().await?;
    if cancelled {
        info!(%checkpoint, "Generation cancelled");
    }
    Ok(cancelled)
}

#[async_trait]
impl TaskHandler for RecipeOrchestrator {
    fn name(&self) -> &'static str {
        "recipe-generation"
    }

    async fn handle(&self, ctx: &TaskContext) -> Result<Value> {
        let outcome = match ctx.payload::<GenerationTask>() {
            Ok(request) => {
                let span = info_span!(
                    "generation",
                    recipe_id = %request.id,
                    request_id = %request.request_id
                );
                self.run(&request, &ctx.handle).instrument(span).await
            }
            Err(e) => {
                error!(error = %e, "Malformed generation request");
                ctx.progress().report(100).await;
                GenerationOutcome::failed(format!("malformed request: {}", e))
            }
        };
        Ok(serde_json::to_value(outcome)?)
    }
}
