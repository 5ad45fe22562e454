//! Fan-out of one image task per recipe step, and fan-in of their outcomes.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::IMAGE_QUEUE;
use super::progress::{ProgressReporter, fan_out_progress};
use super::task_queue::{EnqueueOptions, FinishedTask, TaskHandle, TaskQueue};
use crate::Result;
use crate::domain::{GenerationTask, ImageTask, Recipe, TaskOutcome};

/// Name given to enqueued image tasks.
pub const IMAGE_TASK_NAME: &str = "generate-step-image";

/// Result of the fan-out phase.
#[derive(Debug)]
pub enum Dispatch {
    /// One handle per step, in step order.
    Dispatched(Vec<TaskHandle>),
    /// Cancellation was observed before step `enqueued` was dispatched.
    Cancelled { enqueued: usize },
}

/// How one image task ended, as seen by the orchestrator.
#[derive(Debug)]
pub struct CollectedOutcome {
    /// Step the task was enqueued for.
    pub expected_index: usize,
    pub result: Result<TaskOutcome>,
}

pub struct ImageFanOut {
    queue: Arc<TaskQueue>,
    options: EnqueueOptions,
    wait_timeout: Duration,
}

impl ImageFanOut {
    pub fn new(queue: Arc<TaskQueue>, options: EnqueueOptions, wait_timeout: Duration) -> Self {
        Self {
            queue,
            options,
            wait_timeout,
        }
    }

    /// Enqueue one image task per step, checking `parent` for cancellation
    /// before each enqueue.
    ///
    /// `snapshot` is attached to each task so the image handler can publish
    /// partial results; pass `None` to disable per-step publishing.
    pub async fn dispatch(
        &self,
        parent: &TaskHandle,
        request: &GenerationTask,
        recipe: &Recipe,
        snapshot: Option<&Recipe>,
        progress: &ProgressReporter,
    ) -> Result<Dispatch> {
        let total = recipe.steps.len();
        let mut handles = Vec::with_capacity(total);

        for (step_index, step) in recipe.steps.iter().enumerate() {
            if parent.is_cancelled().await? {
                info!(enqueued = step_index, total, "Cancelled during image fan-out");
                return Ok(Dispatch::Cancelled {
                    enqueued: step_index,
                });
            }

            let task = ImageTask {
                prompt: image_prompt(&recipe.title, step.image_subject()),
                recipe_id: recipe.id.clone(),
                step_index,
                request_id: Some(request.request_id.clone()),
                recipe_snapshot: snapshot.cloned(),
                subscription_tier: request.subscription_tier,
            };
            let handle = self
                .queue
                .enqueue(IMAGE_QUEUE, IMAGE_TASK_NAME, &task, self.options.clone())
                .await?;
            debug!(step_index, image_task_id = %handle.id(), "Enqueued image task");
            handles.push(handle);

            progress
                .report(fan_out_progress(step_index + 1, total))
                .await;
        }

        Ok(Dispatch::Dispatched(handles))
    }

    /// Wait for every image task concurrently. Failures are returned per
    /// step, never as an overall error.
    pub async fn collect(&self, handles: &[TaskHandle]) -> Vec<CollectedOutcome> {
        let waits = handles.iter().enumerate().map(|(expected_index, handle)| async move {
            let result = match handle.wait_until_finished(Some(self.wait_timeout)).await {
                Ok(FinishedTask::Completed(value)) => {
                    serde_json::from_value::<TaskOutcome>(value).map_err(Into::into)
                }
                Ok(FinishedTask::Failed(reason)) => Err(crate::Error::external(
                    "image-task",
                    format!("task {} failed: {}", handle.id(), reason),
                )),
                Err(e) => Err(e),
            };
            CollectedOutcome {
                expected_index,
                result,
            }
        });
        join_all(waits).await
    }
}

/// Prompt sent to the image service for one step.
pub fn image_prompt(title: &str, subject: &str) -> String {
    format!(
        "Appetizing food photograph for the recipe \"{}\": {}",
        title.trim(),
        subject.trim()
    )
}

/// Write successful image URLs into `recipe`, keyed by step index.
///
/// An outcome reporting a different step than the one its task was
/// enqueued for is discarded. Missing or failed outcomes leave the step
/// without an image. Returns the number of images applied.
pub fn assemble(recipe: &mut Recipe, outcomes: Vec<CollectedOutcome>) -> usize {
    let mut applied = 0;
    for collected in outcomes {
        let index = collected.expected_index;
        let outcome = match collected.result {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(step_index = index, error = %e, "No outcome for image task");
                continue;
            }
        };

        if outcome.step_index != index {
            warn!(
                expected = index,
                reported = outcome.step_index,
                "Image outcome for unexpected step, discarding"
            );
            continue;
        }

        match (outcome.image_url, recipe.steps.get_mut(index)) {
            (Some(url), Some(step)) => {
                step.image_url = Some(url);
                applied += 1;
            }
            (None, _) => {
                debug!(
                    step_index = index,
                    error = outcome.error.as_deref().unwrap_or("unknown"),
                    "Step has no image"
                );
            }
            (Some(_), None) => {
                warn!(step_index = index, "Image outcome for missing step, discarding");
            }
        }
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::domain::parse_generated_recipe;

    fn recipe(steps: usize) -> Recipe {
        let steps: Vec<String> = (0..steps).map(|i| format!("\"step {}\"", i)).collect();
        let raw = format!(r#"{{"title": "Pie", "steps": [{}]}}"#, steps.join(","));
        Recipe::from_generated("r-1", "pie", parse_generated_recipe(&raw).unwrap())
    }

    fn ok(expected_index: usize, reported: usize) -> CollectedOutcome {
        CollectedOutcome {
            expected_index,
            result: Ok(TaskOutcome::success(
                reported,
                format!("https://cdn/{}.png", reported),
            )),
        }
    }

    #[test]
    fn test_assemble_is_order_independent() {
        let mut forward = recipe(3);
        let mut reversed = recipe(3);

        assemble(&mut forward, vec![ok(0, 0), ok(1, 1), ok(2, 2)]);
        assemble(&mut reversed, vec![ok(2, 2), ok(0, 0), ok(1, 1)]);

        assert_eq!(forward.steps, reversed.steps);
        assert_eq!(forward.resolved_images(), 3);
    }

    #[test]
    fn test_assemble_skips_failures_and_mismatches() {
        let mut r = recipe(4);
        let applied = assemble(
            &mut r,
            vec![
                ok(0, 0),
                CollectedOutcome {
                    expected_index: 1,
                    result: Ok(TaskOutcome::failure(1, "boom")),
                },
                ok(2, 3),
                CollectedOutcome {
                    expected_index: 3,
                    result: Err(Error::Timeout("waiting".into())),
                },
            ],
        );

        assert_eq!(applied, 1);
        assert!(r.steps[0].image_url.is_some());
        assert!(r.steps[1].image_url.is_none());
        assert!(r.steps[2].image_url.is_none());
        assert!(r.steps[3].image_url.is_none());
        assert_eq!(r.steps.len(), 4);
    }

    #[test]
    fn test_image_prompt() {
        assert_eq!(
            image_prompt(" Pie ", "crimped edges "),
            "Appetizing food photograph for the recipe \"Pie\": crimped edges"
        );
    }
}
