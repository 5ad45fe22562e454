//! Image generation handler: one recipe step in, one image URL out.
//!
//! Three stages, each retried independently:
//! synthesize (image service) -> fetch (temporary URL) -> store (durable URL).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{Instrument, debug, info, info_span, warn};

use super::traits::{TaskContext, TaskHandler};
use crate::domain::{ImageTask, RetryPolicy, TaskOutcome};
use crate::pipeline::progress::ProgressReporter;
use crate::pipeline::retry::retry_with_backoff;
use crate::services::{
    ByteFetcher, ImageGenerator, ObjectStorage, ProgressPublisher, StepImageUpdate,
};
use crate::{Error, Result};

const SYNTHESIZED_PROGRESS: u8 = 50;
const FETCHED_PROGRESS: u8 = 75;
const STARTED_PROGRESS: u8 = 10;

/// Content type of stored step images.
pub const STEP_IMAGE_CONTENT_TYPE: &str = "image/png";

/// Storage path of a step image. Re-running a step overwrites its image.
pub fn step_image_path(recipe_id: &str, step_index: usize) -> String {
    format!("recipes/{}/step-{}.png", recipe_id, step_index)
}

#[derive(Debug, Clone)]
pub struct ImageHandlerConfig {
    /// Applied to each stage separately.
    pub stage_retry: RetryPolicy,
    pub fetch_timeout: Duration,
}

impl Default for ImageHandlerConfig {
    fn default() -> Self {
        Self {
            stage_retry: RetryPolicy::default(),
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// Handler of the image-generation queue.
pub struct ImageTaskHandler {
    images: Arc<dyn ImageGenerator>,
    fetcher: Arc<dyn ByteFetcher>,
    storage: Arc<dyn ObjectStorage>,
    publisher: Arc<dyn ProgressPublisher>,
    config: ImageHandlerConfig,
}

impl ImageTaskHandler {
    pub fn new(
        images: Arc<dyn ImageGenerator>,
        fetcher: Arc<dyn ByteFetcher>,
        storage: Arc<dyn ObjectStorage>,
        publisher: Arc<dyn ProgressPublisher>,
        config: ImageHandlerConfig,
    ) -> Self {
        Self {
            images,
            fetcher,
            storage,
            publisher,
            config,
        }
    }

    /// Run the three stages for one step and report the outcome.
    ///
    /// Never fails: an exhausted stage becomes `TaskOutcome::error`.
    pub async fn process(&self, task: &ImageTask, progress: &ProgressReporter) -> TaskOutcome {
        progress.report(STARTED_PROGRESS).await;

        let outcome = match self.run_stages(task, progress).await {
            Ok(url) => {
                info!(image_url = %url, "Step image stored");
                TaskOutcome::success(task.step_index, url)
            }
            Err(e) => {
                warn!(error = %e, "Step image failed");
                TaskOutcome::failure(task.step_index, e.to_string())
            }
        };

        self.publish(task, &outcome).await;
        progress.report(100).await;
        outcome.with_request_id(task.request_id.clone())
    }

    async fn run_stages(&self, task: &ImageTask, progress: &ProgressReporter) -> Result<String> {
        let policy = &self.config.stage_retry;
        let profile = task.subscription_tier.image_profile();

        let temp_url = retry_with_backoff("image.synthesize", policy, || async {
            let url = self.images.generate(&task.prompt, profile).await?;
            if url.trim().is_empty() {
                return Err(Error::external("image-generation", "empty image URL"));
            }
            Ok(url)
        })
        .await?;
        progress.report(SYNTHESIZED_PROGRESS).await;

        let fetched = retry_with_backoff("image.fetch", policy, || async {
            let fetched = self
                .fetcher
                .fetch(&temp_url, self.config.fetch_timeout)
                .await?;
            if fetched.bytes.is_empty() {
                return Err(Error::external("image-fetch", "empty image body"));
            }
            Ok(fetched)
        })
        .await?;
        progress.report(FETCHED_PROGRESS).await;
        debug!(
            size = fetched.bytes.len(),
            content_type = ?fetched.content_type,
            "Fetched generated image"
        );

        let path = step_image_path(&task.recipe_id, task.step_index);
        retry_with_backoff("image.store", policy, || {
            self.storage
                .store(fetched.bytes.clone(), &path, STEP_IMAGE_CONTENT_TYPE)
        })
        .await
    }

    /// Push the step result to the partial-result store, if the requester asked for it.
    async fn publish(&self, task: &ImageTask, outcome: &TaskOutcome) {
        let (Some(request_id), Some(snapshot)) = (&task.request_id, &task.recipe_snapshot) else {
            return;
        };

        let update = match &outcome.image_url {
            Some(url) => StepImageUpdate::ready(task.step_index, url.clone()),
            None => StepImageUpdate::failed(task.step_index),
        };
        if let Err(e) = self
            .publisher
            .publish_partial(request_id, snapshot, Some(update))
            .await
        {
            warn!(request_id = %request_id, error = %e, "Failed to publish step image");
        }
    }
}

#[async_trait]
impl TaskHandler for ImageTaskHandler {
    fn name(&self) -> &'static str {
        "image-generation"
    }

    async fn handle(&self, ctx: &TaskContext) -> Result<Value> {
        let task: ImageTask = ctx.payload()?;
        let span = info_span!(
            "image_task",
            recipe_id = %task.recipe_id,
            step_index = task.step_index
        );
        let outcome = self.process(&task, &ctx.progress()).instrument(span).await;
        Ok(serde_json::to_value(outcome)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ImageProfile, Recipe, SubscriptionTier, parse_generated_recipe};
    use crate::pipeline::task_queue::{EnqueueOptions, TaskQueue};
    use crate::services::{FetchedBytes, InMemoryProgressPublisher, StepImageStatus};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyImages {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
        profiles: Mutex<Vec<ImageProfile>>,
    }

    impl FlakyImages {
        fn failing(n: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(n),
                calls: AtomicUsize::new(0),
                profiles: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ImageGenerator for FlakyImages {
        async fn generate(&self, prompt: &str, profile: ImageProfile) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.profiles.lock().push(profile);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::external("image-generation", "rate limited"));
            }
            Ok(format!("https://tmp.example/{}.png", prompt.len()))
        }
    }

    struct StaticFetcher {
        body: &'static [u8],
    }

    #[async_trait]
    impl ByteFetcher for StaticFetcher {
        async fn fetch(&self, _url: &str, _timeout: Duration) -> Result<FetchedBytes> {
            Ok(FetchedBytes {
                bytes: Bytes::from_static(self.body),
                content_type: Some("image/png".to_string()),
            })
        }
    }

    #[derive(Default)]
    struct RecordingStorage {
        paths: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStorage for RecordingStorage {
        async fn store(&self, _bytes: Bytes, path: &str, content_type: &str) -> Result<String> {
            assert_eq!(content_type, STEP_IMAGE_CONTENT_TYPE);
            self.paths.lock().push(path.to_string());
            Ok(format!("https://cdn.example/{}", path))
        }
    }

    fn snapshot() -> Recipe {
        let generated =
            parse_generated_recipe(r#"{"title": "Toast", "steps": ["Slice", "Toast"]}"#).unwrap();
        Recipe::from_generated("r-1", "toast", generated)
    }

    fn image_task(step_index: usize) -> ImageTask {
        ImageTask {
            prompt: "golden toast".to_string(),
            recipe_id: "r-1".to_string(),
            step_index,
            request_id: Some("req-1".to_string()),
            recipe_snapshot: Some(snapshot()),
            subscription_tier: SubscriptionTier::Premium,
        }
    }

    fn handler(
        images: Arc<FlakyImages>,
        body: &'static [u8],
        storage: Arc<RecordingStorage>,
        publisher: Arc<InMemoryProgressPublisher>,
    ) -> ImageTaskHandler {
        ImageTaskHandler::new(
            images,
            Arc::new(StaticFetcher { body }),
            storage,
            publisher,
            ImageHandlerConfig {
                stage_retry: RetryPolicy::exponential(3, Duration::from_secs(2)).without_jitter(),
                fetch_timeout: Duration::from_secs(30),
            },
        )
    }

    async fn reporter(queue: &Arc<TaskQueue>) -> ProgressReporter {
        let handle = queue
            .enqueue("image-generation", "step", &image_task(1), EnqueueOptions::default())
            .await
            .unwrap();
        ProgressReporter::new(handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let queue = Arc::new(TaskQueue::in_memory());
        let progress = reporter(&queue).await;
        let images = Arc::new(FlakyImages::failing(2));
        let storage = Arc::new(RecordingStorage::default());
        let publisher = Arc::new(InMemoryProgressPublisher::new(Duration::from_secs(60)));
        let handler = handler(images.clone(), b"png", storage.clone(), publisher.clone());

        let outcome = handler.process(&image_task(1), &progress).await;

        assert_eq!(
            outcome.image_url.as_deref(),
            Some("https://cdn.example/recipes/r-1/step-1.png")
        );
        assert_eq!(outcome.request_id.as_deref(), Some("req-1"));
        assert_eq!(images.calls.load(Ordering::SeqCst), 3);
        assert_eq!(images.profiles.lock()[0].quality, "hd");
        assert_eq!(*storage.paths.lock(), vec!["recipes/r-1/step-1.png"]);

        let partial = publisher.get_partial("req-1").await.unwrap().unwrap();
        assert!(partial.recipe.steps[1].image_url.is_some());
        assert!(partial.recipe.steps[0].image_url.is_none());

        let task = queue.get_task(progress.task_id()).await.unwrap().unwrap();
        assert_eq!(task.progress, 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_stage_becomes_failure_outcome() {
        let queue = Arc::new(TaskQueue::in_memory());
        let progress = reporter(&queue).await;
        let images = Arc::new(FlakyImages::failing(0));
        let storage = Arc::new(RecordingStorage::default());
        let publisher = Arc::new(InMemoryProgressPublisher::new(Duration::from_secs(60)));
        // Empty body fails the fetch stage on every attempt.
        let handler = handler(images, b"", storage.clone(), publisher.clone());

        let outcome = handler.process(&image_task(1), &progress).await;

        assert!(!outcome.is_success());
        assert_eq!(outcome.step_index, 1);
        assert!(outcome.error.as_deref().unwrap().contains("empty image body"));
        assert!(storage.paths.lock().is_empty());

        let partial = publisher.get_partial("req-1").await.unwrap().unwrap();
        assert_eq!(partial.step_status[1], StepImageStatus::Failed);

        let task = queue.get_task(progress.task_id()).await.unwrap().unwrap();
        assert_eq!(task.progress, 100);
    }

    #[tokio::test]
    async fn test_no_publish_without_snapshot() {
        let queue = Arc::new(TaskQueue::in_memory());
        let progress = reporter(&queue).await;
        let publisher = Arc::new(InMemoryProgressPublisher::new(Duration::from_secs(60)));
        let handler = handler(
            Arc::new(FlakyImages::failing(0)),
            b"png",
            Arc::new(RecordingStorage::default()),
            publisher.clone(),
        );

        let mut task = image_task(0);
        task.recipe_snapshot = None;
        assert!(handler.process(&task, &progress).await.is_success());
        assert!(publisher.is_empty());
    }

    #[test]
    fn test_step_image_path() {
        assert_eq!(step_image_path("abc", 3), "recipes/abc/step-3.png");
    }
}
