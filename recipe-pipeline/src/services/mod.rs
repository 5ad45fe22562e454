//! External collaborators of the pipeline and the container wiring them up.
//!
//! Each collaborator is a trait injected as `Arc<dyn _>`, with an HTTP or
//! filesystem implementation for production and an in-memory one where
//! that makes sense.

pub mod container;
mod content;
mod fetch;
mod image;
mod publisher;
mod recipe_store;
mod storage;

pub use container::ServiceContainer;
pub use content::{ContentGenerator, OpenAiContentGenerator};
pub use fetch::{ByteFetcher, FetchedBytes, HttpByteFetcher};
pub use image::{ImageGenerator, OpenAiImageGenerator};
pub use publisher::{
    InMemoryProgressPublisher, PartialRecipe, ProgressPublisher, StepImageStatus, StepImageUpdate,
};
pub use recipe_store::{InMemoryRecipeStore, RecipeStore};
pub use storage::{LocalObjectStorage, ObjectStorage};

use crate::{Error, Result};

/// Longest error body quoted in an error message.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Pass through successful responses; turn anything else into
/// [`Error::ExternalService`] quoting the start of the body.
pub(crate) async fn checked_response(
    service: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let body: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    let message = if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        format!("rate limited ({}): {}", status, body.trim())
    } else {
        format!("HTTP {}: {}", status, body.trim())
    };
    Err(Error::external(service, message))
}
