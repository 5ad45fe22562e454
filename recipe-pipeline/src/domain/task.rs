//! Task payloads exchanged over the queues and their outcomes.
//!
//! Field names are camelCase on the wire; anything that enqueues work for
//! this pipeline depends on these shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::recipe::Recipe;

/// Subscription tier of the requesting account.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SubscriptionTier {
    #[default]
    Free,
    Basic,
    Premium,
}

impl SubscriptionTier {
    /// Size and quality requested from the image service for this tier.
    pub fn image_profile(&self) -> ImageProfile {
        match self {
            Self::Free => ImageProfile {
                size: "512x512",
                quality: "standard",
            },
            Self::Basic => ImageProfile {
                size: "1024x1024",
                quality: "standard",
            },
            Self::Premium => ImageProfile {
                size: "1024x1024",
                quality: "hd",
            },
        }
    }
}

/// Quality/size profile passed to the image service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageProfile {
    pub size: &'static str,
    pub quality: &'static str,
}

/// Top-level generation request, the payload of a recipe-generation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTask {
    /// Recipe ID this generation will produce.
    pub id: String,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_preferences: Option<Value>,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub persist: bool,
    /// Set by an external cancellation request; read at checkpoints.
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default)]
    pub progressive_display: bool,
    #[serde(default)]
    pub subscription_tier: SubscriptionTier,
}

impl GenerationTask {
    pub fn new(query: impl Into<String>, request_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            query: query.into(),
            user_preferences: None,
            request_id: request_id.into(),
            user_id: None,
            persist: false,
            cancelled: false,
            progressive_display: false,
            subscription_tier: SubscriptionTier::default(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.persist = true;
        self
    }

    pub fn with_preferences(mut self, preferences: Value) -> Self {
        self.user_preferences = Some(preferences);
        self
    }

    pub fn with_progressive_display(mut self, enabled: bool) -> Self {
        self.progressive_display = enabled;
        self
    }

    pub fn with_tier(mut self, tier: SubscriptionTier) -> Self {
        self.subscription_tier = tier;
        self
    }
}

/// One per recipe step; payload of an image-generation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageTask {
    pub prompt: String,
    pub recipe_id: String,
    pub step_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe_snapshot: Option<Recipe>,
    #[serde(default)]
    pub subscription_tier: SubscriptionTier,
}

/// Result of one image sub-task. Exactly one of `image_url` and `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub step_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl TaskOutcome {
    pub fn success(step_index: usize, image_url: impl Into<String>) -> Self {
        Self {
            image_url: Some(image_url.into()),
            error: None,
            step_index,
            request_id: None,
        }
    }

    pub fn failure(step_index: usize, error: impl Into<String>) -> Self {
        Self {
            image_url: None,
            error: Some(error.into()),
            step_index,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn is_success(&self) -> bool {
        self.image_url.is_some()
    }
}

/// Terminal result of a recipe-generation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum GenerationOutcome {
    Completed { recipe: Box<Recipe> },
    Cancelled,
    Failed { message: String },
}

impl GenerationOutcome {
    pub fn completed(recipe: Recipe) -> Self {
        Self::Completed {
            recipe: Box::new(recipe),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed { .. } => "failed",
        }
    }

    pub fn recipe(&self) -> Option<&Recipe> {
        match self {
            Self::Completed { recipe } => Some(recipe),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_task_wire_format() {
        let task = GenerationTask::new("vegetarian lasagna", "req-1")
            .with_user("user-1")
            .with_tier(SubscriptionTier::Premium);
        let json = serde_json::to_value(&task).unwrap();

        assert_eq!(json["query"], "vegetarian lasagna");
        assert_eq!(json["requestId"], "req-1");
        assert_eq!(json["userId"], "user-1");
        assert_eq!(json["persist"], true);
        assert_eq!(json["cancelled"], false);
        assert_eq!(json["progressiveDisplay"], false);
        assert_eq!(json["subscriptionTier"], "premium");
    }

    #[test]
    fn test_generation_task_defaults_on_missing_fields() {
        let task: GenerationTask = serde_json::from_str(
            r#"{"id": "r-1", "query": "soup", "requestId": "req-2"}"#,
        )
        .unwrap();
        assert!(!task.cancelled);
        assert!(!task.persist);
        assert_eq!(task.subscription_tier, SubscriptionTier::Free);
    }

    #[test]
    fn test_image_task_wire_format() {
        let task = ImageTask {
            prompt: "a pot".to_string(),
            recipe_id: "r-1".to_string(),
            step_index: 2,
            request_id: None,
            recipe_snapshot: None,
            subscription_tier: SubscriptionTier::Basic,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["recipeId"], "r-1");
        assert_eq!(json["stepIndex"], 2);
        assert!(json.get("requestId").is_none());
    }

    #[test]
    fn test_task_outcome_exclusive_fields() {
        let ok = serde_json::to_value(TaskOutcome::success(1, "https://cdn/1.png")).unwrap();
        assert_eq!(ok["imageUrl"], "https://cdn/1.png");
        assert!(ok.get("error").is_none());

        let failed = serde_json::to_value(TaskOutcome::failure(1, "boom")).unwrap();
        assert_eq!(failed["error"], "boom");
        assert!(failed.get("imageUrl").is_none());
    }

    #[test]
    fn test_generation_outcome_tagging() {
        let json = serde_json::to_value(GenerationOutcome::failed("bad json")).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["message"], "bad json");

        let cancelled: GenerationOutcome =
            serde_json::from_str(r#"{"status": "cancelled"}"#).unwrap();
        assert_eq!(cancelled, GenerationOutcome::Cancelled);
    }

    #[test]
    fn test_tier_profiles() {
        assert_eq!(SubscriptionTier::Free.image_profile().size, "512x512");
        assert_eq!(SubscriptionTier::Premium.image_profile().quality, "hd");
        assert_eq!("basic".parse::<SubscriptionTier>().unwrap(), SubscriptionTier::Basic);
    }
}
