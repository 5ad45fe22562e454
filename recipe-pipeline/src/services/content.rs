//! Recipe text generation.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::checked_response;
use crate::config::ServiceEndpoint;
use crate::{Error, Result};

const SERVICE: &str = "content-generation";

const SYSTEM_PROMPT: &str = "You are a recipe writer. Reply with ONE JSON object and nothing else, \
shaped as {\"title\": string, \"servings\": number, \"ingredients\": [string], \
\"steps\": [{\"text\": string, \"illustration\": string}], \"nutrition\": {\"calories\": string, \
\"protein\": string, \"carbs\": string, \"fat\": string}, \"prepTime\": string, \"cookTime\": string, \
\"category\": string, \"tags\": [string]}. \"illustration\" describes a photo of the finished step.";

/// Produces raw recipe content for a free-text query.
///
/// The returned text is parsed by the caller; implementations do not validate it.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, query: &str, preferences: Option<&Value>) -> Result<String>;
}

/// Client for an OpenAI-compatible chat completions endpoint.
pub struct OpenAiContentGenerator {
    client: reqwest::Client,
    endpoint: ServiceEndpoint,
}

impl OpenAiContentGenerator {
    pub fn new(client: reqwest::Client, endpoint: ServiceEndpoint) -> Self {
        Self { client, endpoint }
    }
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    response_format: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Debug, Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

fn user_prompt(query: &str, preferences: Option<&Value>) -> String {
    let mut prompt = format!("Write a recipe for: {}", query.trim());
    if let Some(prefs) = preferences.filter(|p| !p.is_null()) {
        prompt.push_str("\nRespect these preferences: ");
        prompt.push_str(&prefs.to_string());
    }
    prompt
}

#[async_trait]
impl ContentGenerator for OpenAiContentGenerator {
    async fn generate(&self, query: &str, preferences: Option<&Value>) -> Result<String> {
        let user = user_prompt(query, preferences);
        let body = ChatRequest {
            model: &self.endpoint.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.7,
            response_format: serde_json::json!({ "type": "json_object" }),
        };

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.endpoint.base_url))
            .timeout(self.endpoint.timeout())
            .json(&body);
        if let Some(key) = &self.endpoint.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| Error::config(format!("invalid content API key: {}", e)))?;
            request = request.header(AUTHORIZATION, value);
        }

        let response = checked_response(SERVICE, request.send().await?).await?;
        let parsed: ChatResponse = response.json().await?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| Error::external(SERVICE, "response contained no content"))?;

        debug!(query = %query, chars = content.len(), "Generated recipe content");
        Ok(content)
    }
}
