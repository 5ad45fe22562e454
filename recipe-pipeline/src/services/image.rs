//! Step image synthesis.

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use serde::{Deserialize, Serialize};

use super::checked_response;
use crate::config::ServiceEndpoint;
use crate::domain::ImageProfile;
use crate::{Error, Result};

const SERVICE: &str = "image-generation";

/// Turns a prompt into the URL of a freshly generated image.
///
/// The URL is usually short-lived; callers copy the bytes into durable storage.
#[async_trait]
pub trait ImageGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, profile: ImageProfile) -> Result<String>;
}

/// Client for an OpenAI-compatible `/images/generations` endpoint.
pub struct OpenAiImageGenerator {
    client: reqwest::Client,
    endpoint: ServiceEndpoint,
}

impl OpenAiImageGenerator {
    pub fn new(client: reqwest::Client, endpoint: ServiceEndpoint) -> Self {
        Self { client, endpoint }
    }
}

#[derive(Debug, Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u8,
    size: &'a str,
    quality: &'a str,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    #[serde(default)]
    data: Vec<ImageData>,
}

#[derive(Debug, Deserialize)]
struct ImageData {
    #[serde(default)]
    url: Option<String>,
}

impl ImageResponse {
    fn first_url(self) -> Option<String> {
        self.data
            .into_iter()
            .next()
            .and_then(|d| d.url)
            .filter(|u| !u.trim().is_empty())
    }
}

#[async_trait]
impl ImageGenerator for OpenAiImageGenerator {
    async fn generate(&self, prompt: &str, profile: ImageProfile) -> Result<String> {
        let body = ImageRequest {
            model: &self.endpoint.model,
            prompt,
            n: 1,
            size: profile.size,
            quality: profile.quality,
        };

        let mut request = self
            .client
            .post(format!("{}/images/generations", self.endpoint.base_url))
            .timeout(self.endpoint.timeout())
            .json(&body);
        if let Some(key) = &self.endpoint.api_key {
            let value = HeaderValue::from_str(&format!("Bearer {}", key))
                .map_err(|e| Error::config(format!("invalid image API key: {}", e)))?;
            request = request.header(AUTHORIZATION, value);
        }

        let response = checked_response(SERVICE, request.send().await?).await?;
        let parsed: ImageResponse = response.json().await?;
        parsed
            .first_url()
            .ok_or_else(|| Error::external(SERVICE, "no image URL in response"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_url_rejects_empty_results() {
        let empty: ImageResponse = serde_json::from_str(r#"{"data": []}"#).unwrap();
        assert_eq!(empty.first_url(), None);

        let blank: ImageResponse = serde_json::from_str(r#"{"data": [{"url": " "}]}"#).unwrap();
        assert_eq!(blank.first_url(), None);

        let ok: ImageResponse =
            serde_json::from_str(r#"{"created": 1, "data": [{"url": "https://img/1.png"}]}"#)
                .unwrap();
        assert_eq!(ok.first_url().as_deref(), Some("https://img/1.png"));
    }
}
