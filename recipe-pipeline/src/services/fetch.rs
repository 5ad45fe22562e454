//! Downloading generated images.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use super::checked_response;
use crate::{Error, Result};

const SERVICE: &str = "image-fetch";

/// Fetched image bytes plus the content type the server reported.
#[derive(Debug, Clone)]
pub struct FetchedBytes {
    pub bytes: Bytes,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait ByteFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedBytes>;
}

pub struct HttpByteFetcher {
    client: reqwest::Client,
}

impl HttpByteFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ByteFetcher for HttpByteFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchedBytes> {
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("fetching {} after {:?}", url, timeout))
                } else {
                    Error::Http(e)
                }
            })?;
        let response = checked_response(SERVICE, response).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(Error::external(SERVICE, format!("empty body from {}", url)));
        }

        Ok(FetchedBytes {
            bytes,
            content_type,
        })
    }
}
