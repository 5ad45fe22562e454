//! Durable object storage for generated images.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::utils::fs;
use crate::{Error, Result};

/// Stores bytes under a relative path and returns their public URL.
///
/// Storing the same path twice replaces the object.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn store(&self, bytes: Bytes, path: &str, content_type: &str) -> Result<String>;
}

/// Storage on the local filesystem, served under `public_base_url`.
pub struct LocalObjectStorage {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, public_base_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        if !fs::is_contained_relative(relative) {
            return Err(Error::validation(format!(
                "storage path {:?} must be relative and must not escape the root",
                path
            )));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for LocalObjectStorage {
    async fn store(&self, bytes: Bytes, path: &str, content_type: &str) -> Result<String> {
        let target = self.resolve(path)?;
        fs::write_atomic(&target, &bytes).await?;
        debug!(
            path = %target.display(),
            size = bytes.len(),
            content_type,
            "Stored object"
        );
        Ok(format!("{}/{}", self.public_base_url, path))
    }
}
