//! Object storage client
//!
//! Downloads uploaded source files from a Supabase-compatible storage REST API.

use crate::config::StorageConfig;
use crate::errors::{AppError, Result};
use backoff::{future::retry, ExponentialBackoff};
use std::time::Duration;
use tracing::debug;

/// Storage REST client
#[derive(Clone)]
pub struct ObjectStorage {
    client: reqwest::Client,
    base_url: Option<String>,
    key: Option<String>,
    bucket: String,
}

impl ObjectStorage {
    /// Create a client; credentials are checked on first use
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            base_url: config.url.clone().map(|u| u.trim_end_matches('/').to_string()),
            key: config.key.clone(),
            bucket: config.bucket.clone(),
        })
    }

    /// Default bucket
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Object URL for `bucket/path`
    pub fn object_url(&self, bucket: &str, path: &str) -> Result<String> {
        let base = self.base_url.as_deref().ok_or_else(|| AppError::Configuration {
            message: "storage.url is not set".to_string(),
        })?;
        Ok(format!(
            "{}/storage/v1/object/{}/{}",
            base,
            bucket,
            path.trim_start_matches('/')
        ))
    }

    /// Download an object into memory
    pub async fn download(&self, bucket: &str, path: &str) -> Result<Vec<u8>> {
        let url = self.object_url(bucket, path)?;
        let key = self.key.as_deref().ok_or_else(|| AppError::Configuration {
            message: "storage.key is not set".to_string(),
        })?;

        debug!(bucket, path, "Downloading object");

        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        };

        let bytes = retry(policy, || {
            let request = self.client.get(&url).bearer_auth(key);
            async move {
                let response = request.send().await.map_err(|e| {
                    backoff::Error::transient(AppError::StorageError {
                        message: format!("Download of {} failed: {}", path, e),
                    })
                })?;

                let status = response.status();
                if status.is_server_error() {
                    return Err(backoff::Error::transient(AppError::StorageError {
                        message: format!("Storage returned {} for {}", status, path),
                    }));
                }
                if status == reqwest::StatusCode::NOT_FOUND {
                    return Err(backoff::Error::permanent(AppError::not_found("storage_object", path)));
                }
                if !status.is_success() {
                    return Err(backoff::Error::permanent(AppError::StorageError {
                        message: format!("Storage returned {} for {}", status, path),
                    }));
                }

                response.bytes().await.map_err(|e| {
                    backoff::Error::transient(AppError::StorageError {
                        message: format!("Reading {} failed: {}", path, e),
                    })
                })
            }
        })
        .await?;

        Ok(bytes.to_vec())
    }
}
