//! Embedding service abstraction
//!
//! Provides a unified interface over embedding providers:
//! - OpenAI-compatible `/embeddings` endpoints
//! - A deterministic mock for tests and offline runs

use crate::config::EmbeddingConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Text embedding provider
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts; output order follows input order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn model_name(&self) -> &str;

    fn dimension(&self) -> usize;
}

/// Largest number of inputs sent in one request
const MAX_INPUTS_PER_REQUEST: usize = 100;

/// Client for OpenAI-compatible `/embeddings` endpoints
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    dimension: usize,
    max_retries: u32,
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Deserialize)]
struct EmbeddingItem {
    index: usize,
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let base = config
            .api_base
            .as_deref()
            .unwrap_or("https://api.openai.com/v1")
            .trim_end_matches('/');

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base),
            api_key,
            model: config.model.clone(),
            dimension: config.dimension,
            max_retries: config.max_retries,
        })
    }

    /// One request, retried on network errors, 429 and 5xx
    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let attempts = AtomicU32::new(0);
        let started = Instant::now();

        let result = retry(policy, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            let request = self
                .client
                .post(&self.endpoint)
                .bearer_auth(&self.api_key)
                .json(&EmbeddingRequest {
                    model: &self.model,
                    input: texts,
                });
            let give_up = attempt >= self.max_retries;

            async move {
                let transient = |e: AppError| {
                    if give_up {
                        backoff::Error::permanent(e)
                    } else {
                        tracing::warn!(attempt = attempt + 1, error = %e, "Embedding request failed, retrying");
                        backoff::Error::transient(e)
                    }
                };

                let response = request.send().await.map_err(|e| {
                    transient(AppError::EmbeddingError {
                        message: format!("Request failed: {}", e),
                    })
                })?;

                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    let err = AppError::EmbeddingError {
                        message: format!("API error {}: {}", status, body),
                    };
                    return if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        Err(transient(err))
                    } else {
                        Err(backoff::Error::permanent(err))
                    };
                }

                response.json::<EmbeddingResponse>().await.map_err(|e| {
                    backoff::Error::permanent(AppError::EmbeddingError {
                        message: format!("Failed to parse response: {}", e),
                    })
                })
            }
        })
        .await;

        metrics::record_embedding(
            started.elapsed().as_secs_f64(),
            &self.model,
            texts.len(),
            result.is_ok(),
        );

        let mut data = result?.data;
        if data.len() != texts.len() {
            return Err(AppError::EmbeddingError {
                message: format!("Expected {} embeddings, got {}", texts.len(), data.len()),
            });
        }
        data.sort_by_key(|item| item.index);

        data.into_iter()
            .map(|item| {
                if item.embedding.len() == self.dimension {
                    Ok(item.embedding)
                } else {
                    Err(AppError::EmbeddingError {
                        message: format!(
                            "Model returned {} dimensions, configured for {}",
                            item.embedding.len(),
                            self.dimension
                        ),
                    })
                }
            })
            .collect()
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.request(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| AppError::EmbeddingError {
                message: "Empty response".to_string(),
            })
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for group in texts.chunks(MAX_INPUTS_PER_REQUEST) {
            vectors.extend(self.request(group).await?);
        }
        Ok(vectors)
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Mock embedder for testing.
///
/// Vectors are seeded from the text hash, so equal texts always embed equally.
pub struct MockEmbedder {
    dimension: usize,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `embed`/`embed_batch` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let digest = Sha256::digest(text.as_bytes());
        let mut seed = [0u8; 8];
        seed.copy_from_slice(&digest[..8]);
        let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed));
        (0..self.dimension).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn model_name(&self) -> &str {
        "mock-embedding"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Embedder for `embedding.provider`
pub fn create_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "openai" => {
            let key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
                message: "embedding.api_key is required for the openai provider".to_string(),
            })?;
            Ok(Arc::new(OpenAiEmbedder::new(key, config)?))
        }
        "mock" => Ok(Arc::new(MockEmbedder::new(config.dimension))),
        other => Err(AppError::Configuration {
            message: format!("Unknown embedding provider: {}", other),
        }),
    }
}

/// Cosine similarity of two vectors; zero when either has no magnitude or
/// the lengths differ
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
