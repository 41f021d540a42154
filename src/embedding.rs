//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]** — returns errors; used when embeddings are not configured.
//! - **[`HttpEmbeddingProvider`]** — calls an OpenAI-compatible embeddings
//!   API with batching, retry, and backoff.
//!
//! Every stored vector is tagged with the provider's
//! [`model_version`](EmbeddingProvider::model_version); the index refuses to
//! mix versions. Embeddings are deterministic per (text, model version) up
//! to backend floating-point noise; anything beyond 1e-6 per component is a
//! backend defect, not an input of this crate.
//!
//! Also provides vector utilities:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian f32 BLOB codec for
//!   SQLite storage
//!
//! # Retry Strategy
//!
//! The HTTP provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use std::time::Duration;

use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::EmbeddingError;

/// Trait for embedding providers.
///
/// Maps text to fixed-dimension vectors. Implementations must be cheap to
/// share behind an `Arc` and safe to call from many tasks at once.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Model identifier, e.g. `"text-embedding-3-small"`. Callers tag every
    /// stored vector with this string.
    fn model_version(&self) -> &str;

    /// Embedding vector dimensionality, e.g. `1536`.
    fn dims(&self) -> usize;

    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Embed a single query text.
pub async fn embed_query(
    provider: &dyn EmbeddingProvider,
    text: &str,
) -> Result<Vec<f32>, EmbeddingError> {
    let results = provider.embed(&[text.to_string()]).await?;
    results.into_iter().next().ok_or(EmbeddingError::Backend {
        message: "empty embedding response".to_string(),
    })
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
///
/// Used when `embedding.provider = "disabled"` in the configuration.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_version(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Backend {
            message: "embedding provider is disabled".to_string(),
        })
    }
}

// ============ HTTP Provider ============

/// Embedding provider for OpenAI-compatible `POST /v1/embeddings` endpoints.
pub struct HttpEmbeddingProvider {
    model: String,
    dims: usize,
    endpoint: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl HttpEmbeddingProvider {
    /// Create a provider from configuration.
    ///
    /// Fails if `model` or `dims` is unset or the API key environment
    /// variable is missing.
    pub fn new(config: &EmbeddingConfig) -> Result<Self, EmbeddingError> {
        let model = config.model.clone().ok_or(EmbeddingError::Backend {
            message: "embedding.model is required".to_string(),
        })?;
        let dims = config.dims.ok_or(EmbeddingError::Backend {
            message: "embedding.dims is required".to_string(),
        })?;
        let api_key =
            std::env::var(&config.api_key_env).map_err(|_| EmbeddingError::MissingApiKey {
                env_var: config.api_key_env.clone(),
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EmbeddingError::Backend {
                message: e.to_string(),
            })?;

        Ok(Self {
            model,
            dims,
            endpoint: config.endpoint.clone(),
            api_key,
            max_retries: config.max_retries,
            client,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    fn model_version(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() || texts.iter().any(|t| t.trim().is_empty()) {
            return Err(EmbeddingError::EmptyInput);
        }

        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&self.endpoint)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value =
                            response.json().await.map_err(|e| EmbeddingError::Backend {
                                message: e.to_string(),
                            })?;
                        let vectors = parse_embedding_response(&json)?;
                        for v in &vectors {
                            if v.len() != self.dims {
                                return Err(EmbeddingError::DimensionMismatch {
                                    expected: self.dims,
                                    actual: v.len(),
                                });
                            }
                        }
                        return Ok(vectors);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(EmbeddingError::Backend {
                            message: format!("API error {}: {}", status, body_text),
                        });
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(EmbeddingError::Backend {
                        message: format!("API error {}: {}", status, body_text),
                    });
                }
                Err(e) => {
                    last_err = Some(EmbeddingError::Backend {
                        message: e.to_string(),
                    });
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or(EmbeddingError::Backend {
            message: "embedding failed after retries".to_string(),
        }))
    }
}

/// Parse the `data[].embedding` arrays out of an embeddings API response.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or(EmbeddingError::Backend {
            message: "invalid response: missing data array".to_string(),
        })?;

    let mut embeddings = Vec::with_capacity(data.len());

    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or(EmbeddingError::Backend {
                message: "invalid response: missing embedding".to_string(),
            })?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        embeddings.push(vec);
    }

    Ok(embeddings)
}

/// Create the configured [`EmbeddingProvider`].
pub fn create_provider(
    config: &EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>, EmbeddingError> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(HttpEmbeddingProvider::new(config)?)),
        other => Err(EmbeddingError::Backend {
            message: format!("unknown embedding provider: {}", other),
        }),
    }
}

// ============ Vector utilities ============

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector. Trailing partial values are
/// discarded.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity between two vectors, in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, mismatched lengths, or zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    let denom = mag_a * mag_b;
    if denom < f32::EPSILON {
        return 0.0;
    }
    dot / denom
}
