//! Error taxonomy for ingestion and serving.
//!
//! Each variant family maps to a distinct recovery policy:
//!
//! | Error | Policy |
//! |-------|--------|
//! | [`IngestionError`] | document marked `failed`, not retried automatically |
//! | [`EmbeddingError`] | retried with bounded backoff inside the provider, then ingestion/query fails |
//! | [`IndexInconsistencyError`] | triggers an index rebuild; not surfaced unless the rebuild fails |
//! | [`CompletionError`] | one retry, then a user-visible degraded answer |
//! | [`CacheUnavailableError`] | treated as a forced cache miss, never a query failure |
//!
//! Anything else propagates as a generic serving failure: logged in full,
//! shown to the end user as a single friendly message.

use thiserror::Error;

/// Bad or empty input at the ingestion boundary.
#[derive(Debug, Error)]
pub enum IngestionError {
    /// Extraction produced no usable text.
    #[error("document text is empty after extraction")]
    EmptyDocument,
}

/// Embedding backend or input failure.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("embedding input is empty")]
    EmptyInput,

    #[error("embedding API key not set ({env_var})")]
    MissingApiKey { env_var: String },

    /// Backend failure that survived the retry budget.
    #[error("embedding backend error: {message}")]
    Backend { message: String },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Detected skew or corruption in the vector index.
#[derive(Debug, Error)]
pub enum IndexInconsistencyError {
    /// Vectors from a different embedding-model version than the active
    /// index generation. Mixed-version indices are invalid.
    #[error("embedding model version skew: index has {index_version:?}, incoming is {incoming_version:?}")]
    VersionSkew {
        index_version: String,
        incoming_version: String,
    },

    #[error("chunk {chunk_id} referenced by the index is missing from the store")]
    MissingChunk { chunk_id: String },
}

/// Typed failure from the hosted completion API.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("completion request timed out")]
    Timeout,

    #[error("completion request was cancelled")]
    Cancelled,

    #[error("completion API rate limited")]
    RateLimited,

    #[error("completion API unavailable (status {status}): {message}")]
    Unavailable { status: u16, message: String },

    #[error("malformed completion response: {0}")]
    InvalidResponse(String),
}

impl CompletionError {
    /// Whether a single retry with backoff is worth attempting.
    pub fn is_retryable(&self) -> bool {
        match self {
            CompletionError::Timeout | CompletionError::RateLimited => true,
            CompletionError::Unavailable { status, .. } => *status >= 500,
            CompletionError::Cancelled | CompletionError::InvalidResponse(_) => false,
        }
    }
}

/// The durable cache tier could not be reached.
///
/// Degrades performance, never correctness: callers treat this as a miss.
#[derive(Debug, Error)]
#[error("durable cache tier unavailable: {0}")]
pub struct CacheUnavailableError(pub String);
