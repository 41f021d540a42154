//! Completion API abstraction.
//!
//! The pipeline talks to the hosted language model through
//! [`CompletionClient`]: it sends an assembled prompt with max-token and
//! temperature settings and gets back answer text or a typed failure
//! (timeout, rate-limited, unavailable). The provider's wire protocol stays
//! behind [`HttpCompletionClient`], which speaks the OpenAI-compatible
//! chat-completions shape.
//!
//! Retry policy lives with the caller (the pipeline retries once with
//! backoff); the client performs exactly one attempt per call.

use std::time::Duration;

use async_trait::async_trait;

use crate::config::CompletionConfig;
use crate::error::CompletionError;

/// Client for the external completion API.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Model identifier, for logs and diagnostics.
    fn model_name(&self) -> &str;

    /// One completion attempt. Transport timeouts surface as
    /// [`CompletionError::Timeout`].
    async fn complete(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, CompletionError>;
}

/// HTTP client for OpenAI-compatible `POST /v1/chat/completions` endpoints.
pub struct HttpCompletionClient {
    model: String,
    endpoint: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpCompletionClient {
    pub fn new(config: &CompletionConfig) -> Result<Self, CompletionError> {
        let api_key = std::env::var(&config.api_key_env).map_err(|_| {
            CompletionError::Unavailable {
                status: 0,
                message: format!("API key not set ({})", config.api_key_env),
            }
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| CompletionError::Unavailable {
                status: 0,
                message: e.to_string(),
            })?;

        Ok(Self {
            model: config.model.clone(),
            endpoint: config.endpoint.clone(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String, CompletionError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "user", "content": prompt }
            ],
            "max_tokens": max_tokens,
            "temperature": temperature,
        });

        let resp = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout
                } else {
                    CompletionError::Unavailable {
                        status: 0,
                        message: e.to_string(),
                    }
                }
            })?;

        let status = resp.status();
        if status.as_u16() == 429 {
            return Err(CompletionError::RateLimited);
        }
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(CompletionError::Unavailable {
                status: status.as_u16(),
                message,
            });
        }

        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| CompletionError::InvalidResponse(e.to_string()))?;

        parse_completion_response(&json)
    }
}

/// Pull the answer text out of a chat-completions response.
fn parse_completion_response(json: &serde_json::Value) -> Result<String, CompletionError> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            CompletionError::InvalidResponse("missing choices[0].message.content".to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion_response() {
        let json = serde_json::json!({
            "choices": [
                { "message": { "role": "assistant", "content": "  The mitochondria. " } }
            ]
        });
        assert_eq!(
            parse_completion_response(&json).unwrap(),
            "The mitochondria."
        );
    }

    #[test]
    fn test_parse_rejects_empty_or_missing() {
        assert!(parse_completion_response(&serde_json::json!({})).is_err());
        let blank = serde_json::json!({
            "choices": [ { "message": { "content": "   " } } ]
        });
        assert!(parse_completion_response(&blank).is_err());
    }
}
