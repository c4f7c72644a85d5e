//! Language-model provider
//!
//! `LanguageModel` is the seam the generator and explainer call through;
//! `AnthropicClient` is the production implementation over the Messages API.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{GenerationError, GenerationErrorKind};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    pub prompt: String,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Auth,
    RateLimit,
    Timeout,
    Unavailable,
    Malformed,
}

#[derive(Error, Debug, Clone)]
#[error("LLM provider error ({kind:?}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<ProviderError> for GenerationError {
    fn from(err: ProviderError) -> Self {
        let kind = match err.kind {
            ProviderErrorKind::Auth => GenerationErrorKind::AuthFailed,
            ProviderErrorKind::RateLimit => GenerationErrorKind::RateLimited,
            ProviderErrorKind::Timeout => GenerationErrorKind::Timeout,
            ProviderErrorKind::Unavailable => GenerationErrorKind::Unavailable,
            ProviderErrorKind::Malformed => GenerationErrorKind::MalformedResponse,
        };
        GenerationError::new(kind, err.message)
    }
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Generate text for one prompt using the caller's API key.
    async fn complete(
        &self,
        request: &CompletionRequest,
        api_key: &str,
    ) -> Result<String, ProviderError>;
}

/// Map an HTTP status from the provider to an error kind.
pub fn classify_status(status: StatusCode) -> ProviderErrorKind {
    match status.as_u16() {
        401 | 403 => ProviderErrorKind::Auth,
        // 529 is the provider's "overloaded" status.
        429 | 529 => ProviderErrorKind::RateLimit,
        408 | 504 => ProviderErrorKind::Timeout,
        s if s >= 500 => ProviderErrorKind::Unavailable,
        _ => ProviderErrorKind::Malformed,
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[derive(Clone)]
pub struct AnthropicClient {
    client: Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::new(ProviderErrorKind::Unavailable, format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl LanguageModel for AnthropicClient {
    async fn complete(
        &self,
        request: &CompletionRequest,
        api_key: &str,
    ) -> Result<String, ProviderError> {
        let mut body = serde_json::json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": [
                {"role": "user", "content": request.prompt}
            ],
        });
        if let Some(system) = &request.system {
            body["system"] = serde_json::Value::String(system.clone());
        }

        debug!(model = %request.model, prompt_chars = request.prompt.len(), "Calling LLM");

        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::new(ProviderErrorKind::Timeout, "LLM request timed out")
                } else {
                    ProviderError::new(ProviderErrorKind::Unavailable, format!("LLM API call failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|env| format!("{}: {}", env.error.error_type, env.error.message))
                .unwrap_or(text);
            warn!(status = status.as_u16(), "LLM API returned error");
            return Err(ProviderError::new(
                classify_status(status),
                format!("LLM API returned {}: {}", status, message),
            ));
        }

        let parsed: MessagesResponse = response.json().await.map_err(|e| {
            ProviderError::new(ProviderErrorKind::Malformed, format!("Failed to parse LLM response: {}", e))
        })?;

        parsed
            .content
            .into_iter()
            .find(|block| block.block_type == "text")
            .and_then(|block| block.text)
            .map(|text| text.trim().to_string())
            .ok_or_else(|| ProviderError::new(ProviderErrorKind::Malformed, "No text content in LLM response"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::UNAUTHORIZED), ProviderErrorKind::Auth);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), ProviderErrorKind::Auth);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), ProviderErrorKind::RateLimit);
        assert_eq!(classify_status(StatusCode::from_u16(529).unwrap()), ProviderErrorKind::RateLimit);
        assert_eq!(classify_status(StatusCode::GATEWAY_TIMEOUT), ProviderErrorKind::Timeout);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), ProviderErrorKind::Unavailable);
        assert_eq!(classify_status(StatusCode::BAD_REQUEST), ProviderErrorKind::Malformed);
    }

    #[test]
    fn test_provider_error_maps_to_generation_kind() {
        let err: GenerationError = ProviderError::new(ProviderErrorKind::RateLimit, "slow down").into();
        assert_eq!(err.kind, GenerationErrorKind::RateLimited);
        assert_eq!(err.message, "slow down");
    }

    #[test]
    fn test_response_parsing_picks_text_block() {
        let raw = r#"{"content":[{"type":"text","text":"SELECT 1"}],"stop_reason":"end_turn"}"#;
        let parsed: MessagesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.content[0].text.as_deref(), Some("SELECT 1"));
    }
}
