//! Lakehouse transport
//!
//! The BERDL query endpoint takes `POST {"query": ..., "limit": ...}` with a
//! bearer token and answers with row objects plus pagination, or with an
//! error body. Service-specific shapes stay in this file; the executor maps
//! them to `ExecutionError`.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Maximum response body kept in an error message.
const ERROR_BODY_LIMIT: usize = 300;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pagination {
    #[serde(default)]
    pub total_count: Option<u64>,
}

/// Successful (HTTP 2xx) response body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LakehousePayload {
    #[serde(default)]
    pub result: Option<Vec<Map<String, Value>>>,
    #[serde(default)]
    pub pagination: Option<Pagination>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl LakehousePayload {
    pub fn rows(rows: Vec<Map<String, Value>>) -> Self {
        let total = rows.len() as u64;
        Self {
            result: Some(rows),
            pagination: Some(Pagination {
                total_count: Some(total),
            }),
            ..Self::default()
        }
    }

    /// Error reported inside a 2xx body, if any.
    pub fn error_message(&self) -> Option<String> {
        let flagged = match &self.error {
            Some(Value::Null) | Some(Value::Bool(false)) | None => self.error_type.is_some(),
            Some(_) => true,
        };
        if !flagged {
            return None;
        }
        let detail = self
            .message
            .clone()
            .or_else(|| match &self.error {
                Some(Value::String(s)) => Some(s.clone()),
                _ => None,
            })
            .unwrap_or_else(|| "Unknown API error".to_string());
        Some(match &self.error_type {
            Some(t) => format!("{}: {}", t, detail),
            None => detail,
        })
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("lakehouse returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("lakehouse request timed out")]
    Timeout,

    #[error("could not reach lakehouse: {0}")]
    Connect(String),

    #[error("unreadable lakehouse response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait Lakehouse: Send + Sync {
    async fn run_query(
        &self,
        sql: &str,
        token: &str,
        limit: u32,
    ) -> Result<LakehousePayload, TransportError>;
}

pub struct HttpLakehouse {
    client: Client,
    endpoint: String,
}

impl HttpLakehouse {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| TransportError::Connect(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl Lakehouse for HttpLakehouse {
    async fn run_query(
        &self,
        sql: &str,
        token: &str,
        limit: u32,
    ) -> Result<LakehousePayload, TransportError> {
        debug!(endpoint = %self.endpoint, limit, "Submitting lakehouse query");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(token)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "query": sql, "limit": limit }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Connect(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > ERROR_BODY_LIMIT {
                let mut cut = ERROR_BODY_LIMIT;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            warn!(status = status.as_u16(), "Lakehouse query failed");
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response.json::<LakehousePayload>().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Decode(e.to_string())
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_from_body() {
        let payload: LakehousePayload = serde_json::from_str(
            r#"{"error": true, "error_type": "AnalysisException", "message": "Table or view not found"}"#,
        )
        .unwrap();
        assert_eq!(
            payload.error_message().as_deref(),
            Some("AnalysisException: Table or view not found")
        );
    }

    #[test]
    fn test_success_body_has_no_error() {
        let payload: LakehousePayload =
            serde_json::from_str(r#"{"result": [{"test": 1}], "pagination": {"total_count": 1}}"#).unwrap();
        assert!(payload.error_message().is_none());
        assert_eq!(payload.result.unwrap().len(), 1);
    }

    #[test]
    fn test_null_error_field_is_not_an_error() {
        let payload: LakehousePayload = serde_json::from_str(r#"{"error": null, "result": []}"#).unwrap();
        assert!(payload.error_message().is_none());
    }
}
