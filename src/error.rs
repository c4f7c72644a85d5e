use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChatError {
    #[error("Missing credential: {0} is not set")]
    MissingCredential(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;

/// Failure kinds shared by the SQL generator and the result explainer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GenerationErrorKind {
    RateLimited,
    AuthFailed,
    Timeout,
    MalformedResponse,
    /// Provider outage or connection failure.
    Unavailable,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct GenerationError {
    pub kind: GenerationErrorKind,
    pub message: String,
}

impl GenerationError {
    pub fn new(kind: GenerationErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(GenerationErrorKind::MalformedResponse, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionErrorKind {
    Unauthorized,
    SyntaxError,
    Timeout,
    /// The service answered without any result set.
    Empty,
    ServiceUnavailable,
}

/// Where an execution failure was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorOrigin {
    /// Rejected by the local read-only check; nothing was sent.
    Local,
    Remote,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?} ({origin:?}): {message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    pub origin: ErrorOrigin,
    pub message: String,
}

impl ExecutionError {
    pub fn local(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            origin: ErrorOrigin::Local,
            message: message.into(),
        }
    }

    pub fn remote(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            origin: ErrorOrigin::Remote,
            message: message.into(),
        }
    }
}
