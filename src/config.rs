//! Process configuration
//!
//! Loaded once at startup from `.env` and the environment. The two secrets are
//! required; everything else has a default.

use crate::error::{ChatError, Result};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const LAKEHOUSE_TOKEN_VAR: &str = "KB_AUTH_TOKEN";
pub const LLM_API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

pub const DEFAULT_LAKEHOUSE_URL: &str = "https://hub.berdl.kbase.us/apis/mcp/delta/tables/query";
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.anthropic.com/v1";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Lakehouse bearer token and language-model API key.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    lakehouse_token: String,
    llm_api_key: String,
}

impl Credentials {
    pub fn new(lakehouse_token: impl Into<String>, llm_api_key: impl Into<String>) -> Self {
        Self {
            lakehouse_token: lakehouse_token.into(),
            llm_api_key: llm_api_key.into(),
        }
    }

    pub fn lakehouse_token(&self) -> &str {
        &self.lakehouse_token
    }

    pub fn llm_api_key(&self) -> &str {
        &self.llm_api_key
    }

    /// Same LLM key, new lakehouse token.
    pub fn with_lakehouse_token(&self, token: impl Into<String>) -> Self {
        Self {
            lakehouse_token: token.into(),
            llm_api_key: self.llm_api_key.clone(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("lakehouse_token", &"<redacted>")
            .field("llm_api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub credentials: Credentials,
    pub lakehouse_url: String,
    pub llm_base_url: String,
    pub model: String,
    pub generate_max_tokens: u32,
    pub explain_max_tokens: u32,
    /// Per network call.
    pub request_timeout: Duration,
    /// Upper bound on one pipeline stage, enforced by the orchestrator.
    pub stage_timeout: Duration,
    pub row_limit: u32,
    pub explain_row_cap: usize,
    pub explain_char_budget: usize,
    pub history_turns: usize,
    pub port: u16,
    /// Server sessions untouched for this long are closed.
    pub session_idle_timeout: Duration,
}

impl Config {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load a specific env file, then read the process environment.
    pub fn from_env_file(path: &Path) -> Result<Self> {
        dotenv::from_path(path)
            .map_err(|e| ChatError::Config(format!("Failed to load {}: {}", path.display(), e)))?;
        info!("Loaded environment from {}", path.display());
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lakehouse_token = required(&lookup, LAKEHOUSE_TOKEN_VAR)?;
        let llm_api_key = required(&lookup, LLM_API_KEY_VAR)?;

        Ok(Self {
            credentials: Credentials::new(lakehouse_token, llm_api_key),
            lakehouse_url: lookup("BERDL_API_URL").unwrap_or_else(|| DEFAULT_LAKEHOUSE_URL.to_string()),
            llm_base_url: lookup("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            model: lookup("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            generate_max_tokens: 500,
            explain_max_tokens: 300,
            request_timeout: Duration::from_secs(parsed(&lookup, "REQUEST_TIMEOUT_SECS", 30)?),
            stage_timeout: Duration::from_secs(parsed(&lookup, "STAGE_TIMEOUT_SECS", 45)?),
            row_limit: parsed(&lookup, "QUERY_ROW_LIMIT", 100)?,
            explain_row_cap: parsed(&lookup, "EXPLAIN_ROW_CAP", 10)?,
            explain_char_budget: parsed(&lookup, "EXPLAIN_CHAR_BUDGET", 4000)?,
            history_turns: parsed(&lookup, "HISTORY_TURNS", 3)?,
            port: parsed(&lookup, "BERDL_CHAT_PORT", 8081)?,
            session_idle_timeout: Duration::from_secs(parsed(&lookup, "SESSION_IDLE_SECS", 1800)?),
        })
    }

    /// Defaults around the given credentials, for tests and embedding.
    pub fn with_credentials(credentials: Credentials) -> Self {
        Self {
            credentials,
            lakehouse_url: DEFAULT_LAKEHOUSE_URL.to_string(),
            llm_base_url: DEFAULT_LLM_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            generate_max_tokens: 500,
            explain_max_tokens: 300,
            request_timeout: Duration::from_secs(30),
            stage_timeout: Duration::from_secs(45),
            row_limit: 100,
            explain_row_cap: 10,
            explain_char_budget: 4000,
            history_turns: 3,
            port: 8081,
            session_idle_timeout: Duration::from_secs(1800),
        }
    }
}

fn required<F>(lookup: &F, key: &str) -> Result<String>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
        _ => Err(ChatError::MissingCredential(key.to_string())),
    }
}

fn parsed<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ChatError::Config(format!("{} has invalid value '{}': {}", key, raw, e))),
    }
}
