//! Session and Turn model
//!
//! A `Session` is owned by the orchestrator: the UI (or any other observer)
//! reads it through `snapshot()`, only the orchestrator mutates it. Turns are
//! immutable once built and always satisfy `error.is_some() != explanation.is_some()`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::config::Credentials;
use crate::error::{ErrorOrigin, ExecutionErrorKind, GenerationErrorKind};
use crate::execution::QueryResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Where a session's current pipeline run is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    Generating,
    Executing,
    Explaining,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "kind", rename_all = "snake_case")]
pub enum TurnErrorKind {
    Generation(GenerationErrorKind),
    Execution(ExecutionErrorKind),
    /// Failure while explaining results that were fetched fine.
    Explanation(GenerationErrorKind),
    /// Superseded by a newer question or a disconnect.
    Cancelled,
    EmptyQuestion,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnError {
    pub kind: TurnErrorKind,
    /// Set for execution failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<ErrorOrigin>,
    /// Shown to the user.
    pub message: String,
    /// Component-level detail, for logs and the collapsible debug view.
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    id: Uuid,
    question: String,
    sql: Option<String>,
    result: Option<QueryResult>,
    explanation: Option<String>,
    error: Option<TurnError>,
    created_at: DateTime<Utc>,
    elapsed_ms: u64,
}

impl Turn {
    pub fn answered(
        question: &str,
        sql: String,
        result: QueryResult,
        explanation: String,
        started: Instant,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            question: question.to_string(),
            sql: Some(sql),
            result: Some(result),
            explanation: Some(explanation),
            error: None,
            created_at: Utc::now(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn failed(
        question: &str,
        sql: Option<String>,
        result: Option<QueryResult>,
        error: TurnError,
        started: Instant,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            question: question.to_string(),
            sql,
            result,
            explanation: None,
            error: Some(error),
            created_at: Utc::now(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn question(&self) -> &str {
        &self.question
    }

    pub fn sql(&self) -> Option<&str> {
        self.sql.as_deref()
    }

    pub fn result(&self) -> Option<&QueryResult> {
        self.result.as_ref()
    }

    pub fn explanation(&self) -> Option<&str> {
        self.explanation.as_deref()
    }

    pub fn error(&self) -> Option<&TurnError> {
        self.error.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.error.as_ref().map(|e| e.kind), Some(TurnErrorKind::Cancelled))
    }

    /// Query ran and matched nothing.
    pub fn is_empty_result(&self) -> bool {
        self.result.as_ref().map(|r| r.is_empty()).unwrap_or(false)
    }
}

/// Read-only view handed to observers.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub status: ConnectionStatus,
    pub status_detail: Option<String>,
    pub phase: PipelineState,
    pub blocked: bool,
    pub turns: Vec<Turn>,
}

pub(crate) struct InFlight {
    pub(crate) run_id: u64,
    pub(crate) cancel: oneshot::Sender<()>,
}

pub(crate) struct SessionState {
    pub(crate) history: Vec<Turn>,
    pub(crate) status: ConnectionStatus,
    pub(crate) status_detail: Option<String>,
    pub(crate) phase: PipelineState,
    /// Set after the lakehouse rejects the token; cleared by a credential refresh.
    pub(crate) auth_blocked: bool,
    pub(crate) credentials: Arc<Credentials>,
    pub(crate) in_flight: Option<InFlight>,
    pub(crate) next_run_id: u64,
    pub(crate) last_question: Option<String>,
    pub(crate) last_activity: Instant,
}

impl SessionState {
    /// Abandon the in-flight run, if any.
    pub(crate) fn cancel_in_flight(&mut self) -> Option<u64> {
        self.in_flight.take().map(|run| {
            // The receiver may already be gone if the run just finished.
            let _ = run.cancel.send(());
            run.run_id
        })
    }

    pub(crate) fn is_active(&self, run_id: u64) -> bool {
        self.in_flight.as_ref().map(|r| r.run_id) == Some(run_id)
    }
}

pub struct Session {
    id: Uuid,
    created_at: DateTime<Utc>,
    pub(crate) state: Mutex<SessionState>,
}

impl Session {
    pub fn new(credentials: Arc<Credentials>) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            state: Mutex::new(SessionState {
                history: Vec::new(),
                status: ConnectionStatus::Disconnected,
                status_detail: None,
                phase: PipelineState::Idle,
                auth_blocked: false,
                credentials,
                in_flight: None,
                next_run_id: 1,
                last_question: None,
                last_activity: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().await;
        SessionSnapshot {
            id: self.id,
            created_at: self.created_at,
            status: state.status,
            status_detail: state.status_detail.clone(),
            phase: state.phase,
            blocked: state.auth_blocked,
            turns: state.history.clone(),
        }
    }

    pub async fn status(&self) -> ConnectionStatus {
        self.state.lock().await.status
    }

    pub async fn phase(&self) -> PipelineState {
        self.state.lock().await.phase
    }

    pub async fn history(&self) -> Vec<Turn> {
        self.state.lock().await.history.clone()
    }

    /// Record user activity.
    pub async fn touch(&self) {
        self.state.lock().await.last_activity = Instant::now();
    }

    /// Time since the last activity; zero while a run is in flight.
    pub async fn idle_for(&self) -> Duration {
        let state = self.state.lock().await;
        if state.in_flight.is_some() {
            return Duration::ZERO;
        }
        state.last_activity.elapsed()
    }
}
