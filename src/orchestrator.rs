//! Conversation Orchestrator
//!
//! Runs generate → execute → explain for one question, turns every failure
//! into a Turn with a user-facing message, and drives the session's
//! connection status and pipeline state. At most one run per session is in
//! flight; a newer question abandons the older run.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::{Config, Credentials};
use crate::error::{
    ErrorOrigin, ExecutionError, ExecutionErrorKind, GenerationError, GenerationErrorKind,
};
use crate::execution::{Lakehouse, QueryExecutor};
use crate::explainer::ResultExplainer;
use crate::llm::LanguageModel;
use crate::schema::SchemaDescription;
use crate::session::{
    ConnectionStatus, InFlight, PipelineState, Session, Turn, TurnError, TurnErrorKind,
};
use crate::sql_generator::SqlGenerator;

/// What a finished run does to the session's connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusChange {
    Keep,
    Connected,
    Failed,
    AuthRejected,
}

pub struct Orchestrator {
    generator: SqlGenerator,
    executor: QueryExecutor,
    explainer: ResultExplainer,
    schema: Arc<SchemaDescription>,
    stage_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        generator: SqlGenerator,
        executor: QueryExecutor,
        explainer: ResultExplainer,
        schema: Arc<SchemaDescription>,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            generator,
            executor,
            explainer,
            schema,
            stage_timeout,
        }
    }

    /// Wire the three components from configuration.
    pub fn from_config(
        config: &Config,
        model: Arc<dyn LanguageModel>,
        lakehouse: Arc<dyn Lakehouse>,
        schema: Arc<SchemaDescription>,
    ) -> Self {
        let generator = SqlGenerator::new(
            Arc::clone(&model),
            config.model.clone(),
            config.generate_max_tokens,
            config.history_turns,
        );
        let executor = QueryExecutor::new(lakehouse, Arc::clone(&schema), config.row_limit);
        let explainer = ResultExplainer::new(
            model,
            config.model.clone(),
            config.explain_max_tokens,
            config.explain_row_cap,
            config.explain_char_budget,
        );
        Self::new(generator, executor, explainer, schema, config.stage_timeout)
    }

    pub fn schema(&self) -> &SchemaDescription {
        &self.schema
    }

    pub fn open_session(&self, credentials: Arc<Credentials>) -> Arc<Session> {
        let session = Arc::new(Session::new(credentials));
        info!(session_id = %session.id(), "Session opened");
        session
    }

    /// Check the lakehouse connection with the session's token.
    pub async fn connect(&self, session: &Session) -> ConnectionStatus {
        let credentials = {
            let mut state = session.state.lock().await;
            state.status = ConnectionStatus::Connecting;
            state.status_detail = None;
            Arc::clone(&state.credentials)
        };

        let outcome = match tokio::time::timeout(self.stage_timeout, self.executor.check_connection(&credentials)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ExecutionError::local(
                ExecutionErrorKind::Timeout,
                "Connection check exceeded stage timeout",
            )),
        };

        let mut state = session.state.lock().await;
        match outcome {
            Ok(()) => {
                state.status = ConnectionStatus::Connected;
                state.status_detail = Some("Connected to BERDL".to_string());
                state.auth_blocked = false;
                info!(session_id = %session.id(), "Connected to lakehouse");
            }
            Err(err) => {
                warn!(session_id = %session.id(), kind = ?err.kind, detail = %err.message, "Connection check failed");
                state.status = ConnectionStatus::Error;
                state.status_detail = Some(execution_message(&err));
                if err.kind == ExecutionErrorKind::Unauthorized {
                    state.auth_blocked = true;
                }
            }
        }
        state.status
    }

    /// Swap in a fresh lakehouse token, unblock the session and check the connection again.
    pub async fn refresh_credentials(&self, session: &Session, lakehouse_token: &str) -> ConnectionStatus {
        {
            let mut state = session.state.lock().await;
            let refreshed = state.credentials.with_lakehouse_token(lakehouse_token);
            state.credentials = Arc::new(refreshed);
            state.auth_blocked = false;
        }
        info!(session_id = %session.id(), "Session credentials refreshed");
        self.connect(session).await
    }

    /// Abandon any in-flight run and mark the session disconnected.
    pub async fn disconnect(&self, session: &Session) {
        let mut state = session.state.lock().await;
        if let Some(run_id) = state.cancel_in_flight() {
            info!(session_id = %session.id(), run_id, "Abandoned in-flight run on disconnect");
        }
        state.phase = PipelineState::Idle;
        state.status = ConnectionStatus::Disconnected;
        state.status_detail = None;
    }

    /// Re-run the last question from the beginning.
    pub async fn retry(&self, session: &Session) -> Option<Turn> {
        let question = session.state.lock().await.last_question.clone()?;
        Some(self.handle_question(session, &question).await)
    }

    /// Answer one question. Never fails; problems come back inside the Turn.
    ///
    /// A run that gets superseded returns a `Cancelled` turn that is not
    /// recorded in the session history.
    pub async fn handle_question(&self, session: &Session, question: &str) -> Turn {
        let started = Instant::now();
        let question = question.trim();

        if question.is_empty() {
            return Turn::failed(
                question,
                None,
                None,
                TurnError {
                    kind: TurnErrorKind::EmptyQuestion,
                    origin: None,
                    message: "Please enter a question.".to_string(),
                    detail: "blank question".to_string(),
                },
                started,
            );
        }

        let (run_id, mut cancel_rx, credentials, history) = {
            let mut state = session.state.lock().await;
            state.last_question = Some(question.to_string());
            state.last_activity = Instant::now();

            if state.auth_blocked {
                if let Some(previous) = state.cancel_in_flight() {
                    info!(session_id = %session.id(), run_id = previous, "Abandoned in-flight run on blocked session");
                    state.phase = PipelineState::Idle;
                }
                let turn = Turn::failed(
                    question,
                    None,
                    None,
                    TurnError {
                        kind: TurnErrorKind::Execution(ExecutionErrorKind::Unauthorized),
                        origin: Some(ErrorOrigin::Local),
                        message: "The lakehouse token was rejected. Refresh your credentials before asking again."
                            .to_string(),
                        detail: "session blocked after Unauthorized".to_string(),
                    },
                    started,
                );
                state.history.push(turn.clone());
                return turn;
            }

            if let Some(previous) = state.cancel_in_flight() {
                info!(session_id = %session.id(), run_id = previous, "Superseding in-flight run");
            }

            let run_id = state.next_run_id;
            state.next_run_id += 1;
            let (tx, rx) = oneshot::channel();
            state.in_flight = Some(InFlight { run_id, cancel: tx });
            state.phase = PipelineState::Generating;
            (run_id, rx, Arc::clone(&state.credentials), state.history.clone())
        };

        info!(session_id = %session.id(), run_id, question = %question, "Handling question");

        let pipeline = self.run_pipeline(session, run_id, question, &credentials, &history, started);
        let (turn, change) = tokio::select! {
            finished = pipeline => finished,
            _ = &mut cancel_rx => {
                info!(session_id = %session.id(), run_id, "Run abandoned");
                return cancelled_turn(question, started);
            }
        };

        let mut state = session.state.lock().await;
        if !state.is_active(run_id) {
            // Superseded between the pipeline finishing and taking the lock.
            return cancelled_turn(question, started);
        }
        state.in_flight = None;
        state.phase = PipelineState::Idle;
        match change {
            StatusChange::Keep => {}
            StatusChange::Connected => {
                state.status = ConnectionStatus::Connected;
                state.status_detail = Some("Connected to BERDL".to_string());
            }
            StatusChange::Failed => {
                state.status = ConnectionStatus::Error;
                state.status_detail = turn.error().map(|e| e.message.clone());
            }
            StatusChange::AuthRejected => {
                state.status = ConnectionStatus::Error;
                state.status_detail = turn.error().map(|e| e.message.clone());
                state.auth_blocked = true;
            }
        }
        state.history.push(turn.clone());

        match turn.error() {
            None => info!(
                session_id = %session.id(),
                run_id,
                rows = turn.result().map(|r| r.row_count()).unwrap_or(0),
                elapsed_ms = turn.elapsed_ms(),
                "Turn answered"
            ),
            Some(err) => warn!(
                session_id = %session.id(),
                run_id,
                kind = ?err.kind,
                origin = ?err.origin,
                detail = %err.detail,
                "Turn failed"
            ),
        }
        turn
    }

    async fn run_pipeline(
        &self,
        session: &Session,
        run_id: u64,
        question: &str,
        credentials: &Credentials,
        history: &[Turn],
        started: Instant,
    ) -> (Turn, StatusChange) {
        let generated = match self
            .bounded(
                self.generator.generate(question, &self.schema, history, credentials),
                || GenerationError::new(GenerationErrorKind::Timeout, "SQL generation exceeded stage timeout"),
            )
            .await
        {
            Ok(generated) => generated,
            Err(err) => {
                let error = TurnError {
                    kind: TurnErrorKind::Generation(err.kind),
                    origin: None,
                    message: generation_message(err.kind, false),
                    detail: err.message,
                };
                return (Turn::failed(question, None, None, error, started), StatusChange::Keep);
            }
        };

        self.advance(session, run_id, PipelineState::Executing).await;

        let result = match self
            .bounded(self.executor.execute(&generated.sql, credentials), || {
                ExecutionError::local(ExecutionErrorKind::Timeout, "Query execution exceeded stage timeout")
            })
            .await
        {
            Ok(result) => result,
            Err(err) => {
                let change = match err.kind {
                    ExecutionErrorKind::Unauthorized => StatusChange::AuthRejected,
                    ExecutionErrorKind::ServiceUnavailable => StatusChange::Failed,
                    _ => StatusChange::Keep,
                };
                let error = TurnError {
                    kind: TurnErrorKind::Execution(err.kind),
                    origin: Some(err.origin),
                    message: execution_message(&err),
                    detail: err.message,
                };
                return (
                    Turn::failed(question, Some(generated.sql), None, error, started),
                    change,
                );
            }
        };

        self.advance(session, run_id, PipelineState::Explaining).await;

        match self
            .bounded(
                self.explainer.explain(question, &generated.sql, &result, credentials),
                || GenerationError::new(GenerationErrorKind::Timeout, "Explanation exceeded stage timeout"),
            )
            .await
        {
            Ok(explanation) => (
                Turn::answered(question, generated.sql, result, explanation, started),
                StatusChange::Connected,
            ),
            Err(err) => {
                let error = TurnError {
                    kind: TurnErrorKind::Explanation(err.kind),
                    origin: None,
                    message: generation_message(err.kind, true),
                    detail: err.message,
                };
                (
                    Turn::failed(question, Some(generated.sql), Some(result), error, started),
                    StatusChange::Connected,
                )
            }
        }
    }

    async fn advance(&self, session: &Session, run_id: u64, phase: PipelineState) {
        let mut state = session.state.lock().await;
        if state.is_active(run_id) {
            state.phase = phase;
        }
    }

    async fn bounded<T, E, F>(&self, fut: F, on_timeout: impl FnOnce() -> E) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        match tokio::time::timeout(self.stage_timeout, fut).await {
            Ok(outcome) => outcome,
            Err(_) => Err(on_timeout()),
        }
    }
}

fn cancelled_turn(question: &str, started: Instant) -> Turn {
    Turn::failed(
        question,
        None,
        None,
        TurnError {
            kind: TurnErrorKind::Cancelled,
            origin: None,
            message: "This question was replaced by a newer one.".to_string(),
            detail: "run superseded".to_string(),
        },
        started,
    )
}

fn generation_message(kind: GenerationErrorKind, explaining: bool) -> String {
    match kind {
        GenerationErrorKind::RateLimited => {
            "The language model is rate-limiting requests. Please wait a moment and try again.".to_string()
        }
        GenerationErrorKind::AuthFailed => {
            "The language-model API key was rejected. Check ANTHROPIC_API_KEY.".to_string()
        }
        GenerationErrorKind::Timeout => {
            "The language model did not respond in time. Please try again.".to_string()
        }
        GenerationErrorKind::MalformedResponse if explaining => {
            "The query ran, but I couldn't produce a summary of the results.".to_string()
        }
        GenerationErrorKind::MalformedResponse => {
            "I couldn't turn that question into a SQL query. Try rephrasing it.".to_string()
        }
        GenerationErrorKind::Unavailable => {
            "The language model is unavailable right now. Please try again later.".to_string()
        }
    }
}

fn execution_message(err: &ExecutionError) -> String {
    match err.kind {
        ExecutionErrorKind::Unauthorized => {
            "The lakehouse rejected the access token (it may have expired). Refresh KB_AUTH_TOKEN to continue."
                .to_string()
        }
        ExecutionErrorKind::SyntaxError => format!("The generated query could not be run: {}", err.message),
        ExecutionErrorKind::Timeout => {
            "The query timed out. Try a narrower question or add filters.".to_string()
        }
        ExecutionErrorKind::Empty => "The lakehouse returned no result set for this query.".to_string(),
        ExecutionErrorKind::ServiceUnavailable => {
            "The lakehouse is unreachable right now. Please try again later.".to_string()
        }
    }
}
