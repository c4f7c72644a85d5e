mod common;

use berdl_chat::error::ErrorOrigin;
use berdl_chat::execution::{LakehousePayload, TransportError};
use berdl_chat::{
    ConnectionStatus, ExecutionErrorKind, GenerationErrorKind, PipelineState, Session, TurnErrorKind,
};
use common::*;
use std::sync::Arc;
use std::time::Duration;

const SLOW: &str = "Which taxa dominate acidic soils?";

/// 401 for the stale token, rows for anything else.
fn token_checking_lakehouse() -> MockLakehouse {
    MockLakehouse::new(|_, token| {
        if token == "expired" {
            Err(TransportError::Status {
                status: 401,
                body: "{\"detail\":\"Invalid token\"}".to_string(),
            })
        } else {
            Ok(LakehousePayload::rows(ecosystem_rows()))
        }
    })
}

async fn wait_for_phase(session: &Session, phase: PipelineState) {
    for _ in 0..200 {
        if session.phase().await == phase {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session never reached {:?}", phase);
}

#[tokio::test]
async fn test_connect_checks_token() {
    let model = Arc::new(ScriptedModel::answering(STUDY_SQL, "unused"));
    let lakehouse = Arc::new(token_checking_lakehouse());
    let orchestrator = orchestrator(&model, &lakehouse);

    let good = orchestrator.open_session(credentials("kb-token"));
    assert_eq!(orchestrator.connect(&good).await, ConnectionStatus::Connected);

    let bad = orchestrator.open_session(credentials("expired"));
    assert_eq!(orchestrator.connect(&bad).await, ConnectionStatus::Error);
    assert!(bad.snapshot().await.blocked);

    let calls = lakehouse.calls.lock().unwrap().clone();
    assert!(calls.iter().all(|(sql, _, _)| sql == "SELECT 1 AS test"));
    assert_eq!(model.call_count(), 0);
}

#[tokio::test]
async fn test_unreachable_lakehouse_does_not_block() {
    let model = Arc::new(ScriptedModel::answering(STUDY_SQL, "unused"));
    let lakehouse = Arc::new(MockLakehouse::new(|_, _| Err(TransportError::Timeout)));
    let orchestrator = orchestrator(&model, &lakehouse);
    let session = orchestrator.open_session(credentials("kb-token"));

    assert_eq!(orchestrator.connect(&session).await, ConnectionStatus::Error);
    let snapshot = session.snapshot().await;
    assert!(!snapshot.blocked);
    assert!(snapshot.status_detail.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_expired_token_blocks_until_refresh() {
    let model = Arc::new(ScriptedModel::answering(STUDY_SQL, "Soil leads with 18 studies."));
    let lakehouse = Arc::new(token_checking_lakehouse());
    let orchestrator = orchestrator(&model, &lakehouse);
    let session = orchestrator.open_session(credentials("expired"));

    let first = orchestrator
        .handle_question(&session, "Count studies by ecosystem type")
        .await;
    let error = first.error().unwrap();
    assert_eq!(error.kind, TurnErrorKind::Execution(ExecutionErrorKind::Unauthorized));
    assert_eq!(error.origin, Some(ErrorOrigin::Remote));
    assert!(error.message.contains("KB_AUTH_TOKEN"));
    assert_eq!(session.status().await, ConnectionStatus::Error);

    let model_calls = model.call_count();
    let lakehouse_calls = lakehouse.call_count();

    let blocked = orchestrator.handle_question(&session, "How many studies are there?").await;
    let error = blocked.error().unwrap();
    assert_eq!(error.kind, TurnErrorKind::Execution(ExecutionErrorKind::Unauthorized));
    assert_eq!(error.origin, Some(ErrorOrigin::Local));
    assert_eq!(model.call_count(), model_calls);
    assert_eq!(lakehouse.call_count(), lakehouse_calls);
    assert_eq!(session.history().await.len(), 2);

    let status = orchestrator.refresh_credentials(&session, "fresh-token").await;
    assert_eq!(status, ConnectionStatus::Connected);
    assert!(!session.snapshot().await.blocked);

    let answered = orchestrator.handle_question(&session, "How many studies are there?").await;
    assert!(answered.error().is_none());
    let calls = lakehouse.calls.lock().unwrap().clone();
    assert_eq!(calls.last().unwrap().1, "fresh-token");
}

#[tokio::test]
async fn test_newer_question_supersedes_older() {
    let model = Arc::new(
        ScriptedModel::answering(STUDY_SQL, "Soil leads.").slow_on(SLOW, Duration::from_secs(5)),
    );
    let lakehouse = Arc::new(MockLakehouse::returning(ecosystem_rows()));
    let orchestrator = orchestrator(&model, &lakehouse);
    let session = orchestrator.open_session(credentials("kb-token"));

    let first = {
        let orchestrator = Arc::clone(&orchestrator);
        let session = Arc::clone(&session);
        tokio::spawn(async move { orchestrator.handle_question(&session, SLOW).await })
    };
    wait_for_phase(&session, PipelineState::Generating).await;

    let second = orchestrator
        .handle_question(&session, "Count studies by ecosystem type")
        .await;
    let first = first.await.unwrap();

    assert!(first.is_cancelled());
    assert_eq!(first.question(), SLOW);
    assert!(second.error().is_none());

    let history = session.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].question(), "Count studies by ecosystem type");
    assert_eq!(session.phase().await, PipelineState::Idle);
    // The abandoned run never reached the lakehouse.
    assert_eq!(lakehouse.query_count(), 1);
}

#[tokio::test]
async fn test_disconnect_abandons_in_flight_run() {
    let model = Arc::new(
        ScriptedModel::answering(STUDY_SQL, "unused").slow_on(SLOW, Duration::from_secs(5)),
    );
    let lakehouse = Arc::new(MockLakehouse::returning(ecosystem_rows()));
    let orchestrator = orchestrator(&model, &lakehouse);
    let session = orchestrator.open_session(credentials("kb-token"));
    orchestrator.connect(&session).await;

    let run = {
        let orchestrator = Arc::clone(&orchestrator);
        let session = Arc::clone(&session);
        tokio::spawn(async move { orchestrator.handle_question(&session, SLOW).await })
    };
    wait_for_phase(&session, PipelineState::Generating).await;

    orchestrator.disconnect(&session).await;
    let turn = run.await.unwrap();

    assert!(turn.is_cancelled());
    let snapshot = session.snapshot().await;
    assert_eq!(snapshot.status, ConnectionStatus::Disconnected);
    assert_eq!(snapshot.phase, PipelineState::Idle);
    assert!(snapshot.turns.is_empty());
}

#[tokio::test]
async fn test_stage_timeout_fails_the_turn() {
    let model = Arc::new(
        ScriptedModel::answering(STUDY_SQL, "unused").slow_on(SLOW, Duration::from_secs(5)),
    );
    let lakehouse = Arc::new(MockLakehouse::returning(ecosystem_rows()));
    let mut config = test_config();
    config.stage_timeout = Duration::from_millis(50);
    let orchestrator = orchestrator_with(&config, &model, &lakehouse);
    let session = orchestrator.open_session(credentials("kb-token"));

    let turn = orchestrator.handle_question(&session, SLOW).await;

    assert_eq!(
        turn.error().unwrap().kind,
        TurnErrorKind::Generation(GenerationErrorKind::Timeout)
    );
    assert!(!turn.is_cancelled());
    assert_eq!(session.history().await.len(), 1);
    assert_eq!(session.phase().await, PipelineState::Idle);
}

#[tokio::test]
async fn test_blocked_question_abandons_in_flight_run() {
    let model = Arc::new(
        ScriptedModel::answering(STUDY_SQL, "unused").slow_on(SLOW, Duration::from_secs(5)),
    );
    // The connection check is rejected, queries would succeed.
    let lakehouse = Arc::new(MockLakehouse::new(|sql, _| {
        if sql == "SELECT 1 AS test" {
            Err(TransportError::Status {
                status: 401,
                body: "token revoked".to_string(),
            })
        } else {
            Ok(LakehousePayload::rows(ecosystem_rows()))
        }
    }));
    let orchestrator = orchestrator(&model, &lakehouse);
    let session = orchestrator.open_session(credentials("kb-token"));

    let run = {
        let orchestrator = Arc::clone(&orchestrator);
        let session = Arc::clone(&session);
        tokio::spawn(async move { orchestrator.handle_question(&session, SLOW).await })
    };
    wait_for_phase(&session, PipelineState::Generating).await;

    assert_eq!(orchestrator.connect(&session).await, ConnectionStatus::Error);
    let blocked = orchestrator.handle_question(&session, "How many studies are there?").await;
    assert_eq!(
        blocked.error().unwrap().kind,
        TurnErrorKind::Execution(ExecutionErrorKind::Unauthorized)
    );

    let abandoned = run.await.unwrap();
    assert!(abandoned.is_cancelled());
    assert_eq!(session.phase().await, PipelineState::Idle);
    assert_eq!(session.history().await.len(), 1);
    assert_eq!(lakehouse.query_count(), 0);
}
