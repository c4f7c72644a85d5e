//! Query Executor
//!
//! Runs the local read-only guard, then sends the statement to the lakehouse
//! and translates every transport or service failure into `ExecutionError`.

use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::config::Credentials;
use crate::error::{ExecutionError, ExecutionErrorKind};
use crate::execution::lakehouse::{Lakehouse, LakehousePayload, TransportError};
use crate::execution::result::QueryResult;
use crate::schema::SchemaDescription;
use crate::sql_guard::{self, GuardViolation};

const CONNECTION_CHECK_SQL: &str = "SELECT 1 AS test";

pub struct QueryExecutor {
    lakehouse: Arc<dyn Lakehouse>,
    schema: Arc<SchemaDescription>,
    row_limit: u32,
}

impl QueryExecutor {
    pub fn new(lakehouse: Arc<dyn Lakehouse>, schema: Arc<SchemaDescription>, row_limit: u32) -> Self {
        Self {
            lakehouse,
            schema,
            row_limit,
        }
    }

    /// Validate and run one read-only statement.
    pub async fn execute(
        &self,
        sql: &str,
        credentials: &Credentials,
    ) -> Result<QueryResult, ExecutionError> {
        sql_guard::check_read_only(sql, &self.schema).map_err(|violation| {
            warn!(violation = %violation, "Rejected statement before sending");
            ExecutionError::local(ExecutionErrorKind::SyntaxError, guard_message(&violation))
        })?;

        self.send(sql, credentials).await
    }

    /// Round trip a trivial statement to check token and reachability.
    pub async fn check_connection(&self, credentials: &Credentials) -> Result<(), ExecutionError> {
        self.send(CONNECTION_CHECK_SQL, credentials).await.map(|_| ())
    }

    async fn send(&self, sql: &str, credentials: &Credentials) -> Result<QueryResult, ExecutionError> {
        let started = Instant::now();
        let payload = self
            .lakehouse
            .run_query(sql, credentials.lakehouse_token(), self.row_limit)
            .await
            .map_err(map_transport_error)?;

        let result = payload_to_result(payload)?;
        info!(
            rows = result.row_count(),
            total = result.total_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Lakehouse query succeeded"
        );
        Ok(result)
    }
}

fn guard_message(violation: &GuardViolation) -> String {
    match violation {
        GuardViolation::UnknownTable(table) => format!("Query references unknown table {}", table),
        _ => format!("Only single read-only SELECT queries are allowed ({})", violation),
    }
}

/// HTTP-level failure → execution error.
pub fn map_transport_error(err: TransportError) -> ExecutionError {
    let kind = match &err {
        TransportError::Status { status, .. } => match *status {
            401 | 403 => ExecutionErrorKind::Unauthorized,
            408 | 504 => ExecutionErrorKind::Timeout,
            s if s >= 500 => ExecutionErrorKind::ServiceUnavailable,
            _ => ExecutionErrorKind::SyntaxError,
        },
        TransportError::Timeout => ExecutionErrorKind::Timeout,
        TransportError::Connect(_) | TransportError::Decode(_) => ExecutionErrorKind::ServiceUnavailable,
    };
    ExecutionError::remote(kind, err.to_string())
}

/// 2xx body → result, or the error it carries.
pub fn payload_to_result(payload: LakehousePayload) -> Result<QueryResult, ExecutionError> {
    if let Some(message) = payload.error_message() {
        let lowered = message.to_lowercase();
        let kind = if ["unauthorized", "authenticat", "forbidden", "expired token", "invalid token"]
            .iter()
            .any(|needle| lowered.contains(needle))
        {
            ExecutionErrorKind::Unauthorized
        } else if lowered.contains("timeout") || lowered.contains("timed out") {
            ExecutionErrorKind::Timeout
        } else {
            ExecutionErrorKind::SyntaxError
        };
        return Err(ExecutionError::remote(kind, message));
    }

    let total = payload.pagination.as_ref().and_then(|p| p.total_count);
    match payload.result {
        Some(rows) => Ok(QueryResult::from_objects(rows, total)),
        None => Err(ExecutionError::remote(
            ExecutionErrorKind::Empty,
            "Lakehouse response contained no result set",
        )),
    }
}
