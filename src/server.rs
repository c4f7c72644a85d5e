//! HTTP API for the chat UI
//!
//! Plain tokio TCP server speaking just enough HTTP/1.1 for a JSON API:
//! one request per connection, `Connection: close` semantics.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Credentials;
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::schema::EXAMPLE_QUESTIONS;
use crate::session::Session;

const MAX_REQUEST_BYTES: usize = 1_000_000;
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(1800);

pub struct AppState {
    orchestrator: Arc<Orchestrator>,
    credentials: Arc<Credentials>,
    sessions: Mutex<HashMap<Uuid, Arc<Session>>>,
    idle_timeout: Duration,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>, credentials: Arc<Credentials>) -> Self {
        Self {
            orchestrator,
            credentials,
            sessions: Mutex::new(HashMap::new()),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    async fn session(&self, id: &str) -> Option<Arc<Session>> {
        let id = Uuid::parse_str(id).ok()?;
        let session = self.sessions.lock().await.get(&id).cloned()?;
        session.touch().await;
        Some(session)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Disconnect and drop sessions idle for at least the idle timeout.
    /// Returns how many were closed.
    pub async fn sweep_idle(&self) -> usize {
        let candidates: Vec<Arc<Session>> = self.sessions.lock().await.values().cloned().collect();

        let mut stale = Vec::new();
        for session in candidates {
            if session.idle_for().await >= self.idle_timeout {
                stale.push(session);
            }
        }

        let mut closed = 0;
        for session in stale {
            if self.sessions.lock().await.remove(&session.id()).is_some() {
                self.orchestrator.disconnect(&session).await;
                info!(session_id = %session.id(), "Closed idle session");
                closed += 1;
            }
        }
        closed
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    fn json(status: u16, value: serde_json::Value) -> Self {
        Self {
            status,
            body: value.to_string(),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(status, serde_json::json!({ "error": message }))
    }

    fn to_wire(&self) -> String {
        create_response(self.status, status_text(self.status), &self.body)
    }
}

#[derive(Deserialize)]
struct AskRequest {
    question: String,
}

#[derive(Deserialize)]
struct CredentialsRequest {
    lakehouse_token: String,
}

pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Server listening on http://{}", addr);

    let sweeper = Arc::clone(&state);
    tokio::spawn(async move {
        let period = (sweeper.idle_timeout / 4).max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let closed = sweeper.sweep_idle().await;
            if closed > 0 {
                debug!(closed, "Idle session sweep");
            }
        }
    });

    loop {
        let (stream, peer) = listener.accept().await?;
        debug!("New connection from: {}", peer);
        let state = Arc::clone(&state);
        tokio::spawn(async move { handle_connection(state, stream).await });
    }
}

async fn handle_connection(state: Arc<AppState>, mut stream: TcpStream) {
    let mut buffer = Vec::new();
    let mut temp_buf = [0u8; 8192];

    let read_result = timeout(Duration::from_secs(5), async {
        loop {
            let n = stream.read(&mut temp_buf).await?;
            if n == 0 {
                break;
            }
            buffer.extend_from_slice(&temp_buf[..n]);
            if request_complete(&buffer) || buffer.len() > MAX_REQUEST_BYTES {
                break;
            }
        }
        Ok::<(), std::io::Error>(())
    })
    .await;

    match read_result {
        Err(_) => {
            warn!("Request read timeout");
            return;
        }
        Ok(Err(e)) => {
            error!("Failed to read from stream: {}", e);
            return;
        }
        Ok(Ok(())) => {}
    }

    let response = match String::from_utf8(buffer) {
        Ok(raw) if !raw.is_empty() => handle_raw_request(&state, &raw).await,
        Ok(_) => return,
        Err(_) => HttpResponse::error(400, "Request is not valid UTF-8"),
    };

    if let Err(e) = stream.write_all(response.to_wire().as_bytes()).await {
        error!("Failed to write response: {}", e);
    }
}

fn request_complete(buffer: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(buffer) else {
        return false;
    };
    match text.find("\r\n\r\n") {
        Some(headers_end) => {
            let body_len = extract_content_length(text).unwrap_or(0);
            buffer.len() >= headers_end + 4 + body_len
        }
        None => false,
    }
}

fn extract_content_length(request: &str) -> Option<usize> {
    for line in request.lines() {
        if line.is_empty() {
            break;
        }
        if line.to_lowercase().starts_with("content-length:") {
            if let Some(value) = line.split(':').nth(1) {
                return value.trim().parse().ok();
            }
        }
    }
    None
}

/// Parse the request line and body, then route.
pub async fn handle_raw_request(state: &AppState, request: &str) -> HttpResponse {
    let Some(request_line) = request.lines().next() else {
        return HttpResponse::error(400, "Empty request");
    };
    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        return HttpResponse::error(400, "Malformed request line");
    }

    let path = parts[1].split('?').next().unwrap_or("/");
    let body = request
        .find("\r\n\r\n")
        .map(|idx| &request[idx + 4..])
        .unwrap_or("");

    route(state, parts[0], path, body).await
}

pub async fn route(state: &AppState, method: &str, path: &str, body: &str) -> HttpResponse {
    let trimmed = path.trim_end_matches('/');
    let segments: Vec<&str> = trimmed.split('/').filter(|s| !s.is_empty()).collect();
    debug!("Request: {} {}", method, trimmed);

    match (method, segments.as_slice()) {
        ("OPTIONS", _) => HttpResponse {
            status: 204,
            body: String::new(),
        },
        ("GET", ["api", "health"]) => {
            HttpResponse::json(200, serde_json::json!({"status": "ok", "service": "berdl-chat"}))
        }
        ("GET", ["api", "examples"]) => {
            HttpResponse::json(200, serde_json::json!({ "examples": EXAMPLE_QUESTIONS }))
        }
        ("GET", ["api", "schema"]) => match serde_json::to_value(state.orchestrator.schema()) {
            Ok(value) => HttpResponse::json(200, value),
            Err(e) => HttpResponse::error(500, &e.to_string()),
        },
        ("POST", ["api", "sessions"]) => {
            let session = state.orchestrator.open_session(Arc::clone(&state.credentials));
            state.sessions.lock().await.insert(session.id(), Arc::clone(&session));
            let status = state.orchestrator.connect(&session).await;
            HttpResponse::json(201, serde_json::json!({ "session_id": session.id(), "status": status }))
        }
        ("GET", ["api", "sessions", id]) => match state.session(id).await {
            Some(session) => snapshot_response(&session).await,
            None => HttpResponse::error(404, "Unknown session"),
        },
        ("DELETE", ["api", "sessions", id]) => {
            let removed = match Uuid::parse_str(id) {
                Ok(uuid) => state.sessions.lock().await.remove(&uuid),
                Err(_) => None,
            };
            match removed {
                Some(session) => {
                    state.orchestrator.disconnect(&session).await;
                    info!(session_id = %session.id(), "Session closed");
                    HttpResponse::json(200, serde_json::json!({ "closed": session.id() }))
                }
                None => HttpResponse::error(404, "Unknown session"),
            }
        }
        ("POST", ["api", "sessions", id, "ask"]) => {
            let Some(session) = state.session(id).await else {
                return HttpResponse::error(404, "Unknown session");
            };
            let request: AskRequest = match serde_json::from_str(body.trim()) {
                Ok(r) => r,
                Err(_) => return HttpResponse::error(400, "JSON body with \"question\" required"),
            };
            let turn = state.orchestrator.handle_question(&session, &request.question).await;
            let status = session.status().await;
            HttpResponse::json(200, serde_json::json!({ "turn": turn, "status": status }))
        }
        ("POST", ["api", "sessions", id, "retry"]) => {
            let Some(session) = state.session(id).await else {
                return HttpResponse::error(404, "Unknown session");
            };
            match state.orchestrator.retry(&session).await {
                Some(turn) => {
                    let status = session.status().await;
                    HttpResponse::json(200, serde_json::json!({ "turn": turn, "status": status }))
                }
                None => HttpResponse::error(409, "Nothing to retry"),
            }
        }
        ("POST", ["api", "sessions", id, "credentials"]) => {
            let Some(session) = state.session(id).await else {
                return HttpResponse::error(404, "Unknown session");
            };
            let request = match serde_json::from_str::<CredentialsRequest>(body.trim()) {
                Ok(r) if !r.lakehouse_token.trim().is_empty() => r,
                _ => return HttpResponse::error(400, "JSON body with \"lakehouse_token\" required"),
            };
            let status = state
                .orchestrator
                .refresh_credentials(&session, request.lakehouse_token.trim())
                .await;
            HttpResponse::json(200, serde_json::json!({ "status": status }))
        }
        _ => HttpResponse::error(404, "Not found"),
    }
}

async fn snapshot_response(session: &Session) -> HttpResponse {
    match serde_json::to_value(session.snapshot().await) {
        Ok(value) => HttpResponse::json(200, value),
        Err(e) => HttpResponse::error(500, &e.to_string()),
    }
}

fn status_text(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        400 => "Bad Request",
        404 => "Not Found",
        409 => "Conflict",
        _ => "Internal Server Error",
    }
}

fn create_response(status: u16, status_text: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: application/json\r\n\
         Access-Control-Allow-Origin: *\r\n\
         Access-Control-Allow-Methods: GET, POST, DELETE, OPTIONS\r\n\
         Access-Control-Allow-Headers: Content-Type\r\n\
         Connection: close\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        status,
        status_text,
        body.len(),
        body
    )
}
