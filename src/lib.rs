pub mod app;
pub mod config;
pub mod error;
pub mod execution;
pub mod explainer;
pub mod llm;
pub mod orchestrator;
pub mod repl;
pub mod schema;
pub mod server;
pub mod session;
pub mod sql_generator;
pub mod sql_guard;

pub use config::{Config, Credentials};
pub use error::{ChatError, ExecutionError, ExecutionErrorKind, GenerationError, GenerationErrorKind, Result};
pub use orchestrator::Orchestrator;
pub use session::{ConnectionStatus, PipelineState, Session, Turn, TurnError, TurnErrorKind};
