//! Production wiring: real HTTP clients behind the orchestrator.

use std::sync::Arc;

use crate::config::Config;
use crate::error::{ChatError, Result};
use crate::execution::HttpLakehouse;
use crate::llm::AnthropicClient;
use crate::orchestrator::Orchestrator;
use crate::schema;

pub fn build_orchestrator(config: &Config) -> Result<Arc<Orchestrator>> {
    let model = AnthropicClient::new(config.llm_base_url.clone(), config.request_timeout)
        .map_err(|e| ChatError::Http(e.to_string()))?;
    let lakehouse = HttpLakehouse::new(config.lakehouse_url.clone(), config.request_timeout)
        .map_err(|e| ChatError::Http(e.to_string()))?;

    Ok(Arc::new(Orchestrator::from_config(
        config,
        Arc::new(model),
        Arc::new(lakehouse),
        Arc::new(schema::describe()),
    )))
}
