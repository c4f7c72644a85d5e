#![allow(dead_code)]

use async_trait::async_trait;
use berdl_chat::execution::{Lakehouse, LakehousePayload, TransportError};
use berdl_chat::llm::{CompletionRequest, LanguageModel, ProviderError};
use berdl_chat::{schema, Config, Credentials, Orchestrator};
use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const STUDY_SQL: &str =
    "SELECT ecosystem_type, COUNT(*) AS study_count FROM nmdc_core.study_table GROUP BY ecosystem_type";

type ModelReply = Box<dyn Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync>;
type LakehouseReply = Box<dyn Fn(&str, &str) -> Result<LakehousePayload, TransportError> + Send + Sync>;

/// Language model driven by a closure, recording every request.
pub struct ScriptedModel {
    reply: ModelReply,
    slow_question: Option<(String, Duration)>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new<F>(reply: F) -> Self
    where
        F: Fn(&CompletionRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
    {
        Self {
            reply: Box::new(reply),
            slow_question: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Fenced SQL for generation calls, fixed text for explanation calls.
    pub fn answering(sql: &str, explanation: &str) -> Self {
        let sql = sql.to_string();
        let explanation = explanation.to_string();
        Self::new(move |request| {
            if is_generation(request) {
                Ok(format!("```sql\n{}\n```", sql))
            } else {
                Ok(explanation.clone())
            }
        })
    }

    /// Delay generation when the question ends with `question`.
    pub fn slow_on(mut self, question: &str, delay: Duration) -> Self {
        self.slow_question = Some((question.to_string(), delay));
        self
    }

    pub fn generation_prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| is_generation(r))
            .map(|r| r.prompt.clone())
            .collect()
    }

    pub fn explanation_prompts(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| !is_generation(r))
            .map(|r| r.prompt.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

pub fn is_generation(request: &CompletionRequest) -> bool {
    request.system.is_some()
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: &CompletionRequest, _api_key: &str) -> Result<String, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some((question, delay)) = &self.slow_question {
            if is_generation(request) && request.prompt.ends_with(question.as_str()) {
                tokio::time::sleep(*delay).await;
            }
        }
        (self.reply)(request)
    }
}

/// Lakehouse driven by a closure over (sql, token).
pub struct MockLakehouse {
    reply: LakehouseReply,
    pub calls: Mutex<Vec<(String, String, u32)>>,
}

impl MockLakehouse {
    pub fn new<F>(reply: F) -> Self
    where
        F: Fn(&str, &str) -> Result<LakehousePayload, TransportError> + Send + Sync + 'static,
    {
        Self {
            reply: Box::new(reply),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn returning(rows: Vec<Map<String, Value>>) -> Self {
        Self::new(move |_, _| Ok(LakehousePayload::rows(rows.clone())))
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Calls other than the connection check.
    pub fn query_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(sql, _, _)| sql != "SELECT 1 AS test")
            .count()
    }
}

#[async_trait]
impl Lakehouse for MockLakehouse {
    async fn run_query(&self, sql: &str, token: &str, limit: u32) -> Result<LakehousePayload, TransportError> {
        self.calls
            .lock()
            .unwrap()
            .push((sql.to_string(), token.to_string(), limit));
        (self.reply)(sql, token)
    }
}

pub fn ecosystem_rows() -> Vec<Map<String, Value>> {
    [
        ("Soil", 18),
        ("Freshwater", 11),
        ("Marine", 9),
        ("Host-associated", 6),
        ("Sediment", 4),
    ]
    .iter()
    .map(|(ecosystem, count)| {
        json!({"ecosystem_type": ecosystem, "study_count": count})
            .as_object()
            .cloned()
            .unwrap()
    })
    .collect()
}

pub fn credentials(token: &str) -> Arc<Credentials> {
    Arc::new(Credentials::new(token, "sk-ant-test"))
}

pub fn test_config() -> Config {
    Config::with_credentials(Credentials::new("kb-token", "sk-ant-test"))
}

pub fn orchestrator_with(
    config: &Config,
    model: &Arc<ScriptedModel>,
    lakehouse: &Arc<MockLakehouse>,
) -> Arc<Orchestrator> {
    let model: Arc<dyn LanguageModel> = model.clone();
    let lakehouse: Arc<dyn Lakehouse> = lakehouse.clone();
    Arc::new(Orchestrator::from_config(
        config,
        model,
        lakehouse,
        Arc::new(schema::describe()),
    ))
}

pub fn orchestrator(model: &Arc<ScriptedModel>, lakehouse: &Arc<MockLakehouse>) -> Arc<Orchestrator> {
    orchestrator_with(&test_config(), model, lakehouse)
}
