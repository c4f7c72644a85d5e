//! Result Explainer
//!
//! Second model call of a turn. Rows are capped by count and by characters
//! before they go into the prompt; an empty result is stated outright.

use std::sync::Arc;
use tracing::debug;

use crate::config::Credentials;
use crate::error::GenerationError;
use crate::execution::QueryResult;
use crate::llm::{CompletionRequest, LanguageModel};

pub const NO_ROWS_NOTICE: &str = "The query returned no rows.";

/// Appended to a row that was cut to fit the character budget.
pub const ROW_CUT_MARKER: &str = " ...(row cut)";

/// Rows as they will appear in the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedRows {
    pub text: String,
    pub shown: usize,
    pub truncated: bool,
    /// The first row alone exceeded the budget and was cut short.
    pub row_cut: bool,
}

/// One JSON object per line, stopping at `row_cap` rows or before the
/// line that would push the text past `char_budget`. A first row wider than
/// the whole budget is cut and marked instead of dropped.
pub fn render_rows(result: &QueryResult, row_cap: usize, char_budget: usize) -> RenderedRows {
    let mut text = String::new();
    let mut shown = 0;
    let mut row_cut = false;

    for idx in 0..result.row_count().min(row_cap) {
        let line = match result.row_object(idx) {
            Some(object) => serde_json::Value::Object(object).to_string(),
            None => break,
        };
        let added = line.chars().count() + usize::from(shown > 0);
        if text.chars().count() + added > char_budget {
            if shown == 0 {
                let keep = char_budget.saturating_sub(ROW_CUT_MARKER.chars().count());
                text.extend(line.chars().take(keep));
                text.push_str(ROW_CUT_MARKER);
                shown = 1;
                row_cut = true;
            }
            break;
        }
        if shown > 0 {
            text.push('\n');
        }
        text.push_str(&line);
        shown += 1;
    }

    RenderedRows {
        text,
        shown,
        truncated: row_cut || (shown as u64) < result.total_count,
        row_cut,
    }
}

pub struct ResultExplainer {
    model: Arc<dyn LanguageModel>,
    model_name: String,
    max_tokens: u32,
    row_cap: usize,
    char_budget: usize,
}

impl ResultExplainer {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        model_name: impl Into<String>,
        max_tokens: u32,
        row_cap: usize,
        char_budget: usize,
    ) -> Self {
        Self {
            model,
            model_name: model_name.into(),
            max_tokens,
            row_cap,
            char_budget,
        }
    }

    pub async fn explain(
        &self,
        question: &str,
        sql: &str,
        result: &QueryResult,
        credentials: &Credentials,
    ) -> Result<String, GenerationError> {
        let request = CompletionRequest {
            model: self.model_name.clone(),
            system: None,
            prompt: self.build_prompt(question, sql, result),
            max_tokens: self.max_tokens,
        };

        let reply = self
            .model
            .complete(&request, credentials.llm_api_key())
            .await
            .map_err(GenerationError::from)?;

        let reply = reply.trim();
        if reply.is_empty() {
            return Err(GenerationError::malformed("Model returned an empty explanation"));
        }
        debug!(chars = reply.len(), "Explanation received");
        Ok(reply.to_string())
    }

    pub fn build_prompt(&self, question: &str, sql: &str, result: &QueryResult) -> String {
        let header = format!("The user asked: \"{}\"\n\nI ran this SQL: {}\n\n", question.trim(), sql.trim());

        if result.is_empty() {
            return format!(
                "{}{}\n\nTell the user in 1-2 sentences that no matching records were found. \
                 Do not invent counts or example values. You may suggest how to broaden the question.",
                header, NO_ROWS_NOTICE
            );
        }

        let rendered = render_rows(result, self.row_cap, self.char_budget);
        let mut heading = if rendered.truncated {
            format!(
                "Results ({} rows total, showing first {}):",
                result.total_count, rendered.shown
            )
        } else {
            format!("Results ({} rows total):", result.total_count)
        };
        if rendered.row_cut {
            heading.push_str(" The row is too wide to show in full; only its first columns are included.");
        }

        format!(
            "{}{}\nColumns: {}\n{}\n\nExplain what we found in 2-3 sentences. Be specific about numbers and findings.",
            header,
            heading,
            result.columns.join(", "),
            rendered.text
        )
    }
}
