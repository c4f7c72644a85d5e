//! SQL Generator
//!
//! Grounds the model with the schema, a few worked examples and the recent
//! conversation, then pulls exactly one read-only statement out of the reply.

use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Credentials;
use crate::error::GenerationError;
use crate::llm::{CompletionRequest, LanguageModel};
use crate::schema::SchemaDescription;
use crate::session::Turn;
use crate::sql_guard;

/// (question, SQL) pairs shown to the model before the real question.
const FEW_SHOT_EXAMPLES: [(&str, &str); 3] = [
    (
        "Count studies by ecosystem type",
        "SELECT ecosystem_type, COUNT(*) AS study_count FROM nmdc_core.study_table GROUP BY ecosystem_type ORDER BY study_count DESC LIMIT 20",
    ),
    (
        "How many samples have nitrogen fixation?",
        "SELECT COUNT(*) AS sample_count FROM nmdc_core.trait_features WHERE \"functional_group:nitrogen_fixation\" > 0",
    ),
    (
        "Show acidic samples with their temperature",
        "SELECT sample_id, annotations_ph, annotations_temp_has_numeric_value FROM nmdc_core.abiotic_features WHERE annotations_ph < 6 LIMIT 20",
    ),
];

lazy_static! {
    /// First fenced block. A language tag counts only when a newline follows it.
    static ref FENCED_BLOCK: Regex = Regex::new(r"(?s)```(?:[A-Za-z0-9_+-]*[ \t]*\r?\n)?(.*?)```").unwrap();
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSql {
    pub sql: String,
}

pub struct SqlGenerator {
    model: Arc<dyn LanguageModel>,
    model_name: String,
    max_tokens: u32,
    history_turns: usize,
}

impl SqlGenerator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        model_name: impl Into<String>,
        max_tokens: u32,
        history_turns: usize,
    ) -> Self {
        Self {
            model,
            model_name: model_name.into(),
            max_tokens,
            history_turns,
        }
    }

    pub async fn generate(
        &self,
        question: &str,
        schema: &SchemaDescription,
        history: &[Turn],
        credentials: &Credentials,
    ) -> Result<GeneratedSql, GenerationError> {
        let request = CompletionRequest {
            model: self.model_name.clone(),
            system: Some(schema.render_prompt()),
            prompt: self.build_prompt(question, history),
            max_tokens: self.max_tokens,
        };

        let reply = self
            .model
            .complete(&request, credentials.llm_api_key())
            .await
            .map_err(GenerationError::from)?;

        debug!(reply_chars = reply.len(), "SQL generation reply received");
        let sql = extract_sql(&reply)?;
        info!(sql = %sql, "Generated SQL");
        Ok(GeneratedSql { sql })
    }

    /// User-turn text: examples, recent turns that produced SQL, then the question.
    pub fn build_prompt(&self, question: &str, history: &[Turn]) -> String {
        let mut prompt = String::from("Examples:\n");
        for (q, sql) in FEW_SHOT_EXAMPLES.iter() {
            prompt.push_str(&format!("Q: {}\nSQL: {}\n\n", q, sql));
        }

        let recent: Vec<&Turn> = history
            .iter()
            .rev()
            .filter(|turn| turn.sql().is_some())
            .take(self.history_turns)
            .collect();
        if !recent.is_empty() {
            prompt.push_str("Earlier in this conversation:\n");
            for turn in recent.into_iter().rev() {
                prompt.push_str(&format!(
                    "Q: {}\nSQL: {}\n\n",
                    turn.question(),
                    turn.sql().unwrap_or_default()
                ));
            }
        }

        prompt.push_str(&format!("Write a SQL query to answer: {}", question.trim()));
        prompt
    }
}

/// Pull one SQL statement out of free-form model output.
///
/// 1. The body of the first fenced code block, if there is one.
/// 2. Otherwise, every line whose first word is a read keyword (`SELECT`,
///    `WITH`, `SHOW`, `DESCRIBE`, `DESC`) starts a block that runs to the next
///    blank line. The first block whose leading statement parses wins, so prose
///    such as "With the schema above..." is skipped.
///
/// The candidate is cut after its first `;` outside quotes and comments, and
/// must itself start with a read keyword. Anything else is `MalformedResponse`.
pub fn extract_sql(reply: &str) -> Result<String, GenerationError> {
    let candidate = match FENCED_BLOCK.captures(reply).and_then(|c| c.get(1)) {
        Some(body) => body.as_str().to_string(),
        None => unfenced_candidate(reply).ok_or_else(|| {
            GenerationError::malformed("Model reply did not contain a SQL statement")
        })?,
    };

    let statement = sql_guard::first_statement(&candidate).trim();
    if statement.trim_end_matches(';').trim().is_empty() {
        return Err(GenerationError::malformed("Model reply contained an empty SQL block"));
    }

    match sql_guard::leading_keyword(statement) {
        Some(keyword) if sql_guard::is_read_keyword(&keyword) => Ok(statement.to_string()),
        Some(keyword) => Err(GenerationError::malformed(format!(
            "Model reply starts with {} rather than a read-only query",
            keyword
        ))),
        None => Err(GenerationError::malformed("Model reply did not start with a SQL keyword")),
    }
}

fn unfenced_candidate(reply: &str) -> Option<String> {
    let lines: Vec<&str> = reply.lines().collect();

    (0..lines.len())
        .filter(|&idx| {
            sql_guard::leading_keyword(lines[idx])
                .map(|kw| sql_guard::is_read_keyword(&kw))
                .unwrap_or(false)
        })
        .map(|start| {
            lines[start..]
                .iter()
                .take_while(|line| !line.trim().is_empty())
                .copied()
                .collect::<Vec<&str>>()
                .join("\n")
        })
        .find(|block| sql_guard::parses(sql_guard::first_statement(block)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationErrorKind;

    #[test]
    fn test_plain_sql_reply() {
        let sql = extract_sql("SELECT ecosystem_type, COUNT(*) FROM study_table GROUP BY ecosystem_type;").unwrap();
        assert_eq!(sql, "SELECT ecosystem_type, COUNT(*) FROM study_table GROUP BY ecosystem_type;");
    }

    #[test]
    fn test_fenced_block_wins_over_prose() {
        let reply = "Select the best query:\n```sql\nSELECT kingdom FROM nmdc_core.taxonomy_dim GROUP BY kingdom\n```\nThis lists kingdoms.";
        assert_eq!(
            extract_sql(reply).unwrap(),
            "SELECT kingdom FROM nmdc_core.taxonomy_dim GROUP BY kingdom"
        );
    }

    #[test]
    fn test_only_first_statement_is_kept() {
        let reply = "```\nSELECT 1; DROP TABLE nmdc_core.study_table;\n```";
        assert_eq!(extract_sql(reply).unwrap(), "SELECT 1;");
    }

    #[test]
    fn test_semicolon_inside_literal_does_not_split() {
        let sql = extract_sql("SELECT name FROM nmdc_core.study_table WHERE name = 'a;b'").unwrap();
        assert_eq!(sql, "SELECT name FROM nmdc_core.study_table WHERE name = 'a;b'");
    }

    #[test]
    fn test_prose_then_sql_then_prose() {
        let reply = "Here is the query:\n\nWITH t AS (SELECT 1 AS x)\nSELECT x FROM t\n\nIt returns one row.";
        assert_eq!(extract_sql(reply).unwrap(), "WITH t AS (SELECT 1 AS x)\nSELECT x FROM t");
    }

    #[test]
    fn test_prose_starting_with_keyword_is_skipped() {
        let reply = "With the schema above, the query is:\n\nSELECT ecosystem_type, COUNT(*) FROM nmdc_core.study_table GROUP BY ecosystem_type";
        assert_eq!(
            extract_sql(reply).unwrap(),
            "SELECT ecosystem_type, COUNT(*) FROM nmdc_core.study_table GROUP BY ecosystem_type"
        );

        let reply = "Select the kingdom column from taxonomy:\nSELECT kingdom FROM nmdc_core.taxonomy_dim";
        assert_eq!(extract_sql(reply).unwrap(), "SELECT kingdom FROM nmdc_core.taxonomy_dim");
    }

    #[test]
    fn test_keyword_prose_without_query_is_malformed() {
        let err = extract_sql("Show me which table you mean and I will write the query.").unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::MalformedResponse);
    }

    #[test]
    fn test_one_line_fence_keeps_select() {
        assert_eq!(extract_sql("```SELECT 1```").unwrap(), "SELECT 1");
        assert_eq!(
            extract_sql("```sql\nSELECT 1\n```").unwrap(),
            "SELECT 1"
        );
    }

    #[test]
    fn test_mutation_leading_keyword_is_malformed() {
        let err = extract_sql("```sql\nDELETE FROM nmdc_core.study_table\n```").unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::MalformedResponse);
        let err = extract_sql("DROP TABLE nmdc_core.study_table;").unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::MalformedResponse);
    }

    #[test]
    fn test_no_sql_is_malformed() {
        let err = extract_sql("I'm sorry, I can't help with that.").unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::MalformedResponse);
        let err = extract_sql("```\n\n```").unwrap_err();
        assert_eq!(err.kind, GenerationErrorKind::MalformedResponse);
        assert!(extract_sql("").is_err());
    }

    #[test]
    fn test_arbitrary_text_never_panics() {
        let inputs = [
            "```", "``````", ";;;", "'unterminated", "SELECT 'é;", "/* SELECT", "-- SELECT 1",
            "(((", "```sql", "\u{1F600} SELECT 1", "select\u{00A0}1",
        ];
        for input in inputs {
            if let Ok(sql) = extract_sql(input) {
                let kw = sql_guard::leading_keyword(&sql).unwrap();
                assert!(sql_guard::is_read_keyword(&kw), "{} -> {}", input, sql);
            }
        }
    }
}
