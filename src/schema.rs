//! Schema Context
//!
//! Hand-maintained description of the `nmdc_core` tables exposed by the
//! lakehouse. It grounds every prompt and backs the executor's table check.

use serde::{Deserialize, Serialize};

pub const DATABASE: &str = "nmdc_core";

/// Questions offered to users as one-click prompts.
pub const EXAMPLE_QUESTIONS: [&str; 4] = [
    "How many samples have plastic degradation?",
    "What kingdoms are in the taxonomy?",
    "Show samples with methanogenesis",
    "Count studies by ecosystem type",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Identifier,
    Text,
    Category,
    Numeric,
    /// 0 = absent, >0 = present/abundance.
    Abundance,
}

impl SemanticType {
    fn label(&self) -> &'static str {
        match self {
            SemanticType::Identifier => "identifier",
            SemanticType::Text => "string",
            SemanticType::Category => "category",
            SemanticType::Numeric => "numeric",
            SemanticType::Abundance => "numeric abundance",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub semantic_type: SemanticType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<String>,
}

impl ColumnSchema {
    fn new(name: &str, semantic_type: SemanticType) -> Self {
        Self {
            name: name.to_string(),
            semantic_type,
            examples: Vec::new(),
        }
    }

    fn with_examples(mut self, examples: &[&str]) -> Self {
        self.examples = examples.iter().map(|e| e.to_string()).collect();
        self
    }

    /// Name as it must appear in SQL.
    pub fn sql_name(&self) -> String {
        if self.name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            self.name.clone()
        } else {
            format!("\"{}\"", self.name)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub name: String,
    pub description: String,
    pub columns: Vec<ColumnSchema>,
    /// Columns that exist but are too many to list individually.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_note: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approx_row_count: Option<u64>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDescription {
    pub database: String,
    pub tables: Vec<TableSchema>,
    pub rules: Vec<String>,
}

impl SchemaDescription {
    /// Look up a table by bare or `database.table` name, ignoring case.
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        let bare = match name.rsplit_once('.') {
            Some((db, table)) if db.eq_ignore_ascii_case(&self.database) => table,
            Some(_) => return None,
            None => name,
        };
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(bare))
    }

    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Grounding text embedded in the generator's system prompt.
    pub fn render_prompt(&self) -> String {
        let mut out = format!(
            "You are a SQL assistant for the BERDL Data Lakehouse (NMDC microbiome data).\n\n\
             Available database: {}\n\nKey tables and their columns:\n",
            self.database
        );

        for (idx, table) in self.tables.iter().enumerate() {
            let rows = table
                .approx_row_count
                .map(|n| format!(" (~{} rows)", n))
                .unwrap_or_default();
            out.push_str(&format!(
                "\n{}. {}.{} - {}{}\n",
                idx + 1,
                self.database,
                table.name,
                table.description,
                rows
            ));
            for column in &table.columns {
                out.push_str(&format!("   - {} ({})", column.sql_name(), column.semantic_type.label()));
                if !column.examples.is_empty() {
                    out.push_str(&format!(", e.g. {}", column.examples.join(", ")));
                }
                out.push('\n');
            }
            if let Some(note) = &table.column_note {
                out.push_str(&format!("   - {}\n", note));
            }
        }

        out.push_str("\nRules:\n");
        for rule in &self.rules {
            out.push_str(&format!("- {}\n", rule));
        }
        out
    }
}

/// The static schema for `nmdc_core`.
pub fn describe() -> SchemaDescription {
    use SemanticType::*;

    let tables = vec![
        TableSchema {
            name: "trait_features".to_string(),
            description: "Predicted microbial traits per sample".to_string(),
            columns: vec![
                ColumnSchema::new("sample_id", Identifier),
                ColumnSchema::new("functional_group:plastic_degradation", Abundance),
                ColumnSchema::new("functional_group:methanogenesis", Abundance),
                ColumnSchema::new("functional_group:nitrogen_fixation", Abundance),
                ColumnSchema::new("functional_group:oil_bioremediation", Abundance),
                ColumnSchema::new("functional_group:human_pathogens_all", Abundance),
                ColumnSchema::new("functional_group:cellulolysis", Abundance),
            ],
            column_note: Some(
                "90+ further \"functional_group:<trait>\" columns; values are numeric (0 = absent, >0 = present/abundance)"
                    .to_string(),
            ),
            approx_row_count: None,
        },
        TableSchema {
            name: "abiotic_features".to_string(),
            description: "Environmental measurements per sample".to_string(),
            columns: vec![
                ColumnSchema::new("sample_id", Identifier),
                ColumnSchema::new("annotations_ph", Numeric),
                ColumnSchema::new("annotations_temp_has_numeric_value", Numeric),
                ColumnSchema::new("annotations_depth_has_numeric_value", Numeric),
                ColumnSchema::new("annotations_tot_org_carb_has_numeric_value", Numeric),
            ],
            column_note: Some("further annotations_* measurement columns".to_string()),
            approx_row_count: None,
        },
        TableSchema {
            name: "taxonomy_dim".to_string(),
            description: "Taxonomy hierarchy".to_string(),
            columns: vec![
                ColumnSchema::new("taxid", Identifier),
                ColumnSchema::new("kingdom", Category).with_examples(&["Bacteria", "Archaea"]),
                ColumnSchema::new("phylum", Category).with_examples(&["Proteobacteria"]),
                ColumnSchema::new("class", Category),
                ColumnSchema::new("order", Category),
                ColumnSchema::new("family", Category),
                ColumnSchema::new("genus", Category),
                ColumnSchema::new("species", Text),
            ],
            column_note: None,
            approx_row_count: Some(2_600_000),
        },
        TableSchema {
            name: "study_table".to_string(),
            description: "Study metadata".to_string(),
            columns: vec![
                ColumnSchema::new("study_id", Identifier),
                ColumnSchema::new("name", Text),
                ColumnSchema::new("ecosystem", Category).with_examples(&["Environmental"]),
                ColumnSchema::new("ecosystem_type", Category).with_examples(&["Soil", "Aquatic"]),
                ColumnSchema::new("ecosystem_subtype", Category),
            ],
            column_note: None,
            approx_row_count: Some(48),
        },
        TableSchema {
            name: "cog_categories".to_string(),
            description: "COG functional categories".to_string(),
            columns: vec![
                ColumnSchema::new("cog_id", Identifier),
                ColumnSchema::new("category_code", Category).with_examples(&["J", "K"]),
                ColumnSchema::new("category_name", Text),
                ColumnSchema::new("description", Text),
            ],
            column_note: None,
            approx_row_count: None,
        },
    ];

    SchemaDescription {
        database: DATABASE.to_string(),
        tables,
        rules: vec![
            format!("Always use fully qualified table names: {}.table_name", DATABASE),
            "Columns with special characters need quotes: \"functional_group:plastic_degradation\"".to_string(),
            "Only write read-only SELECT queries".to_string(),
            "Keep queries simple and limit results (LIMIT 20 unless user asks for more)".to_string(),
            "Return ONLY the SQL query, no explanation, no markdown code blocks".to_string(),
        ],
    }
}
