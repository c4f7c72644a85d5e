//! Query result as returned to the orchestrator and the UI.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Rows,
    /// Query ran fine and matched nothing.
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names, in the order the service returned them
    pub columns: Vec<String>,

    /// One entry per row, aligned with `columns`
    pub rows: Vec<Vec<Value>>,

    /// Total matching rows as reported by the service (may exceed `rows.len()`)
    pub total_count: u64,

    pub status: ResultStatus,
}

impl QueryResult {
    /// Build from row objects, keeping first-seen key order.
    pub fn from_objects(objects: Vec<Map<String, Value>>, total_count: Option<u64>) -> Self {
        let mut columns: Vec<String> = Vec::new();
        for object in &objects {
            for key in object.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }

        let rows: Vec<Vec<Value>> = objects
            .iter()
            .map(|object| {
                columns
                    .iter()
                    .map(|c| object.get(c).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect();

        let total_count = total_count.unwrap_or(rows.len() as u64).max(rows.len() as u64);
        let status = if rows.is_empty() {
            ResultStatus::Empty
        } else {
            ResultStatus::Rows
        };

        Self {
            columns,
            rows,
            total_count,
            status,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status == ResultStatus::Empty
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Row `idx` as a column → value object.
    pub fn row_object(&self, idx: usize) -> Option<Map<String, Value>> {
        self.rows.get(idx).map(|row| {
            self.columns
                .iter()
                .cloned()
                .zip(row.iter().cloned())
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_columns_keep_service_order() {
        let result = QueryResult::from_objects(
            vec![
                object(json!({"ecosystem_type": "Soil", "count": 20})),
                object(json!({"ecosystem_type": "Aquatic", "count": 12, "extra": true})),
            ],
            Some(5),
        );
        assert_eq!(result.columns, vec!["ecosystem_type", "count", "extra"]);
        assert_eq!(result.rows[0], vec![json!("Soil"), json!(20), Value::Null]);
        assert_eq!(result.total_count, 5);
        assert_eq!(result.status, ResultStatus::Rows);
    }

    #[test]
    fn test_zero_rows_is_empty_status() {
        let result = QueryResult::from_objects(Vec::new(), None);
        assert!(result.is_empty());
        assert_eq!(result.total_count, 0);
        assert!(result.row_object(0).is_none());
    }

    #[test]
    fn test_row_object_round_trips_names() {
        let result = QueryResult::from_objects(vec![object(json!({"kingdom": "Bacteria"}))], None);
        let row = result.row_object(0).unwrap();
        assert_eq!(row.get("kingdom"), Some(&json!("Bacteria")));
    }
}
