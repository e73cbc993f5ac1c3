//! Query execution models.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One result row keyed by column name.
pub type Row = Map<String, Value>;

/// Column metadata from query results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMeta {
    /// Column name
    pub name: String,
    /// Backend type name
    pub type_name: String,
}

/// Results from query execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    /// Column metadata, in result order
    #[serde(default)]
    pub columns: Vec<ColumnMeta>,
    /// Result rows
    pub rows: Vec<Row>,
    /// Rows affected (for INSERT/UPDATE/DELETE)
    #[serde(default)]
    pub affected_rows: Option<u64>,
    /// Time to execute in milliseconds
    #[serde(default)]
    pub execution_time_ms: Option<u64>,
    /// Backend-specific extras
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl QueryResult {
    /// Result of a statement that returned rows.
    pub fn with_rows(columns: Vec<ColumnMeta>, rows: Vec<Row>) -> Self {
        Self { columns, rows, ..Default::default() }
    }

    /// Result of a statement that only reports affected rows.
    pub fn affected(count: u64) -> Self {
        Self { affected_rows: Some(count), ..Default::default() }
    }

    /// Set the execution time.
    pub fn timed(mut self, elapsed_ms: u64) -> Self {
        self.execution_time_ms = Some(elapsed_ms);
        self
    }

    /// Get the number of rows returned.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Get column names.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}
