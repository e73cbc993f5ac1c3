//! Schema introspection models.
//!
//! Backend-neutral description of a database's tables, columns and indexes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::connection::DatabaseType;

/// A column in a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    /// Column name.
    pub name: String,
    /// Data type as reported by the backend (e.g., "integer", "varchar(255)").
    #[serde(rename = "type")]
    pub data_type: String,
    /// Whether the column allows NULL values.
    pub nullable: bool,
    /// Default value expression, if any.
    #[serde(default)]
    pub default_value: Option<String>,
    /// Column comment, if any.
    #[serde(default)]
    pub comment: Option<String>,
}

/// An index on a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    /// Index name.
    pub name: String,
    /// Indexed columns in key order.
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness.
    pub unique: bool,
}

/// A table with its columns, keys and indexes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableInfo {
    /// Table name.
    pub name: String,
    /// Columns in ordinal order.
    pub columns: Vec<ColumnInfo>,
    /// Primary key column names.
    #[serde(default)]
    pub primary_keys: Vec<String>,
    /// Indexes on the table.
    #[serde(default)]
    pub indexes: Vec<IndexInfo>,
    /// Row estimate from backend statistics.
    #[serde(default)]
    pub estimated_rows: Option<i64>,
}

impl TableInfo {
    /// Create a table with columns only.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnInfo>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_keys: Vec::new(),
            indexes: Vec::new(),
            estimated_rows: None,
        }
    }
}

/// Complete schema snapshot for one database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaInfo {
    /// Backend the snapshot was read from.
    pub database_type: DatabaseType,
    /// Database name.
    pub database_name: String,
    /// All tables.
    pub tables: Vec<TableInfo>,
    /// Server version string, if available.
    #[serde(default)]
    pub version: Option<String>,
}

impl SchemaInfo {
    /// Look up a table: exact name first, then a case-insensitive match.
    pub fn find_table(&self, name: &str) -> Option<&TableInfo> {
        self.tables
            .iter()
            .find(|t| t.name == name)
            .or_else(|| self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name)))
    }

    /// Table names in snapshot order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}

/// Schema cache configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchemaCacheConfig {
    /// Time-to-live in seconds.
    pub ttl_secs: u64,
    /// Whether caching is enabled at all.
    pub enabled: bool,
}

/// Default schema cache time-to-live (5 minutes).
pub const DEFAULT_SCHEMA_CACHE_TTL_SECS: u64 = 300;

impl Default for SchemaCacheConfig {
    fn default() -> Self {
        Self { ttl_secs: DEFAULT_SCHEMA_CACHE_TTL_SECS, enabled: true }
    }
}

/// Snapshot of schema cache state for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaCacheStats {
    /// Whether a snapshot is currently held.
    pub is_cached: bool,
    /// When the snapshot was loaded.
    pub cached_at: Option<DateTime<Utc>>,
    /// When the snapshot stops being served.
    pub expires_at: Option<DateTime<Utc>>,
    /// Requests served from the snapshot.
    pub hit_count: u64,
    /// Requests that went to the backend.
    pub miss_count: u64,
}

impl SchemaCacheStats {
    /// Hit rate as a percentage string with two decimals, e.g. "66.67%".
    pub fn hit_rate(&self) -> String {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            return "0.00%".to_string();
        }
        format!("{:.2}%", self.hit_count as f64 / total as f64 * 100.0)
    }
}
