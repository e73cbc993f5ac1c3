//! Data models for dbmux.
//!
//! This module contains all core data structures:
//! - `connection` - DatabaseType, ConnectionConfig, SshConfig, NamedConnection
//! - `query` - QueryResult, Row, ColumnMeta
//! - `schema` - Schema snapshot and cache statistics
//! - `status` - Health, pool, session and tunnel reports

pub mod connection;
pub mod query;
pub mod schema;
pub mod status;

pub use connection::{
    ConnectionConfig, ConnectionSummary, DatabaseType, NamedConnection, SshConfig,
};
pub use query::{ColumnMeta, QueryResult, Row};
pub use schema::{
    ColumnInfo, IndexInfo, SchemaCacheConfig, SchemaCacheStats, SchemaInfo, TableInfo,
};
pub use status::{EntryState, HealthStatus, PoolStatus, SessionInfo, TunnelInfo};
