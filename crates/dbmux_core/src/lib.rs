//! Core of dbmux, a multi-backend database access layer.
//!
//! This crate provides the session, pooling, tunneling, schema caching and
//! query safety layer that front-ends call into:
//!
//! - **error**: Error taxonomy with categories and operator hints
//! - **models**: Connection, schema, query result and status types
//! - **adapters**: The backend capability trait, registry and built-in adapters
//! - **services**: Safety gate, schema cache, SSH tunnels, pool, sessions
//! - **config**: Configuration loading and the named-connection catalog
//! - **state**: The shared context object
//! - **logging**: Structured logging setup

pub mod adapters;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;
pub mod state;

#[cfg(test)]
mod testing;

pub use adapters::{AdapterRegistry, DatabaseAdapter};
pub use config::{ConnectionCatalog, DbmuxConfig, SessionSettings, Settings};
pub use error::{DbmuxError, DbmuxResult, ErrorInfo};
pub use models::{
    ColumnInfo, ColumnMeta, ConnectionConfig, ConnectionSummary, DatabaseType, EntryState,
    HealthStatus, IndexInfo, NamedConnection, PoolStatus, QueryResult, Row, SchemaCacheConfig,
    SchemaCacheStats, SchemaInfo, SessionInfo, SshConfig, TableInfo, TunnelInfo,
};
pub use services::{
    ConnectionPool, DatabaseService, QueryGuard, SchemaCache, SessionManager, TunnelManager,
};
pub use state::DbmuxState;
