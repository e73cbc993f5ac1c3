//! Database adapter capability and the backend registry.
//!
//! Every backend exposes the same small capability set through
//! [`DatabaseAdapter`]. Adapters are built from a [`ConnectionConfig`] by the
//! constructor registered for its [`DatabaseType`] in an [`AdapterRegistry`].

pub mod postgres;
pub mod sqlite;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{DbmuxError, DbmuxResult};
use crate::models::{ConnectionConfig, DatabaseType, QueryResult, SchemaInfo};
use crate::services::safety;

pub use postgres::PostgresAdapter;
pub use sqlite::SqliteAdapter;

/// Uniform capability a backend driver exposes.
///
/// Implementations must tolerate sequential use from many callers; queries on
/// one adapter are not serialized beyond what the adapter itself guarantees.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    /// Backend tag this adapter serves.
    fn database_type(&self) -> DatabaseType;

    /// Open the underlying connection.
    async fn connect(&self) -> DbmuxResult<()>;

    /// Close the underlying connection. Best effort; should not fail.
    async fn disconnect(&self) -> DbmuxResult<()>;

    /// Run one statement with positional parameters.
    async fn execute_query(&self, query: &str, params: &[Value]) -> DbmuxResult<QueryResult>;

    /// Read the schema, optionally restricted to the named tables.
    async fn get_schema(&self, tables: Option<&[String]>) -> DbmuxResult<SchemaInfo>;

    /// Classify a statement as mutating.
    fn is_write_operation(&self, query: &str) -> bool {
        safety::is_write_operation(query)
    }

    /// Cheap statement proving the connection is alive.
    fn probe_query(&self) -> &'static str {
        self.database_type().probe_query()
    }

    /// Start a transaction.
    async fn begin_transaction(&self) -> DbmuxResult<()> {
        Err(DbmuxError::unsupported("beginTransaction", self.database_type().as_str()))
    }

    /// Commit the current transaction.
    async fn commit(&self) -> DbmuxResult<()> {
        Err(DbmuxError::unsupported("commit", self.database_type().as_str()))
    }

    /// Roll back the current transaction.
    async fn rollback(&self) -> DbmuxResult<()> {
        Err(DbmuxError::unsupported("rollback", self.database_type().as_str()))
    }
}

/// Constructor registered for one backend tag.
pub type AdapterConstructor =
    Arc<dyn Fn(&ConnectionConfig) -> DbmuxResult<Arc<dyn DatabaseAdapter>> + Send + Sync>;

/// Maps backend tags to adapter constructors.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    constructors: HashMap<DatabaseType, AdapterConstructor>,
}

impl AdapterRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in adapters.
    ///
    /// PostgreSQL wire-compatible backends share [`PostgresAdapter`].
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for db_type in [
            DatabaseType::Postgres,
            DatabaseType::Kingbase,
            DatabaseType::Gaussdb,
            DatabaseType::Highgo,
            DatabaseType::Vastbase,
        ] {
            registry.register(db_type, |config| {
                Ok(Arc::new(PostgresAdapter::new(config.clone())) as Arc<dyn DatabaseAdapter>)
            });
        }
        registry.register(DatabaseType::Sqlite, |config| {
            Ok(Arc::new(SqliteAdapter::new(config.clone())?) as Arc<dyn DatabaseAdapter>)
        });
        registry
    }

    /// Register (or replace) the constructor for a backend tag.
    pub fn register<F>(&mut self, db_type: DatabaseType, constructor: F)
    where
        F: Fn(&ConnectionConfig) -> DbmuxResult<Arc<dyn DatabaseAdapter>> + Send + Sync + 'static,
    {
        self.constructors.insert(db_type, Arc::new(constructor));
    }

    /// Whether a constructor is registered for the tag.
    pub fn supports(&self, db_type: DatabaseType) -> bool {
        self.constructors.contains_key(&db_type)
    }

    /// Registered tags.
    pub fn supported_types(&self) -> Vec<DatabaseType> {
        let mut types: Vec<DatabaseType> = self.constructors.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    /// Build an unconnected adapter for the configuration.
    pub fn create(&self, config: &ConnectionConfig) -> DbmuxResult<Arc<dyn DatabaseAdapter>> {
        let constructor = self
            .constructors
            .get(&config.db_type)
            .ok_or_else(|| DbmuxError::UnsupportedBackend { db_type: config.db_type.to_string() })?;
        constructor(config)
    }
}

impl fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterRegistry").field("types", &self.supported_types()).finish()
    }
}
