//! Per-connection facade: safety gate, adapter and schema cache.

use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::adapters::DatabaseAdapter;
use crate::error::DbmuxResult;
use crate::models::{DatabaseType, QueryResult, SchemaCacheConfig, SchemaCacheStats, SchemaInfo, TableInfo};
use crate::services::safety::QueryGuard;
use crate::services::schema::SchemaCache;

/// Query and schema operations for one open adapter.
pub struct DatabaseService {
    adapter: Arc<dyn DatabaseAdapter>,
    cache: SchemaCache,
    guard: Arc<QueryGuard>,
    allow_write: bool,
}

impl DatabaseService {
    /// Wrap an open adapter.
    pub fn new(
        adapter: Arc<dyn DatabaseAdapter>,
        guard: Arc<QueryGuard>,
        allow_write: bool,
        cache_config: SchemaCacheConfig,
    ) -> Self {
        let cache = SchemaCache::new(Arc::clone(&adapter), cache_config);
        Self { adapter, cache, guard, allow_write }
    }

    /// The wrapped adapter.
    pub fn adapter(&self) -> &Arc<dyn DatabaseAdapter> {
        &self.adapter
    }

    /// Backend tag.
    pub fn database_type(&self) -> DatabaseType {
        self.adapter.database_type()
    }

    /// Whether write statements pass the safety gate.
    pub fn allow_write(&self) -> bool {
        self.allow_write
    }

    /// Run a statement after it passes the safety gate.
    pub async fn execute_query(&self, query: &str, params: &[Value]) -> DbmuxResult<QueryResult> {
        self.guard.validate_query(query, self.allow_write)?;

        if self.allow_write {
            if let Some(pattern) = self.guard.detect_dangerous_pattern(query) {
                tracing::warn!(
                    db_type = %self.adapter.database_type(),
                    pattern = %pattern,
                    "Executing dangerous statement with writes enabled"
                );
            }
        }

        let started = Instant::now();
        let result = self.adapter.execute_query(query, params).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(result) => {
                tracing::debug!(
                    db_type = %self.adapter.database_type(),
                    rows = result.row_count(),
                    elapsed_ms,
                    "Query completed"
                );
                if result.execution_time_ms.is_none() {
                    return Ok(result.timed(elapsed_ms));
                }
                Ok(result)
            }
            Err(e) => {
                tracing::warn!(db_type = %self.adapter.database_type(), elapsed_ms, error = %e, "Query failed");
                Err(e)
            }
        }
    }

    /// Schema, served from the cache while fresh.
    pub async fn get_schema(&self, force_refresh: bool) -> DbmuxResult<Arc<SchemaInfo>> {
        self.cache.get_schema(force_refresh).await
    }

    /// One table's structure.
    pub async fn get_table_info(&self, name: &str, force_refresh: bool) -> DbmuxResult<TableInfo> {
        self.cache.get_table_info(name, force_refresh).await
    }

    /// Table names.
    pub async fn list_tables(&self, force_refresh: bool) -> DbmuxResult<Vec<String>> {
        self.cache.list_tables(force_refresh).await
    }

    /// Run the backend's probe statement and return the round trip in
    /// milliseconds. The probe bypasses the safety gate.
    pub async fn test_connection(&self) -> DbmuxResult<u64> {
        let started = Instant::now();
        self.adapter.execute_query(self.adapter.probe_query(), &[]).await?;
        Ok(started.elapsed().as_millis() as u64)
    }

    /// Drop the cached schema.
    pub fn clear_schema_cache(&self) {
        self.cache.clear();
    }

    /// Schema cache statistics.
    pub fn cache_stats(&self) -> SchemaCacheStats {
        self.cache.stats()
    }

    /// Schema cache hit rate, e.g. "50.00%".
    pub fn cache_hit_rate(&self) -> String {
        self.cache.hit_rate()
    }

    /// Change schema cache settings.
    pub fn update_cache_config(&self, config: SchemaCacheConfig) {
        self.cache.update_config(config);
    }
}

impl std::fmt::Debug for DatabaseService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseService")
            .field("db_type", &self.adapter.database_type())
            .field("allow_write", &self.allow_write)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbmuxError;
    use crate::testing::MockAdapter;

    fn service(adapter: &Arc<MockAdapter>, allow_write: bool) -> DatabaseService {
        DatabaseService::new(
            adapter.clone(),
            Arc::new(QueryGuard::default()),
            allow_write,
            SchemaCacheConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_read_passes_gate() {
        let adapter = MockAdapter::with_tables(&["users"]);
        let service = service(&adapter, false);

        let result = service.execute_query("SELECT * FROM users", &[]).await.unwrap();
        assert_eq!(result.row_count(), 1);
        assert!(result.execution_time_ms.is_some());
        assert_eq!(adapter.queries(), vec!["SELECT * FROM users"]);
    }

    #[tokio::test]
    async fn test_blocked_write_never_reaches_adapter() {
        let adapter = MockAdapter::with_tables(&["users"]);
        let service = service(&adapter, false);

        let err = service.execute_query("DELETE FROM users", &[]).await.unwrap_err();
        assert!(matches!(err, DbmuxError::WriteBlocked { ref keyword, .. } if keyword == "DELETE"));
        assert!(adapter.queries().is_empty());
    }

    #[tokio::test]
    async fn test_write_allowed() {
        let adapter = MockAdapter::with_tables(&["users"]);
        let service = service(&adapter, true);

        service.execute_query("DROP TABLE users", &[]).await.unwrap();
        assert_eq!(adapter.queries().len(), 1);
    }

    #[tokio::test]
    async fn test_whitelisted_ddl_passes_read_only_gate() {
        let adapter = MockAdapter::with_tables(&["users"]);
        let guard = Arc::new(QueryGuard::new(&["^CREATE INDEX".to_string()]));
        let service =
            DatabaseService::new(adapter.clone(), guard, false, SchemaCacheConfig::default());

        service.execute_query("create index idx_email on users(email)", &[]).await.unwrap();
        assert!(service.execute_query("CREATE TABLE t (id int)", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_probe_and_schema() {
        let adapter = MockAdapter::with_tables(&["users", "orders"]);
        let service = service(&adapter, false);

        service.test_connection().await.unwrap();
        assert_eq!(adapter.queries(), vec!["SELECT 1"]);

        assert_eq!(service.list_tables(false).await.unwrap(), vec!["users", "orders"]);
        assert_eq!(service.get_table_info("orders", false).await.unwrap().name, "orders");
        assert_eq!(adapter.schema_calls(), 1);

        service.clear_schema_cache();
        service.get_schema(false).await.unwrap();
        assert_eq!(adapter.schema_calls(), 2);
        assert_eq!(service.cache_stats().miss_count, 2);
    }

    #[tokio::test]
    async fn test_probe_failure_propagates() {
        let adapter = MockAdapter::with_tables(&["users"]);
        adapter.fail_query(true);
        let service = service(&adapter, false);
        assert!(service.test_connection().await.is_err());
    }
}
