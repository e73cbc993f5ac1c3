//! Schema cache.
//!
//! Memoizes one adapter's schema snapshot with a time-to-live. A snapshot is
//! replaced only by a successful fetch; a failed refresh leaves the previous
//! snapshot in place.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::adapters::DatabaseAdapter;
use crate::error::{DbmuxError, DbmuxResult};
use crate::models::{SchemaCacheConfig, SchemaCacheStats, SchemaInfo, TableInfo};

#[derive(Debug)]
struct Snapshot {
    schema: Arc<SchemaInfo>,
    loaded_at: Instant,
    cached_at: DateTime<Utc>,
}

#[derive(Debug)]
struct CacheState {
    snapshot: Option<Snapshot>,
    ttl: Duration,
    enabled: bool,
    hit_count: u64,
    miss_count: u64,
}

impl CacheState {
    fn fresh_snapshot(&self) -> Option<Arc<SchemaInfo>> {
        if !self.enabled {
            return None;
        }
        self.snapshot
            .as_ref()
            .filter(|s| s.loaded_at.elapsed() < self.ttl)
            .map(|s| Arc::clone(&s.schema))
    }
}

/// Schema cache for one connection.
pub struct SchemaCache {
    adapter: Arc<dyn DatabaseAdapter>,
    state: Mutex<CacheState>,
}

impl SchemaCache {
    /// Create an empty cache over the adapter.
    pub fn new(adapter: Arc<dyn DatabaseAdapter>, config: SchemaCacheConfig) -> Self {
        Self {
            adapter,
            state: Mutex::new(CacheState {
                snapshot: None,
                ttl: Duration::from_secs(config.ttl_secs),
                enabled: config.enabled,
                hit_count: 0,
                miss_count: 0,
            }),
        }
    }

    /// Override the time-to-live with sub-second precision.
    pub fn with_ttl(self, ttl: Duration) -> Self {
        self.state.lock().ttl = ttl;
        self
    }

    /// Get the schema, serving the snapshot while it is fresh.
    pub async fn get_schema(&self, force_refresh: bool) -> DbmuxResult<Arc<SchemaInfo>> {
        {
            let mut state = self.state.lock();
            if !force_refresh {
                if let Some(schema) = state.fresh_snapshot() {
                    state.hit_count += 1;
                    return Ok(schema);
                }
            }
            state.miss_count += 1;
        }

        tracing::debug!(
            db_type = %self.adapter.database_type(),
            force_refresh,
            "Fetching schema from database"
        );
        let started = std::time::Instant::now();
        let schema = match self.adapter.get_schema(None).await {
            Ok(schema) => Arc::new(schema),
            Err(e) => {
                tracing::warn!(db_type = %self.adapter.database_type(), error = %e, "Schema fetch failed");
                return Err(e);
            }
        };

        let mut state = self.state.lock();
        if state.enabled {
            state.snapshot = Some(Snapshot {
                schema: Arc::clone(&schema),
                loaded_at: Instant::now(),
                cached_at: Utc::now(),
            });
        }
        tracing::debug!(
            tables = schema.tables.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Schema cached"
        );
        Ok(schema)
    }

    /// Look up one table: exact name first, then case-insensitive.
    pub async fn get_table_info(&self, name: &str, force_refresh: bool) -> DbmuxResult<TableInfo> {
        let schema = self.get_schema(force_refresh).await?;
        schema.find_table(name).cloned().ok_or_else(|| DbmuxError::table_not_found(name))
    }

    /// Table names from the schema.
    pub async fn list_tables(&self, force_refresh: bool) -> DbmuxResult<Vec<String>> {
        Ok(self.get_schema(force_refresh).await?.table_names())
    }

    /// Drop the snapshot. Hit and miss counters are kept.
    pub fn clear(&self) {
        self.state.lock().snapshot = None;
        tracing::debug!(db_type = %self.adapter.database_type(), "Schema cache cleared");
    }

    /// Whether a snapshot is currently held, fresh or not.
    pub fn is_cached(&self) -> bool {
        self.state.lock().snapshot.is_some()
    }

    /// Current cache statistics.
    pub fn stats(&self) -> SchemaCacheStats {
        let state = self.state.lock();
        let cached_at = state.snapshot.as_ref().map(|s| s.cached_at);
        let ttl = chrono::Duration::from_std(state.ttl).unwrap_or(chrono::Duration::MAX);
        SchemaCacheStats {
            is_cached: state.snapshot.is_some(),
            cached_at,
            expires_at: cached_at.and_then(|at| at.checked_add_signed(ttl)),
            hit_count: state.hit_count,
            miss_count: state.miss_count,
        }
    }

    /// Hit rate as a percentage string, e.g. "75.00%".
    pub fn hit_rate(&self) -> String {
        self.stats().hit_rate()
    }

    /// Current configuration.
    pub fn config(&self) -> SchemaCacheConfig {
        let state = self.state.lock();
        SchemaCacheConfig { ttl_secs: state.ttl.as_secs(), enabled: state.enabled }
    }

    /// Change time-to-live and enablement. The snapshot is kept.
    pub fn update_config(&self, config: SchemaCacheConfig) {
        let mut state = self.state.lock();
        state.ttl = Duration::from_secs(config.ttl_secs);
        state.enabled = config.enabled;
        tracing::debug!(ttl_secs = config.ttl_secs, enabled = config.enabled, "Schema cache config updated");
    }
}

impl std::fmt::Debug for SchemaCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaCache")
            .field("db_type", &self.adapter.database_type())
            .field("stats", &self.stats())
            .finish()
    }
}
