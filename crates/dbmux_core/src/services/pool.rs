//! Connection pool for named connections.
//!
//! One tunnel and one connected adapter per configured name. Concurrent
//! requests for a name that is still connecting wait on the same creation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures_util::future::{join_all, FutureExt};

use crate::adapters::{AdapterRegistry, DatabaseAdapter};
use crate::config::ConnectionCatalog;
use crate::error::{DbmuxError, DbmuxResult};
use crate::models::{
    ConnectionSummary, DatabaseType, EntryState, HealthStatus, NamedConnection, PoolStatus,
    SchemaCacheConfig, TunnelInfo,
};
use crate::services::database::DatabaseService;
use crate::services::safety::QueryGuard;
use crate::services::singleflight::{SingleFlight, SlotState};
use crate::services::ssh_tunnel::TunnelManager;

/// A connected pool entry.
#[derive(Debug)]
pub struct PoolEntry {
    /// Connection name
    pub name: String,
    /// Backend tag
    pub db_type: DatabaseType,
    /// Service over the connected adapter
    pub service: Arc<DatabaseService>,
    /// Local tunnel port, when tunneled
    pub local_port: Option<u16>,
    /// When the adapter connected
    pub connected_at: DateTime<Utc>,
}

impl PoolEntry {
    async fn teardown(&self) {
        self.service.clear_schema_cache();
        if let Err(e) = self.service.adapter().disconnect().await {
            tracing::warn!(connection = %self.name, error = %e, "Disconnect failed");
        }
    }

    /// Disconnect, then close the tunnel this entry was opened through.
    async fn teardown_with_tunnel(&self, tunnels: &TunnelManager) {
        self.teardown().await;
        if let Some(port) = self.local_port {
            tunnels.close_tunnel_on_port(&self.name, port).await;
        }
    }
}

/// Everything a creation task needs, cloned out of the pool.
#[derive(Clone)]
struct EntryFactory {
    registry: Arc<AdapterRegistry>,
    tunnels: Arc<TunnelManager>,
    guard: Arc<QueryGuard>,
    allow_write: bool,
    cache_config: SchemaCacheConfig,
}

impl EntryFactory {
    async fn open(self, named: NamedConnection) -> DbmuxResult<Arc<PoolEntry>> {
        let name = named.name.clone();
        let config = &named.config;

        let local_port = match config.active_ssh() {
            Some(ssh) => {
                let remote_port = config.port_or_default().ok_or_else(|| {
                    DbmuxError::config(format!("Connection '{name}' needs a port to tunnel to"))
                })?;
                Some(
                    self.tunnels
                        .create_tunnel(&name, ssh, config.host_or_default(), remote_port)
                        .await?,
                )
            }
            None => None,
        };

        let mut effective = match local_port {
            Some(port) => config.through_tunnel(port),
            None => config.clone(),
        };
        effective.allow_write = self.allow_write;

        let connected = async {
            let adapter = self.registry.create(&effective)?;
            adapter.connect().await?;
            Ok::<Arc<dyn DatabaseAdapter>, DbmuxError>(adapter)
        }
        .await;

        let adapter = match connected {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::warn!(connection = %name, error = %e, "Connection failed");
                if let Some(port) = local_port {
                    self.tunnels.close_tunnel_on_port(&name, port).await;
                }
                return Err(e);
            }
        };

        tracing::info!(
            connection = %name,
            db_type = %config.db_type,
            tunneled = local_port.is_some(),
            "Connection established"
        );

        Ok(Arc::new(PoolEntry {
            name,
            db_type: config.db_type,
            service: Arc::new(DatabaseService::new(
                adapter,
                self.guard,
                self.allow_write,
                self.cache_config,
            )),
            local_port,
            connected_at: Utc::now(),
        }))
    }
}

/// Pool of connected adapters keyed by connection name.
pub struct ConnectionPool {
    catalog: Arc<ConnectionCatalog>,
    factory: EntryFactory,
    entries: SingleFlight<Arc<PoolEntry>>,
}

impl ConnectionPool {
    /// Create an empty pool.
    pub fn new(
        catalog: Arc<ConnectionCatalog>,
        registry: Arc<AdapterRegistry>,
        tunnels: Arc<TunnelManager>,
        guard: Arc<QueryGuard>,
        allow_write: bool,
        cache_config: SchemaCacheConfig,
    ) -> Self {
        // An entry finished after close_all still owns the tunnel it opened.
        let discard_tunnels = Arc::clone(&tunnels);
        Self {
            catalog,
            factory: EntryFactory { registry, tunnels, guard, allow_write, cache_config },
            entries: SingleFlight::new(Arc::new(move |entry: Arc<PoolEntry>| {
                let tunnels = Arc::clone(&discard_tunnels);
                async move { entry.teardown_with_tunnel(&tunnels).await }.boxed()
            })),
        }
    }

    /// The connection catalog.
    pub fn catalog(&self) -> &Arc<ConnectionCatalog> {
        &self.catalog
    }

    /// Get the service for `name` (or the current connection), connecting
    /// on first use.
    pub async fn get_service(&self, name: Option<&str>) -> DbmuxResult<Arc<DatabaseService>> {
        let named = self.catalog.resolve(name)?.clone();
        let key = named.name.clone();
        let factory = self.factory.clone();

        let entry = self.entries.get_or_create(&key, move || factory.open(named)).await?;
        Ok(Arc::clone(&entry.service))
    }

    /// Get the adapter for `name` (or the current connection).
    pub async fn get_adapter(&self, name: Option<&str>) -> DbmuxResult<Arc<dyn DatabaseAdapter>> {
        Ok(Arc::clone(self.get_service(name).await?.adapter()))
    }

    /// The live entry for `name`, without connecting.
    pub fn entry(&self, name: &str) -> Option<Arc<PoolEntry>> {
        self.entries.get(name)
    }

    /// Disconnect and remove the entry for `name`, then close its tunnel.
    /// No-op when the name has no live entry.
    pub async fn close_connection(&self, name: &str) {
        let Some(entry) = self.entries.remove(name) else {
            return;
        };
        entry.teardown_with_tunnel(&self.factory.tunnels).await;
        tracing::info!(connection = %name, "Connection closed");
    }

    /// Close every entry concurrently, then every tunnel owned by a
    /// configured name. Session tunnels are left alone. Entries still
    /// connecting are torn down, tunnel included, when they finish.
    pub async fn close_all(&self) {
        let entries = self.entries.drain();
        if !entries.is_empty() {
            tracing::info!(count = entries.len(), "Closing all pooled connections");
        }
        let tunnels = &self.factory.tunnels;
        join_all(entries.iter().map(|(_, entry)| entry.teardown_with_tunnel(tunnels))).await;

        join_all(
            self.catalog
                .connections()
                .iter()
                .filter(|named| named.config.active_ssh().is_some())
                .map(|named| tunnels.close_tunnel(&named.name)),
        )
        .await;
    }

    /// Probe every configured connection in turn.
    pub async fn health_check(&self) -> Vec<HealthStatus> {
        let mut results = Vec::with_capacity(self.catalog.connections().len());
        for named in self.catalog.connections() {
            let status = match self.probe(&named.name).await {
                Ok(elapsed_ms) => healthy(named, elapsed_ms),
                Err(e) => unhealthy(named, &e),
            };
            if !status.connected {
                tracing::warn!(connection = %named.name, error = ?status.error, "Health check failed");
            }
            results.push(status);
        }
        results
    }

    /// Reconnect `name` from scratch, retrying with exponential backoff
    /// (`base_delay * 2^attempt`). Returns the final probe status.
    pub async fn test_connection_with_retry(
        &self,
        name: &str,
        max_retries: u32,
        base_delay: Duration,
    ) -> DbmuxResult<HealthStatus> {
        let named = self.catalog.get(name)?.clone();
        self.close_connection(name).await;

        let attempts = max_retries.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            match self.probe(name).await {
                Ok(elapsed_ms) => {
                    tracing::info!(connection = %name, attempt = attempt + 1, "Connection test succeeded");
                    return Ok(healthy(&named, elapsed_ms));
                }
                Err(e) => {
                    tracing::warn!(
                        connection = %name,
                        attempt = attempt + 1,
                        max_retries = attempts,
                        error = %e,
                        "Connection test failed"
                    );
                    self.close_connection(name).await;
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(base_delay.saturating_mul(2u32.saturating_pow(attempt)))
                            .await;
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| DbmuxError::internal("No connection attempt was made"));
        Ok(unhealthy(&named, &error))
    }

    async fn probe(&self, name: &str) -> DbmuxResult<u64> {
        let started = Instant::now();
        let service = self.get_service(Some(name)).await?;
        service.test_connection().await?;
        Ok(started.elapsed().as_millis() as u64)
    }

    /// State of every configured connection.
    pub fn pool_status(&self) -> Vec<PoolStatus> {
        let current = self.catalog.current_name();
        self.catalog
            .connections()
            .iter()
            .map(|named| PoolStatus {
                name: named.name.clone(),
                db_type: named.config.db_type,
                state: match self.entries.state(&named.name) {
                    Some(SlotState::Ready) => EntryState::Connected,
                    Some(SlotState::Pending) => EntryState::Connecting,
                    None => EntryState::Idle,
                },
                tunneled: named.config.active_ssh().is_some(),
                is_current: named.name == current,
            })
            .collect()
    }

    /// Number of connected entries.
    pub fn connected_count(&self) -> usize {
        self.entries.ready_count()
    }

    /// Point the current connection at `name`.
    pub fn switch_database(&self, name: &str) -> DbmuxResult<()> {
        self.catalog.switch_database(name)
    }

    /// Summaries of every configured connection.
    pub fn list_databases(&self) -> Vec<ConnectionSummary> {
        self.catalog.list_databases()
    }

    /// All live tunnels.
    pub fn list_tunnels(&self) -> Vec<TunnelInfo> {
        self.factory.tunnels.list_tunnels()
    }

    /// Tunnel status for `name`.
    pub fn get_tunnel_status(&self, name: &str) -> Option<TunnelInfo> {
        self.factory.tunnels.tunnel_status(name)
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.catalog.names())
            .field("connected", &self.connected_count())
            .finish()
    }
}

fn healthy(named: &NamedConnection, elapsed_ms: u64) -> HealthStatus {
    HealthStatus {
        name: named.name.clone(),
        db_type: named.config.db_type,
        connected: true,
        response_time_ms: Some(elapsed_ms),
        last_checked: Utc::now(),
        error: None,
    }
}

fn unhealthy(named: &NamedConnection, error: &DbmuxError) -> HealthStatus {
    HealthStatus {
        name: named.name.clone(),
        db_type: named.config.db_type,
        connected: false,
        response_time_ms: None,
        last_checked: Utc::now(),
        error: Some(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConnectionConfig, SshConfig};
    use crate::testing::{MockBackend, MockSshConnector};

    struct Fixture {
        pool: Arc<ConnectionPool>,
        backend: Arc<MockBackend>,
        ssh: Arc<MockSshConnector>,
    }

    fn fixture(connections: Vec<NamedConnection>) -> Fixture {
        let backend = MockBackend::new();
        let ssh = MockSshConnector::new();
        let pool = ConnectionPool::new(
            Arc::new(ConnectionCatalog::new(connections).unwrap()),
            Arc::new(backend.registry()),
            Arc::new(TunnelManager::new(ssh.clone())),
            Arc::new(QueryGuard::default()),
            false,
            SchemaCacheConfig::default(),
        );
        Fixture { pool: Arc::new(pool), backend, ssh }
    }

    fn pg(name: &str) -> NamedConnection {
        NamedConnection::new(
            name,
            ConnectionConfig::new(DatabaseType::Postgres).with_endpoint("db.internal", 5432),
        )
    }

    fn tunneled(name: &str) -> NamedConnection {
        let mut named = pg(name);
        named.config.ssh = Some(SshConfig::new("bastion", "ops").with_password("pw"));
        named
    }

    #[tokio::test]
    async fn test_concurrent_get_adapter_connects_once() {
        let fx = fixture(vec![pg("main")]);
        fx.backend.set_connect_delay(Duration::from_millis(30));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let pool = fx.pool.clone();
            handles.push(tokio::spawn(async move { pool.get_adapter(Some("main")).await }));
        }
        let mut adapters = Vec::new();
        for handle in handles {
            adapters.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(fx.backend.total_connects(), 1);
        assert!(adapters.iter().all(|a| Arc::ptr_eq(a, &adapters[0])));
    }

    #[tokio::test]
    async fn test_omitted_name_uses_current_connection() {
        let fx = fixture(vec![pg("a"), pg("b").as_default()]);

        fx.pool.get_service(None).await.unwrap();
        assert!(fx.pool.entry("b").is_some());
        assert!(fx.pool.entry("a").is_none());

        fx.pool.switch_database("a").unwrap();
        fx.pool.get_service(None).await.unwrap();
        assert_eq!(fx.pool.connected_count(), 2);
    }

    #[tokio::test]
    async fn test_unknown_name() {
        let fx = fixture(vec![pg("a")]);
        let err = fx.pool.get_adapter(Some("zzz")).await.err().unwrap();
        assert!(matches!(err, DbmuxError::ConnectionNameNotFound { .. }));
    }

    #[tokio::test]
    async fn test_tunneled_connection_targets_local_port() {
        let fx = fixture(vec![tunneled("remote")]);
        fx.pool.get_adapter(Some("remote")).await.unwrap();

        let tunnel = fx.pool.get_tunnel_status("remote").unwrap();
        assert_eq!(tunnel.remote_host, "db.internal");
        assert_eq!(tunnel.remote_port, 5432);

        let config = fx.backend.created()[0].config().clone();
        assert_eq!(config.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(config.port, Some(tunnel.local_port));
        assert_eq!(fx.pool.entry("remote").unwrap().local_port, Some(tunnel.local_port));
    }

    #[tokio::test]
    async fn test_failed_connect_closes_tunnel_and_reaches_all_waiters() {
        let fx = fixture(vec![tunneled("remote")]);
        fx.backend.fail_connect(true);
        fx.backend.set_connect_delay(Duration::from_millis(20));

        let (a, b) = tokio::join!(
            fx.pool.get_adapter(Some("remote")),
            fx.pool.get_adapter(Some("remote")),
        );
        assert_eq!(a.err().unwrap().to_string(), b.err().unwrap().to_string());
        assert_eq!(fx.backend.total_connects(), 1);
        assert!(fx.pool.entry("remote").is_none());
        assert!(fx.pool.list_tunnels().is_empty());
        assert_eq!(fx.ssh.close_count(), 1);

        fx.backend.fail_connect(false);
        fx.backend.set_connect_delay(Duration::ZERO);
        fx.pool.get_adapter(Some("remote")).await.unwrap();
        assert_eq!(fx.ssh.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_close_connection() {
        let fx = fixture(vec![tunneled("remote")]);
        fx.pool.get_adapter(Some("remote")).await.unwrap();

        fx.pool.close_connection("remote").await;
        fx.pool.close_connection("remote").await;

        assert_eq!(fx.backend.total_disconnects(), 1);
        assert!(!fx.backend.created()[0].is_connected());
        assert!(fx.pool.list_tunnels().is_empty());
        assert_eq!(fx.pool.pool_status()[0].state, EntryState::Idle);
    }

    #[tokio::test]
    async fn test_pool_mode_forces_global_write_setting() {
        let mut named = pg("main");
        named.config.allow_write = true;
        let fx = fixture(vec![named]);

        let service = fx.pool.get_service(Some("main")).await.unwrap();
        assert!(!service.allow_write());
        assert!(service.execute_query("DELETE FROM users", &[]).await.unwrap_err().is_write_blocked());
        assert!(!fx.backend.created()[0].config().allow_write);
    }

    #[tokio::test]
    async fn test_health_check_continues_past_failures() {
        let fx = fixture(vec![pg("up"), pg("down")]);
        fx.pool.get_adapter(Some("up")).await.unwrap();
        fx.backend.fail_connect(true);

        let report = fx.pool.health_check().await;
        assert_eq!(report.len(), 2);
        assert!(report[0].connected);
        assert!(report[0].response_time_ms.is_some());
        assert!(!report[1].connected);
        assert!(report[1].error.as_deref().unwrap().contains("refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backs_off_and_reports_last_error() {
        let fx = fixture(vec![pg("flaky")]);
        fx.backend.fail_connect(true);

        let started = tokio::time::Instant::now();
        let status = fx
            .pool
            .test_connection_with_retry("flaky", 3, Duration::from_millis(100))
            .await
            .unwrap();

        assert!(!status.connected);
        assert_eq!(fx.backend.total_connects(), 3);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(started.elapsed() < Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_retry_replaces_existing_entry() {
        let fx = fixture(vec![pg("main")]);
        let before = fx.pool.get_adapter(Some("main")).await.unwrap();

        let status =
            fx.pool.test_connection_with_retry("main", 2, Duration::from_millis(1)).await.unwrap();
        assert!(status.connected);

        let after = fx.pool.get_adapter(Some("main")).await.unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(fx.backend.created()[0].disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_close_all_is_best_effort() {
        let fx = fixture(vec![tunneled("a"), tunneled("b"), pg("c")]);
        for name in ["a", "b", "c"] {
            fx.pool.get_adapter(Some(name)).await.unwrap();
        }
        fx.backend.created()[1].fail_disconnect(true);

        fx.pool.close_all().await;

        assert_eq!(fx.pool.connected_count(), 0);
        assert!(fx.pool.list_tunnels().is_empty());
        assert!(fx.backend.created().iter().all(|a| a.disconnect_calls() == 1));
        assert_eq!(fx.ssh.close_count(), 2);
    }

    #[tokio::test]
    async fn test_close_all_during_tunnel_setup_closes_tunnel() {
        let fx = fixture(vec![tunneled("remote")]);
        fx.ssh.set_connect_delay(Duration::from_millis(50));

        let connecting = {
            let pool = fx.pool.clone();
            tokio::spawn(async move { pool.get_adapter(Some("remote")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        fx.pool.close_all().await;
        assert!(connecting.await.unwrap().is_err());

        assert_eq!(fx.pool.connected_count(), 0);
        assert!(fx.pool.list_tunnels().is_empty());
        assert_eq!(fx.ssh.close_count(), 1);
        assert_eq!(fx.backend.total_disconnects(), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_leaves_newer_tunnel_alone() {
        let fx = fixture(vec![tunneled("remote")]);
        fx.pool.get_adapter(Some("remote")).await.unwrap();
        let stale = fx.pool.entry("remote").unwrap();

        fx.pool.close_connection("remote").await;
        fx.pool.get_adapter(Some("remote")).await.unwrap();
        assert_eq!(fx.ssh.close_count(), 1);

        stale.teardown_with_tunnel(&fx.pool.factory.tunnels).await;
        assert_eq!(fx.pool.list_tunnels().len(), 1);
        assert_eq!(fx.ssh.close_count(), 1);
    }
}
