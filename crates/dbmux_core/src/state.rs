//! Process-wide context object.
//!
//! Owns the adapter registry, query guard, tunnel manager, connection pool and
//! session registry. Front-ends hold one `Arc<DbmuxState>` and call through it.

use std::sync::Arc;

use crate::adapters::{AdapterRegistry, DatabaseAdapter};
use crate::config::{ConnectionCatalog, DbmuxConfig};
use crate::error::{DbmuxError, DbmuxResult};
use crate::models::ConnectionConfig;
use crate::services::{
    ConnectionPool, DatabaseService, QueryGuard, RusshConnector, SessionManager, SshConnector,
    TunnelManager,
};

/// Central state shared by every front-end.
pub struct DbmuxState {
    config: DbmuxConfig,
    registry: Arc<AdapterRegistry>,
    guard: Arc<QueryGuard>,
    tunnels: Arc<TunnelManager>,
    pool: Option<ConnectionPool>,
    sessions: Arc<SessionManager>,
}

impl DbmuxState {
    /// Create state with the built-in adapters and the russh connector.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: DbmuxConfig) -> DbmuxResult<Arc<Self>> {
        Self::with_components(config, AdapterRegistry::with_builtin(), Arc::new(RusshConnector::new()))
    }

    /// Create state with a custom adapter registry and SSH connector.
    pub fn with_components(
        config: DbmuxConfig,
        registry: AdapterRegistry,
        connector: Arc<dyn SshConnector>,
    ) -> DbmuxResult<Arc<Self>> {
        let registry = Arc::new(registry);
        let guard = Arc::new(QueryGuard::new(&config.settings.ddl_whitelist));
        let tunnels = Arc::new(TunnelManager::new(connector));

        let pool = if config.databases.is_empty() {
            None
        } else {
            config.validate()?;
            let catalog = Arc::new(ConnectionCatalog::new(config.databases.clone())?);
            Some(ConnectionPool::new(
                catalog,
                Arc::clone(&registry),
                Arc::clone(&tunnels),
                Arc::clone(&guard),
                config.settings.allow_write,
                config.settings.schema_cache,
            ))
        };

        let sessions = SessionManager::new(
            Arc::clone(&registry),
            Arc::clone(&tunnels),
            Arc::clone(&guard),
            config.settings.schema_cache,
            config.settings.session,
        );

        tracing::info!(
            databases = config.databases.len(),
            backends = registry.supported_types().len(),
            whitelist = guard.pattern_count(),
            allow_write = config.settings.allow_write,
            "DbmuxState initialized"
        );

        Ok(Arc::new(Self { config, registry, guard, tunnels, pool, sessions }))
    }

    /// The loaded configuration.
    pub fn config(&self) -> &DbmuxConfig {
        &self.config
    }

    /// The adapter registry.
    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    /// The query guard shared by every connection.
    pub fn guard(&self) -> &Arc<QueryGuard> {
        &self.guard
    }

    /// The tunnel manager shared by pool and sessions.
    pub fn tunnels(&self) -> &Arc<TunnelManager> {
        &self.tunnels
    }

    /// The session registry.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// The connection pool. Fails when no named connections are configured.
    pub fn pool(&self) -> DbmuxResult<&ConnectionPool> {
        self.pool
            .as_ref()
            .ok_or_else(|| DbmuxError::config("No named database connections are configured"))
    }

    // ========== Session mode ==========

    /// Open a session from an inline connection configuration.
    pub async fn open_session(&self, config: ConnectionConfig) -> DbmuxResult<String> {
        self.sessions.open(config).await
    }

    /// Close a session.
    pub async fn close_session(&self, id: &str) -> DbmuxResult<()> {
        self.sessions.close(id).await
    }

    /// Service for a session.
    pub async fn session_service(&self, id: &str) -> DbmuxResult<Arc<DatabaseService>> {
        self.sessions.get_service(id).await
    }

    /// Adapter for a session.
    pub async fn session_adapter(&self, id: &str) -> DbmuxResult<Arc<dyn DatabaseAdapter>> {
        self.sessions.get_adapter(id).await
    }

    // ========== Pool mode ==========

    /// Service for a named connection, or the current one.
    pub async fn service(&self, name: Option<&str>) -> DbmuxResult<Arc<DatabaseService>> {
        self.pool()?.get_service(name).await
    }

    /// Adapter for a named connection, or the current one.
    pub async fn adapter(&self, name: Option<&str>) -> DbmuxResult<Arc<dyn DatabaseAdapter>> {
        self.pool()?.get_adapter(name).await
    }

    /// Close every session, pooled connection and tunnel.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down");
        self.sessions.close_all().await;
        if let Some(pool) = &self.pool {
            pool.close_all().await;
        }
        self.tunnels.close_all().await;
    }
}

impl std::fmt::Debug for DbmuxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbmuxState")
            .field("registry", &self.registry)
            .field("pool", &self.pool)
            .field("sessions", &self.sessions)
            .field("tunnels", &self.tunnels)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::models::{DatabaseType, NamedConnection, SshConfig};
    use crate::testing::{MockBackend, MockSshConnector};

    fn pg(name: &str) -> NamedConnection {
        let mut named = NamedConnection::new(
            name,
            ConnectionConfig::new(DatabaseType::Postgres).with_endpoint("db.internal", 5432),
        );
        named.config.ssh = Some(SshConfig::new("bastion", "ops").with_password("pw"));
        named
    }

    #[tokio::test]
    async fn test_session_only_state() {
        let backend = MockBackend::new();
        let config = DbmuxConfig { databases: Vec::new(), settings: Settings::default() };
        let state =
            DbmuxState::with_components(config, backend.registry(), MockSshConnector::new()).unwrap();

        assert_eq!(state.pool().unwrap_err().category(), "Config");
        assert!(state.adapter(None).await.is_err());

        let id = state.open_session(ConnectionConfig::sqlite("/tmp/x.db")).await.unwrap();
        state.session_service(&id).await.unwrap();
        state.close_session(&id).await.unwrap();
        assert!(state.session_adapter(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let config = DbmuxConfig { databases: vec![pg("a"), pg("a")], settings: Settings::default() };
        let result =
            DbmuxState::with_components(config, MockBackend::new().registry(), MockSshConnector::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_whitelist_reaches_pool_services() {
        let mut settings = Settings::default();
        settings.ddl_whitelist = vec!["^CREATE INDEX".to_string()];
        let config = DbmuxConfig { databases: vec![pg("main")], settings };
        let state = DbmuxState::with_components(config, MockBackend::new().registry(), MockSshConnector::new())
            .unwrap();

        assert_eq!(state.guard().pattern_count(), 1);
        let service = state.service(None).await.unwrap();
        service.execute_query("CREATE INDEX i ON t(c)", &[]).await.unwrap();
        assert!(service.execute_query("CREATE TABLE t (c int)", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let backend = MockBackend::new();
        let ssh = MockSshConnector::new();
        let config = DbmuxConfig { databases: vec![pg("main")], settings: Settings::default() };
        let state = DbmuxState::with_components(config, backend.registry(), ssh.clone()).unwrap();

        state.adapter(Some("main")).await.unwrap();
        let ssh_config = SshConfig::new("bastion", "ops").with_password("pw");
        state
            .open_session(
                ConnectionConfig::new(DatabaseType::Mysql)
                    .with_endpoint("10.0.0.9", 3306)
                    .with_ssh(ssh_config),
            )
            .await
            .unwrap();
        assert_eq!(state.tunnels().tunnel_count(), 2);

        state.shutdown().await;

        assert_eq!(state.tunnels().tunnel_count(), 0);
        assert_eq!(state.sessions().session_count(), 0);
        assert_eq!(state.pool().unwrap().connected_count(), 0);
        assert_eq!(backend.total_disconnects(), 2);
        assert_eq!(ssh.close_count(), 2);
    }
}
