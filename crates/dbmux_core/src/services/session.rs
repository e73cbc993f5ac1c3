//! Session registry.
//!
//! Each session owns one connected adapter, one schema cache and optionally
//! one SSH tunnel keyed by the session id. A background sweep closes sessions
//! that have been idle longer than the configured timeout.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapters::{AdapterRegistry, DatabaseAdapter};
use crate::config::SessionSettings;
use crate::error::{DbmuxError, DbmuxResult};
use crate::models::{ConnectionConfig, SchemaCacheConfig, SessionInfo};
use crate::services::database::DatabaseService;
use crate::services::safety::QueryGuard;
use crate::services::ssh_tunnel::TunnelManager;

/// Number of swept session ids remembered for `SessionExpired` reporting.
const EXPIRED_ID_MEMORY: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct LastAccess {
    at: DateTime<Utc>,
    instant: Instant,
}

/// One open session.
pub struct Session {
    id: String,
    config: ConnectionConfig,
    service: Arc<DatabaseService>,
    created_at: DateTime<Utc>,
    last_access: Mutex<LastAccess>,
    tunneled: bool,
    closed: AtomicBool,
}

impl Session {
    /// Session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Configuration the session was opened with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// When the session was opened.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Last time the session was used.
    pub fn last_accessed_at(&self) -> DateTime<Utc> {
        self.last_access.lock().at
    }

    fn touch(&self) {
        let mut access = self.last_access.lock();
        access.instant = Instant::now();
        access.at = Utc::now().max(self.created_at);
    }

    fn idle_for(&self) -> Duration {
        self.last_access.lock().instant.elapsed()
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            db_type: self.config.db_type,
            target: self.config.display_url(),
            created_at: self.created_at,
            last_accessed_at: self.last_accessed_at(),
            tunneled: self.tunneled,
            cache: self.service.cache_stats(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("db_type", &self.config.db_type)
            .field("tunneled", &self.tunneled)
            .finish()
    }
}

/// Registry of open sessions keyed by id.
pub struct SessionManager {
    registry: Arc<AdapterRegistry>,
    tunnels: Arc<TunnelManager>,
    guard: Arc<QueryGuard>,
    cache_config: SchemaCacheConfig,
    timeout: Duration,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    expired: Mutex<VecDeque<String>>,
    cancel_token: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Create a registry and start its idle sweep. Must be called from
    /// within a Tokio runtime.
    pub fn new(
        registry: Arc<AdapterRegistry>,
        tunnels: Arc<TunnelManager>,
        guard: Arc<QueryGuard>,
        cache_config: SchemaCacheConfig,
        settings: SessionSettings,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            registry,
            tunnels,
            guard,
            cache_config,
            timeout: settings.timeout(),
            sessions: RwLock::new(HashMap::new()),
            expired: Mutex::new(VecDeque::new()),
            cancel_token: CancellationToken::new(),
            sweeper: Mutex::new(None),
        });

        *manager.sweeper.lock() = settings.cleanup_interval().map(|interval| {
            spawn_sweeper(Arc::downgrade(&manager), manager.cancel_token.clone(), interval)
        });

        tracing::debug!(
            timeout_secs = settings.timeout_secs,
            cleanup_interval_secs = settings.cleanup_interval_secs,
            "Session manager started"
        );
        manager
    }

    /// Connect with `config` and register a new session.
    pub async fn open(&self, config: ConnectionConfig) -> DbmuxResult<String> {
        if self.cancel_token.is_cancelled() {
            return Err(DbmuxError::internal("Session manager is shut down"));
        }
        config.validate().map_err(DbmuxError::config)?;

        let id = Uuid::new_v4().to_string();

        let local_port = match config.active_ssh() {
            Some(ssh) => {
                let remote_port = config.port_or_default().ok_or_else(|| {
                    DbmuxError::config(format!("A port is required to tunnel to {}", config.db_type))
                })?;
                Some(self.tunnels.create_tunnel(&id, ssh, config.host_or_default(), remote_port).await?)
            }
            None => None,
        };

        let effective = match local_port {
            Some(port) => config.through_tunnel(port),
            None => config.clone(),
        };

        let adapter = match self.connect(&effective).await {
            Ok(adapter) => adapter,
            Err(e) => {
                tracing::warn!(db_type = %config.db_type, error = %e, "Session connect failed");
                if local_port.is_some() {
                    self.tunnels.close_tunnel(&id).await;
                }
                return Err(e);
            }
        };

        let now = Utc::now();
        let session = Arc::new(Session {
            id: id.clone(),
            service: Arc::new(DatabaseService::new(
                adapter,
                Arc::clone(&self.guard),
                config.allow_write,
                self.cache_config,
            )),
            created_at: now,
            last_access: Mutex::new(LastAccess { at: now, instant: Instant::now() }),
            tunneled: local_port.is_some(),
            closed: AtomicBool::new(false),
            config,
        });

        if self.cancel_token.is_cancelled() {
            self.teardown(&session).await;
            return Err(DbmuxError::internal("Session manager is shut down"));
        }

        tracing::info!(
            session = %id,
            db_type = %session.config.db_type,
            target = %session.config.display_url(),
            tunneled = session.tunneled,
            "Session opened"
        );
        self.sessions.write().insert(id.clone(), session);
        Ok(id)
    }

    async fn connect(&self, config: &ConnectionConfig) -> DbmuxResult<Arc<dyn DatabaseAdapter>> {
        let adapter = self.registry.create(config)?;
        adapter.connect().await?;
        Ok(adapter)
    }

    /// Close a session: clear its cache, disconnect, close its tunnel.
    pub async fn close(&self, id: &str) -> DbmuxResult<()> {
        let session = self
            .sessions
            .write()
            .remove(id)
            .ok_or_else(|| DbmuxError::session_not_found(id))?;
        self.teardown(&session).await;
        tracing::info!(session = %id, "Session closed");
        Ok(())
    }

    async fn teardown(&self, session: &Session) {
        if session.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        session.service.clear_schema_cache();
        if let Err(e) = session.service.adapter().disconnect().await {
            tracing::warn!(session = %session.id, error = %e, "Disconnect failed");
        }
        if session.tunneled {
            self.tunnels.close_tunnel(&session.id).await;
        }
    }

    fn lookup(&self, id: &str) -> DbmuxResult<Arc<Session>> {
        if let Some(session) = self.sessions.read().get(id) {
            return Ok(Arc::clone(session));
        }
        if self.expired.lock().iter().any(|expired| expired == id) {
            return Err(DbmuxError::session_expired(id));
        }
        Err(DbmuxError::session_not_found(id))
    }

    /// Service for a session. Marks the session as used.
    pub async fn get_service(&self, id: &str) -> DbmuxResult<Arc<DatabaseService>> {
        let session = self.lookup(id)?;
        session.touch();
        Ok(Arc::clone(&session.service))
    }

    /// Adapter for a session. Marks the session as used.
    pub async fn get_adapter(&self, id: &str) -> DbmuxResult<Arc<dyn DatabaseAdapter>> {
        Ok(Arc::clone(self.get_service(id).await?.adapter()))
    }

    /// Close every session idle longer than the timeout. Returns how many
    /// were closed.
    pub async fn sweep_idle(&self) -> usize {
        let idle: Vec<Arc<Session>> = self
            .sessions
            .read()
            .values()
            .filter(|s| s.idle_for() > self.timeout)
            .cloned()
            .collect();

        let mut removed = Vec::with_capacity(idle.len());
        {
            let mut sessions = self.sessions.write();
            for session in idle {
                let still_idle = sessions
                    .get(&session.id)
                    .is_some_and(|current| Arc::ptr_eq(current, &session) && session.idle_for() > self.timeout);
                if still_idle {
                    sessions.remove(&session.id);
                    removed.push(session);
                }
            }
        }
        if removed.is_empty() {
            return 0;
        }

        {
            let mut expired = self.expired.lock();
            for session in &removed {
                if expired.len() == EXPIRED_ID_MEMORY {
                    expired.pop_front();
                }
                expired.push_back(session.id.clone());
            }
        }

        for session in &removed {
            tracing::info!(
                session = %session.id,
                idle_secs = session.idle_for().as_secs(),
                "Closing idle session"
            );
        }
        join_all(removed.iter().map(|s| self.teardown(s))).await;
        removed.len()
    }

    /// Close every session concurrently and stop the idle sweep.
    pub async fn close_all(&self) {
        self.cancel_token.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            if let Err(e) = sweeper.await {
                tracing::warn!(error = %e, "Session sweeper ended abnormally");
            }
        }

        let sessions: Vec<Arc<Session>> = self.sessions.write().drain().map(|(_, s)| s).collect();
        if sessions.is_empty() {
            return;
        }
        tracing::info!(count = sessions.len(), "Closing all sessions");
        join_all(sessions.iter().map(|s| self.teardown(s))).await;
    }

    /// All open sessions, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self.sessions.read().values().map(|s| s.info()).collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Drop one session's cached schema.
    pub fn clear_session_cache(&self, id: &str) -> DbmuxResult<()> {
        self.lookup(id)?.service.clear_schema_cache();
        Ok(())
    }

    /// Drop every session's cached schema.
    pub fn clear_all_caches(&self) {
        for session in self.sessions.read().values() {
            session.service.clear_schema_cache();
        }
    }

    /// Whether `id` is an open session.
    pub fn has_session(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Idle timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.session_count())
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn spawn_sweeper(
    manager: Weak<SessionManager>,
    cancel_token: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(manager) = manager.upgrade() else { break };
                    let closed = manager.sweep_idle().await;
                    if closed > 0 {
                        tracing::debug!(closed, remaining = manager.session_count(), "Idle sweep finished");
                    }
                }
            }
        }
        tracing::debug!("Session sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DatabaseType, SshConfig};
    use crate::testing::{MockBackend, MockSshConnector};

    struct Fixture {
        sessions: Arc<SessionManager>,
        backend: Arc<MockBackend>,
        ssh: Arc<MockSshConnector>,
        tunnels: Arc<TunnelManager>,
    }

    fn fixture(timeout_secs: u64, cleanup_interval_secs: u64) -> Fixture {
        let backend = MockBackend::new();
        let ssh = MockSshConnector::new();
        let tunnels = Arc::new(TunnelManager::new(ssh.clone()));
        let sessions = SessionManager::new(
            Arc::new(backend.registry()),
            tunnels.clone(),
            Arc::new(QueryGuard::default()),
            SchemaCacheConfig::default(),
            SessionSettings { timeout_secs, cleanup_interval_secs },
        );
        Fixture { sessions, backend, ssh, tunnels }
    }

    fn mysql() -> ConnectionConfig {
        ConnectionConfig::new(DatabaseType::Mysql)
            .with_endpoint("10.0.0.5", 3306)
            .with_credentials("app", "secret")
            .with_database("shop")
    }

    #[tokio::test]
    async fn test_open_and_reuse() {
        let fx = fixture(3600, 300);
        let id = fx.sessions.open(mysql()).await.unwrap();
        assert!(Uuid::parse_str(&id).is_ok());

        let a = fx.sessions.get_adapter(&id).await.unwrap();
        let b = fx.sessions.get_adapter(&id).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(fx.backend.total_connects(), 1);

        let info = &fx.sessions.list_sessions()[0];
        assert_eq!(info.id, id);
        assert!(info.last_accessed_at >= info.created_at);
        assert!(!info.target.contains("secret"));
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let fx = fixture(3600, 300);
        let a = fx.sessions.open(mysql()).await.unwrap();
        let b = fx.sessions.open(mysql()).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(fx.sessions.session_count(), 2);
    }

    #[tokio::test]
    async fn test_connect_failure_registers_nothing() {
        let fx = fixture(3600, 300);
        fx.backend.fail_connect(true);
        let config = mysql().with_ssh(SshConfig::new("bastion", "ops").with_password("pw"));

        let err = fx.sessions.open(config).await.unwrap_err();
        assert_eq!(err.category(), "Connection");
        assert_eq!(fx.sessions.session_count(), 0);
        assert_eq!(fx.tunnels.tunnel_count(), 0);
        assert_eq!(fx.ssh.close_count(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_backend() {
        let fx = fixture(3600, 300);
        let sessions = SessionManager::new(
            Arc::new(AdapterRegistry::new()),
            fx.tunnels.clone(),
            Arc::new(QueryGuard::default()),
            SchemaCacheConfig::default(),
            SessionSettings::default(),
        );
        let err = sessions.open(mysql()).await.unwrap_err();
        assert!(matches!(err, DbmuxError::UnsupportedBackend { .. }));
    }

    #[tokio::test]
    async fn test_tunneled_session_owns_tunnel() {
        let fx = fixture(3600, 300);
        let config = mysql().with_ssh(SshConfig::new("bastion", "ops").with_password("pw"));
        let id = fx.sessions.open(config).await.unwrap();

        assert!(fx.tunnels.has_tunnel(&id));
        let port = fx.tunnels.local_port(&id).unwrap();
        assert_eq!(fx.backend.created()[0].config().port, Some(port));

        fx.sessions.close(&id).await.unwrap();
        assert!(!fx.tunnels.has_tunnel(&id));
        assert_eq!(fx.ssh.close_count(), 1);
    }

    #[tokio::test]
    async fn test_close_and_lookup_errors() {
        let fx = fixture(3600, 300);
        let id = fx.sessions.open(mysql()).await.unwrap();

        fx.sessions.close(&id).await.unwrap();
        assert_eq!(fx.backend.total_disconnects(), 1);

        let err = fx.sessions.get_service(&id).await.unwrap_err();
        assert!(matches!(err, DbmuxError::SessionNotFound { .. }));
        assert!(matches!(fx.sessions.close(&id).await.unwrap_err(), DbmuxError::SessionNotFound { .. }));
        assert_eq!(fx.backend.total_disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_is_swept_once() {
        let fx = fixture(60, 10);
        let id = fx.sessions.open(mysql()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(75)).await;

        assert!(!fx.sessions.has_session(&id));
        let err = fx.sessions.get_adapter(&id).await.err().unwrap();
        assert!(matches!(err, DbmuxError::SessionExpired { .. }));
        assert!(err.is_session_gone());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fx.backend.created()[0].disconnect_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_keeps_session_alive() {
        let fx = fixture(60, 10);
        let id = fx.sessions.open(mysql()).await.unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(45)).await;
            fx.sessions.get_service(&id).await.unwrap();
        }
        assert!(fx.sessions.has_session(&id));
        assert_eq!(fx.backend.total_disconnects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_cleanup_interval_disables_sweep() {
        let fx = fixture(60, 0);
        let id = fx.sessions.open(mysql()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(fx.sessions.has_session(&id));

        assert_eq!(fx.sessions.sweep_idle().await, 1);
        assert!(!fx.sessions.has_session(&id));
        fx.sessions.close_all().await;
    }

    #[tokio::test]
    async fn test_clear_caches() {
        let fx = fixture(3600, 300);
        let id = fx.sessions.open(mysql()).await.unwrap();
        let service = fx.sessions.get_service(&id).await.unwrap();
        service.get_schema(false).await.unwrap();
        assert!(fx.sessions.list_sessions()[0].cache.is_cached);

        fx.sessions.clear_session_cache(&id).unwrap();
        assert!(!service.cache_stats().is_cached);

        service.get_schema(false).await.unwrap();
        fx.sessions.clear_all_caches();
        assert!(!service.cache_stats().is_cached);
        assert!(fx.sessions.clear_session_cache("missing").is_err());
    }

    #[tokio::test]
    async fn test_close_all_is_best_effort() {
        let fx = fixture(3600, 300);
        let ssh = SshConfig::new("bastion", "ops").with_password("pw");
        fx.sessions.open(mysql().with_ssh(ssh.clone())).await.unwrap();
        fx.sessions.open(mysql().with_ssh(ssh)).await.unwrap();
        fx.sessions.open(mysql()).await.unwrap();
        fx.backend.created()[0].fail_disconnect(true);

        fx.sessions.close_all().await;

        assert_eq!(fx.sessions.session_count(), 0);
        assert_eq!(fx.tunnels.tunnel_count(), 0);
        assert!(fx.backend.created().iter().all(|a| a.disconnect_calls() == 1));
        assert_eq!(fx.ssh.close_count(), 2);
        assert!(fx.sessions.open(mysql()).await.is_err());
    }
}
