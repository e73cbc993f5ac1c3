//! In-memory adapters and SSH transports for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::adapters::{AdapterRegistry, DatabaseAdapter};
use crate::error::{DbmuxError, DbmuxResult};
use crate::models::{
    ColumnInfo, ColumnMeta, ConnectionConfig, DatabaseType, QueryResult, SchemaInfo, SshConfig,
    TableInfo,
};
use crate::services::ssh_tunnel::{SshConnector, SshTransport, TunnelStream};

/// Adapter that records calls and serves a fixed table list.
pub(crate) struct MockAdapter {
    config: ConnectionConfig,
    tables: Vec<String>,
    connected: AtomicBool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    schema_calls: AtomicUsize,
    fail_connect: AtomicBool,
    fail_disconnect: AtomicBool,
    fail_schema: AtomicBool,
    fail_query: AtomicBool,
    connect_delay: Mutex<Duration>,
    queries: Mutex<Vec<String>>,
}

impl MockAdapter {
    pub(crate) fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            tables: vec!["users".to_string()],
            connected: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            schema_calls: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            fail_disconnect: AtomicBool::new(false),
            fail_schema: AtomicBool::new(false),
            fail_query: AtomicBool::new(false),
            connect_delay: Mutex::new(Duration::ZERO),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_tables(tables: &[&str]) -> Arc<Self> {
        let mut adapter = Self::new(ConnectionConfig::new(DatabaseType::Postgres));
        adapter.tables = tables.iter().map(|t| t.to_string()).collect();
        Arc::new(adapter)
    }

    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub(crate) fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn schema_calls(&self) -> usize {
        self.schema_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    pub(crate) fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_schema(&self, fail: bool) {
        self.fail_schema.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_query(&self, fail: bool) {
        self.fail_query.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }
}

#[async_trait]
impl DatabaseAdapter for MockAdapter {
    fn database_type(&self) -> DatabaseType {
        self.config.db_type
    }

    async fn connect(&self) -> DbmuxResult<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(DbmuxError::connection_with_hint(
                format!("connection refused: {}", self.config.display_url()),
                "Check that the server is running",
            ));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> DbmuxResult<()> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(DbmuxError::connection("socket already closed"));
        }
        Ok(())
    }

    async fn execute_query(&self, query: &str, _params: &[Value]) -> DbmuxResult<QueryResult> {
        self.queries.lock().push(query.to_string());
        if self.fail_query.load(Ordering::SeqCst) {
            return Err(DbmuxError::query("server closed the connection unexpectedly"));
        }
        let mut row = Map::new();
        row.insert("result".to_string(), json!(1));
        Ok(QueryResult::with_rows(
            vec![ColumnMeta { name: "result".to_string(), type_name: "int4".to_string() }],
            vec![row],
        ))
    }

    async fn get_schema(&self, tables: Option<&[String]>) -> DbmuxResult<SchemaInfo> {
        self.schema_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_schema.load(Ordering::SeqCst) {
            return Err(DbmuxError::schema("catalog unavailable"));
        }
        let tables = self
            .tables
            .iter()
            .filter(|name| tables.map_or(true, |wanted| wanted.iter().any(|w| w == *name)))
            .map(|name| {
                TableInfo::new(
                    name.clone(),
                    vec![ColumnInfo {
                        name: "id".to_string(),
                        data_type: "integer".to_string(),
                        nullable: false,
                        default_value: None,
                        comment: None,
                    }],
                )
            })
            .collect();
        Ok(SchemaInfo {
            database_type: self.config.db_type,
            database_name: self.config.database.clone().unwrap_or_else(|| "mock".to_string()),
            tables,
            version: Some("mock 1.0".to_string()),
        })
    }
}

/// Registry whose constructors build [`MockAdapter`]s for every backend tag.
#[derive(Default)]
pub(crate) struct MockBackend {
    created: Mutex<Vec<Arc<MockAdapter>>>,
    fail_connect: AtomicBool,
    connect_delay: Mutex<Duration>,
}

impl MockBackend {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn registry(self: &Arc<Self>) -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        for db_type in DatabaseType::ALL {
            let backend = Arc::clone(self);
            registry.register(db_type, move |config| {
                let adapter = Arc::new(MockAdapter::new(config.clone()));
                adapter.fail_connect(backend.fail_connect.load(Ordering::SeqCst));
                adapter.set_connect_delay(*backend.connect_delay.lock());
                backend.created.lock().push(Arc::clone(&adapter));
                Ok(adapter as Arc<dyn DatabaseAdapter>)
            });
        }
        registry
    }

    pub(crate) fn created(&self) -> Vec<Arc<MockAdapter>> {
        self.created.lock().clone()
    }

    pub(crate) fn total_connects(&self) -> usize {
        self.created.lock().iter().map(|a| a.connect_calls()).sum()
    }

    pub(crate) fn total_disconnects(&self) -> usize {
        self.created.lock().iter().map(|a| a.disconnect_calls()).sum()
    }

    pub(crate) fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }
}

#[derive(Default)]
struct SshStats {
    connects: AtomicUsize,
    closes: AtomicUsize,
    forwards: AtomicUsize,
}

/// SSH connector whose transports forward over plain TCP.
#[derive(Default)]
pub(crate) struct MockSshConnector {
    stats: Arc<SshStats>,
    fail_auth: AtomicBool,
    lose_new_sessions: AtomicBool,
    connect_delay: Mutex<Duration>,
    transports: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockSshConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.stats.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn close_count(&self) -> usize {
        self.stats.closes.load(Ordering::SeqCst)
    }

    pub(crate) fn forward_count(&self) -> usize {
        self.stats.forwards.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_auth(&self, fail: bool) {
        self.fail_auth.store(fail, Ordering::SeqCst);
    }

    /// Hand out sessions that are already gone.
    pub(crate) fn lose_new_sessions(&self, lose: bool) {
        self.lose_new_sessions.store(lose, Ordering::SeqCst);
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    /// Simulate every SSH session dropping.
    pub(crate) fn drop_sessions(&self) {
        for transport in self.transports.lock().iter() {
            transport.lost.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl SshConnector for MockSshConnector {
    async fn connect(&self, config: &SshConfig) -> DbmuxResult<Arc<dyn SshTransport>> {
        self.stats.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_auth.load(Ordering::SeqCst) {
            return Err(DbmuxError::tunnel_with_hint(
                format!("SSH authentication failed for {}@{}", config.username, config.host),
                "Check your SSH username and credentials",
            ));
        }
        let transport = Arc::new(MockTransport {
            stats: Arc::clone(&self.stats),
            closed: AtomicBool::new(false),
            lost: AtomicBool::new(self.lose_new_sessions.load(Ordering::SeqCst)),
        });
        self.transports.lock().push(Arc::clone(&transport));
        Ok(transport as Arc<dyn SshTransport>)
    }
}

struct MockTransport {
    stats: Arc<SshStats>,
    closed: AtomicBool,
    lost: AtomicBool,
}

#[async_trait]
impl SshTransport for MockTransport {
    async fn open_forward(&self, host: &str, port: u16) -> DbmuxResult<Box<dyn TunnelStream>> {
        self.stats.forwards.fetch_add(1, Ordering::SeqCst);
        let stream = TcpStream::connect((host, port)).await?;
        Ok(Box::new(stream))
    }

    async fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.lost.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.stats.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Start a TCP echo server on 127.0.0.1 and return its port.
pub(crate) async fn spawn_echo_server() -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let task = tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    (port, task)
}
