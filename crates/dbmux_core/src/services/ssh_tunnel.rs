//! SSH tunnel provisioner.
//!
//! Forwards an OS-assigned local port on 127.0.0.1 to a remote database
//! endpoint through an authenticated SSH session. Tunnels are keyed by the
//! connection name (pool mode) or session id (session mode); at most one
//! tunnel exists per key.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::{join_all, FutureExt};
use russh::client;
use russh_keys::key::KeyPair;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{DbmuxError, DbmuxResult};
use crate::models::{SshConfig, TunnelInfo};
use crate::services::singleflight::SingleFlight;

/// How often a tunnel checks whether its SSH session is still alive.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Byte stream of one forwarded channel.
pub trait TunnelStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> TunnelStream for T {}

/// An authenticated SSH session able to open forwarded channels.
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Open a `direct-tcpip` channel to `host:port`.
    async fn open_forward(&self, host: &str, port: u16) -> DbmuxResult<Box<dyn TunnelStream>>;

    /// Whether the session has ended.
    async fn is_closed(&self) -> bool;

    /// End the session. Calling it more than once is harmless.
    async fn close(&self);
}

/// Establishes authenticated SSH sessions.
#[async_trait]
pub trait SshConnector: Send + Sync {
    /// Connect and authenticate.
    async fn connect(&self, config: &SshConfig) -> DbmuxResult<Arc<dyn SshTransport>>;
}

/// Authentication method chosen for a tunnel, in priority order.
#[derive(Clone, PartialEq, Eq)]
pub enum SshAuth {
    /// Inline private key
    InlineKey {
        /// PEM / OpenSSH key text
        pem: String,
        /// Key passphrase
        passphrase: Option<String>,
    },
    /// Private key file
    KeyFile {
        /// Expanded key path
        path: PathBuf,
        /// Key passphrase
        passphrase: Option<String>,
    },
    /// Password
    Password(String),
    /// Keys held by the running SSH agent
    Agent,
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InlineKey { .. } => f.write_str("InlineKey"),
            Self::KeyFile { path, .. } => f.debug_struct("KeyFile").field("path", path).finish(),
            Self::Password(_) => f.write_str("Password"),
            Self::Agent => f.write_str("Agent"),
        }
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_tilde(path: &Path, home: Option<&Path>) -> PathBuf {
    match (path.strip_prefix("~"), home) {
        (Ok(rest), Some(home)) => home.join(rest),
        _ => path.to_path_buf(),
    }
}

/// Pick the authentication method for `config`.
///
/// Inline key, then key file, then password, then `~/.ssh/id_rsa`, then the
/// SSH agent. A configured key file that does not exist is an error.
pub fn resolve_auth(config: &SshConfig, home: Option<&Path>) -> DbmuxResult<SshAuth> {
    if let Some(pem) = config.private_key_content.as_ref().filter(|k| !k.trim().is_empty()) {
        return Ok(SshAuth::InlineKey { pem: pem.clone(), passphrase: config.passphrase.clone() });
    }

    if let Some(path) = &config.private_key {
        let path = expand_tilde(path, home);
        if !path.is_file() {
            return Err(DbmuxError::tunnel_with_hint(
                format!("SSH key file not found: {}", path.display()),
                "Check that the key file exists and is readable",
            ));
        }
        return Ok(SshAuth::KeyFile { path, passphrase: config.passphrase.clone() });
    }

    if let Some(password) = &config.password {
        return Ok(SshAuth::Password(password.clone()));
    }

    if let Some(default_key) = home.map(|h| h.join(".ssh").join("id_rsa")) {
        if default_key.is_file() {
            return Ok(SshAuth::KeyFile { path: default_key, passphrase: config.passphrase.clone() });
        }
    }

    Ok(SshAuth::Agent)
}

/// Handle to an active tunnel.
pub struct TunnelHandle {
    id: u64,
    name: String,
    local_port: u16,
    ssh_host: String,
    ssh_port: u16,
    remote_host: String,
    remote_port: u16,
    established_at: DateTime<Utc>,
    transport: Arc<dyn SshTransport>,
    cancel_token: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TunnelHandle {
    /// Local port the tunnel is listening on.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Listing entry for this tunnel.
    pub fn info(&self) -> TunnelInfo {
        TunnelInfo {
            name: self.name.clone(),
            local_port: self.local_port,
            ssh_host: self.ssh_host.clone(),
            ssh_port: self.ssh_port,
            remote_host: self.remote_host.clone(),
            remote_port: self.remote_port,
            established_at: self.established_at,
        }
    }

    /// Stop the listener, then end the SSH session. Runs once.
    async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_token.cancel();
        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!(tunnel = %self.name, error = %e, "Tunnel accept task ended abnormally");
            }
        }
        self.transport.close().await;
        tracing::info!(tunnel = %self.name, local_port = self.local_port, "SSH tunnel closed");
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("name", &self.name)
            .field("local_port", &self.local_port)
            .field("remote", &format_args!("{}:{}", self.remote_host, self.remote_port))
            .finish()
    }
}

/// Tracks every live tunnel by key.
pub struct TunnelManager {
    connector: Arc<dyn SshConnector>,
    tunnels: SingleFlight<Arc<TunnelHandle>>,
    monitor_interval: Duration,
    next_id: AtomicU64,
}

impl TunnelManager {
    /// Create a manager using the given SSH connector.
    pub fn new(connector: Arc<dyn SshConnector>) -> Self {
        Self {
            connector,
            tunnels: SingleFlight::new(Arc::new(|handle: Arc<TunnelHandle>| {
                async move { handle.shutdown().await }.boxed()
            })),
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            next_id: AtomicU64::new(1),
        }
    }

    /// Create a manager that connects with russh.
    pub fn russh() -> Self {
        Self::new(Arc::new(RusshConnector::new()))
    }

    /// Set how often tunnels check their SSH session.
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Create (or reuse) the tunnel for `name` and return its local port.
    pub async fn create_tunnel(
        &self,
        name: &str,
        ssh: &SshConfig,
        remote_host: &str,
        remote_port: u16,
    ) -> DbmuxResult<u16> {
        let connector = Arc::clone(&self.connector);
        let tunnels = self.tunnels.clone();
        let monitor_interval = self.monitor_interval;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let key = name.to_string();
        let ssh = ssh.clone();
        let remote_host = remote_host.to_string();

        let handle = self
            .tunnels
            .get_or_create(name, move || async move {
                establish(
                    connector,
                    tunnels,
                    TunnelRequest { id, name: key, ssh, remote_host, remote_port, monitor_interval },
                )
                .await
            })
            .await?;
        Ok(handle.local_port)
    }

    /// Close the tunnel for `name`. No-op when there is none.
    pub async fn close_tunnel(&self, name: &str) {
        if let Some(handle) = self.tunnels.get(name) {
            self.shutdown_handle(name, handle).await;
        }
    }

    /// Close the tunnel for `name` only if it still listens on `local_port`.
    /// A tunnel created for the same name since then is left alone.
    pub async fn close_tunnel_on_port(&self, name: &str, local_port: u16) {
        if let Some(handle) = self.tunnels.get(name).filter(|h| h.local_port == local_port) {
            self.shutdown_handle(name, handle).await;
        }
    }

    async fn shutdown_handle(&self, name: &str, handle: Arc<TunnelHandle>) {
        handle.shutdown().await;
        self.tunnels.remove_if(name, |current| Arc::ptr_eq(current, &handle));
    }

    /// Close every tunnel concurrently.
    pub async fn close_all(&self) {
        let handles = self.tunnels.drain();
        if handles.is_empty() {
            return;
        }
        tracing::info!(count = handles.len(), "Closing all SSH tunnels");
        join_all(handles.iter().map(|(_, handle)| handle.shutdown())).await;
    }

    /// Local port of the live tunnel for `name`.
    pub fn local_port(&self, name: &str) -> Option<u16> {
        self.tunnels.get(name).map(|h| h.local_port)
    }

    /// Whether a live tunnel exists for `name`.
    pub fn has_tunnel(&self, name: &str) -> bool {
        self.tunnels.get(name).is_some()
    }

    /// Number of live tunnels.
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.ready_count()
    }

    /// All live tunnels, sorted by name.
    pub fn list_tunnels(&self) -> Vec<TunnelInfo> {
        let mut infos: Vec<TunnelInfo> =
            self.tunnels.ready().into_iter().map(|(_, handle)| handle.info()).collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Status of the live tunnel for `name`.
    pub fn tunnel_status(&self, name: &str) -> Option<TunnelInfo> {
        self.tunnels.get(name).map(|h| h.info())
    }
}

impl std::fmt::Debug for TunnelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelManager").field("tunnels", &self.tunnel_count()).finish()
    }
}

struct TunnelRequest {
    id: u64,
    name: String,
    ssh: SshConfig,
    remote_host: String,
    remote_port: u16,
    monitor_interval: Duration,
}

async fn establish(
    connector: Arc<dyn SshConnector>,
    tunnels: SingleFlight<Arc<TunnelHandle>>,
    request: TunnelRequest,
) -> DbmuxResult<Arc<TunnelHandle>> {
    tracing::info!(
        tunnel = %request.name,
        ssh_host = %request.ssh.host,
        ssh_port = request.ssh.port,
        remote = %format_args!("{}:{}", request.remote_host, request.remote_port),
        "Establishing SSH tunnel"
    );

    let transport = connector.connect(&request.ssh).await?;

    let listener = match TcpListener::bind("127.0.0.1:0").await {
        Ok(listener) => listener,
        Err(e) => {
            transport.close().await;
            return Err(DbmuxError::tunnel_with_hint(
                format!("Failed to bind local port for SSH tunnel: {e}"),
                "Check local firewall and port availability",
            ));
        }
    };
    let local_port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            transport.close().await;
            return Err(DbmuxError::tunnel_with_source("Failed to read tunnel local address", e));
        }
    };

    let cancel_token = CancellationToken::new();
    let accept_task = tokio::spawn(run_tunnel(
        listener,
        Arc::clone(&transport),
        tunnels,
        request.id,
        request.name.clone(),
        request.remote_host.clone(),
        request.remote_port,
        request.monitor_interval,
        cancel_token.clone(),
    ));

    tracing::info!(tunnel = %request.name, local_port, "SSH tunnel listening");

    Ok(Arc::new(TunnelHandle {
        id: request.id,
        name: request.name,
        local_port,
        ssh_host: request.ssh.host,
        ssh_port: request.ssh.port,
        remote_host: request.remote_host,
        remote_port: request.remote_port,
        established_at: Utc::now(),
        transport,
        cancel_token,
        accept_task: Mutex::new(Some(accept_task)),
        closed: AtomicBool::new(false),
    }))
}

#[allow(clippy::too_many_arguments)]
async fn run_tunnel(
    listener: TcpListener,
    transport: Arc<dyn SshTransport>,
    tunnels: SingleFlight<Arc<TunnelHandle>>,
    id: u64,
    name: String,
    remote_host: String,
    remote_port: u16,
    monitor_interval: Duration,
    cancel_token: CancellationToken,
) {
    // The handle is registered only after this task starts.
    let mut monitor =
        tokio::time::interval_at(tokio::time::Instant::now() + monitor_interval, monitor_interval);
    monitor.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                tracing::debug!(tunnel = %name, "Tunnel listener stopped");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((local_stream, peer_addr)) => {
                        tracing::debug!(tunnel = %name, peer = %peer_addr, "New tunnel connection");
                        let transport = Arc::clone(&transport);
                        let remote_host = remote_host.clone();
                        let cancel = cancel_token.clone();
                        let name = name.clone();
                        tokio::spawn(async move {
                            if let Err(e) =
                                forward_connection(local_stream, transport, &remote_host, remote_port, cancel).await
                            {
                                tracing::warn!(tunnel = %name, error = %e, "Tunnel forwarding error");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!(tunnel = %name, error = %e, "Failed to accept tunnel connection");
                    }
                }
            }
            _ = monitor.tick() => {
                if transport.is_closed().await {
                    tracing::warn!(tunnel = %name, "SSH session ended, removing tunnel");
                    tunnels.remove_if(&name, |handle| handle.id == id);
                    transport.close().await;
                    break;
                }
            }
        }
    }
}

async fn forward_connection(
    mut local_stream: TcpStream,
    transport: Arc<dyn SshTransport>,
    remote_host: &str,
    remote_port: u16,
    cancel_token: CancellationToken,
) -> DbmuxResult<()> {
    let mut channel = transport.open_forward(remote_host, remote_port).await?;

    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut local_stream, &mut channel) => {
            match copied {
                Ok((sent, received)) => {
                    tracing::debug!(sent, received, "Tunnel connection finished");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Tunnel connection ended with error");
                }
            }
        }
        _ = cancel_token.cancelled() => {}
    }
    Ok(())
}

// ========== russh transport ==========

/// SSH client handler for russh.
struct SshClientHandler;

#[async_trait]
impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // TODO: verify against known_hosts once host key configuration exists
        Ok(true)
    }
}

/// Connects with russh, honoring keepalive settings.
#[derive(Debug, Default)]
pub struct RusshConnector {
    home: Option<PathBuf>,
}

impl RusshConnector {
    /// Create a connector that expands `~` to the current user's home.
    pub fn new() -> Self {
        Self { home: dirs::home_dir() }
    }

    fn client_config(config: &SshConfig) -> client::Config {
        client::Config {
            keepalive_interval: config
                .keep_alive
                .then(|| Duration::from_millis(config.keep_alive_interval_ms)),
            keepalive_max: 3,
            ..Default::default()
        }
    }

    fn load_key(pem: &str, passphrase: Option<&str>) -> DbmuxResult<Arc<KeyPair>> {
        let key = russh_keys::decode_secret_key(pem, passphrase).map_err(|e| {
            let hint = if passphrase.is_some() {
                "Check your key passphrase is correct"
            } else {
                "The key may be encrypted - provide the passphrase"
            };
            DbmuxError::tunnel_with_hint(format!("Failed to load SSH key: {e}"), hint)
        })?;
        Ok(Arc::new(key))
    }

    async fn authenticate(
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
        auth: SshAuth,
    ) -> DbmuxResult<bool> {
        match auth {
            SshAuth::InlineKey { pem, passphrase } => {
                let key = Self::load_key(&pem, passphrase.as_deref())?;
                Ok(handle.authenticate_publickey(username, key).await?)
            }
            SshAuth::KeyFile { path, passphrase } => {
                let pem = tokio::fs::read_to_string(&path).await.map_err(|e| {
                    DbmuxError::tunnel_with_hint(
                        format!("Failed to read SSH key file '{}': {e}", path.display()),
                        "Check that the key file exists and is readable",
                    )
                })?;
                let key = Self::load_key(&pem, passphrase.as_deref())?;
                Ok(handle.authenticate_publickey(username, key).await?)
            }
            SshAuth::Password(password) => {
                Ok(handle.authenticate_password(username, password).await?)
            }
            SshAuth::Agent => Self::authenticate_with_agent(handle, username).await,
        }
    }

    #[cfg(unix)]
    async fn authenticate_with_agent(
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> DbmuxResult<bool> {
        use russh_keys::agent::client::AgentClient;
        use tokio::net::UnixStream;

        let socket_path = std::env::var("SSH_AUTH_SOCK").map_err(|_| {
            DbmuxError::tunnel_with_hint(
                "No SSH credentials configured and SSH agent not available",
                "Set a password or private key, or start an agent with: eval $(ssh-agent)",
            )
        })?;
        let stream = UnixStream::connect(&socket_path).await.map_err(|e| {
            DbmuxError::tunnel_with_hint(
                format!("Failed to connect to SSH agent: {e}"),
                "Ensure your SSH agent is running",
            )
        })?;

        let mut agent = AgentClient::connect(stream);
        let identities = agent.request_identities().await?;
        if identities.is_empty() {
            return Err(DbmuxError::tunnel_with_hint(
                "No identities available in SSH agent",
                "Add your SSH key to the agent with: ssh-add",
            ));
        }

        for identity in identities {
            let (returned, result) = handle.authenticate_future(username, identity, agent).await;
            agent = returned;
            match result {
                Ok(true) => return Ok(true),
                Ok(false) => tracing::debug!("SSH agent key rejected, trying next"),
                Err(e) => tracing::debug!(error = %e, "SSH agent auth error, trying next"),
            }
        }
        Ok(false)
    }

    #[cfg(not(unix))]
    async fn authenticate_with_agent(
        _handle: &mut client::Handle<SshClientHandler>,
        _username: &str,
    ) -> DbmuxResult<bool> {
        Err(DbmuxError::tunnel_with_hint(
            "No SSH credentials configured",
            "Set a password or private key for the tunnel",
        ))
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, config: &SshConfig) -> DbmuxResult<Arc<dyn SshTransport>> {
        let auth = resolve_auth(config, self.home.as_deref())?;
        tracing::debug!(host = %config.host, port = config.port, auth = ?auth, "Connecting to SSH server");

        let client_config = Arc::new(Self::client_config(config));
        let mut handle =
            client::connect(client_config, (config.host.as_str(), config.port), SshClientHandler)
                .await
                .map_err(|e| {
                    DbmuxError::tunnel_with_hint(
                        format!("Failed to connect to SSH server {}:{}: {e}", config.host, config.port),
                        "Verify the SSH server is running and reachable",
                    )
                })?;

        if !Self::authenticate(&mut handle, &config.username, auth).await? {
            return Err(DbmuxError::tunnel_with_hint(
                format!("SSH authentication failed for {}@{}", config.username, config.host),
                "Check your SSH username and credentials",
            ));
        }

        tracing::info!(user = %config.username, host = %config.host, "SSH authentication successful");
        Ok(Arc::new(RusshTransport { handle: Mutex::new(handle), closed: AtomicBool::new(false) }))
    }
}

/// Authenticated russh session.
struct RusshTransport {
    handle: Mutex<client::Handle<SshClientHandler>>,
    closed: AtomicBool,
}

#[async_trait]
impl SshTransport for RusshTransport {
    async fn open_forward(&self, host: &str, port: u16) -> DbmuxResult<Box<dyn TunnelStream>> {
        let channel = {
            let handle = self.handle.lock().await;
            handle
                .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
                .await
                .map_err(|e| {
                    DbmuxError::tunnel_with_hint(
                        format!("Failed to open SSH channel: {e}"),
                        "The SSH server may not allow TCP forwarding",
                    )
                })?
        };
        Ok(Box::new(channel.into_stream()))
    }

    async fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.handle.lock().await.is_closed()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self.handle.lock().await;
        if let Err(e) = handle.disconnect(russh::Disconnect::ByApplication, "", "en").await {
            tracing::debug!(error = %e, "SSH disconnect failed");
        }
    }
}
