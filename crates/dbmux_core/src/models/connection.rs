//! Connection configuration models.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Backend type tag used to pick an adapter constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    /// MySQL
    Mysql,
    /// PostgreSQL
    #[serde(alias = "postgresql")]
    Postgres,
    /// Redis
    Redis,
    /// Oracle
    Oracle,
    /// Dameng
    Dm,
    /// Microsoft SQL Server
    #[serde(alias = "mssql")]
    Sqlserver,
    /// MongoDB
    Mongodb,
    /// SQLite file database
    Sqlite,
    /// KingbaseES (PostgreSQL wire compatible)
    Kingbase,
    /// GaussDB / openGauss (PostgreSQL wire compatible)
    #[serde(alias = "opengauss")]
    Gaussdb,
    /// OceanBase (MySQL mode)
    Oceanbase,
    /// TiDB
    Tidb,
    /// ClickHouse
    Clickhouse,
    /// PolarDB
    Polardb,
    /// Vastbase (PostgreSQL wire compatible)
    Vastbase,
    /// HighGo (PostgreSQL wire compatible)
    Highgo,
    /// GoldenDB
    Goldendb,
}

impl DatabaseType {
    /// All known backend tags.
    pub const ALL: [DatabaseType; 17] = [
        Self::Mysql,
        Self::Postgres,
        Self::Redis,
        Self::Oracle,
        Self::Dm,
        Self::Sqlserver,
        Self::Mongodb,
        Self::Sqlite,
        Self::Kingbase,
        Self::Gaussdb,
        Self::Oceanbase,
        Self::Tidb,
        Self::Clickhouse,
        Self::Polardb,
        Self::Vastbase,
        Self::Highgo,
        Self::Goldendb,
    ];

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Postgres => "postgres",
            Self::Redis => "redis",
            Self::Oracle => "oracle",
            Self::Dm => "dm",
            Self::Sqlserver => "sqlserver",
            Self::Mongodb => "mongodb",
            Self::Sqlite => "sqlite",
            Self::Kingbase => "kingbase",
            Self::Gaussdb => "gaussdb",
            Self::Oceanbase => "oceanbase",
            Self::Tidb => "tidb",
            Self::Clickhouse => "clickhouse",
            Self::Polardb => "polardb",
            Self::Vastbase => "vastbase",
            Self::Highgo => "highgo",
            Self::Goldendb => "goldendb",
        }
    }

    /// Parse from string representation, accepting common aliases.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "mssql" => Some(Self::Sqlserver),
            "opengauss" => Some(Self::Gaussdb),
            "postgresql" => Some(Self::Postgres),
            other => Self::ALL.into_iter().find(|t| t.as_str() == other),
        }
    }

    /// Default server port for the backend, if it is network based.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Mysql | Self::Polardb | Self::Goldendb => Some(3306),
            Self::Postgres | Self::Vastbase => Some(5432),
            Self::Redis => Some(6379),
            Self::Oracle => Some(1521),
            Self::Dm => Some(5236),
            Self::Sqlserver => Some(1433),
            Self::Mongodb => Some(27017),
            Self::Sqlite => None,
            Self::Kingbase => Some(54321),
            Self::Gaussdb => Some(8000),
            Self::Oceanbase => Some(2881),
            Self::Tidb => Some(4000),
            Self::Clickhouse => Some(8123),
            Self::Highgo => Some(5866),
        }
    }

    /// Cheap statement that proves a live connection for health probes.
    pub fn probe_query(&self) -> &'static str {
        match self {
            Self::Redis => "PING",
            Self::Mongodb => r#"{"operation": "ping"}"#,
            Self::Oracle | Self::Dm => "SELECT 1 FROM DUAL",
            _ => "SELECT 1",
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

fn default_keep_alive_interval_ms() -> u64 {
    60_000
}

/// SSH forwarding settings for a connection.
///
/// Authentication priority: `private_key_content`, then `private_key` (a file
/// path, `~` allowed), then `password`, then the default key in `~/.ssh`.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    /// Whether the tunnel should be used
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// SSH server hostname
    pub host: String,
    /// SSH server port (default 22)
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// SSH username
    pub username: String,
    /// Password authentication
    #[serde(default)]
    pub password: Option<String>,
    /// Private key file path
    #[serde(default)]
    pub private_key: Option<PathBuf>,
    /// Inline private key (PEM / OpenSSH format)
    #[serde(default)]
    pub private_key_content: Option<String>,
    /// Passphrase for an encrypted private key
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Send keepalive messages on the SSH session
    #[serde(default = "default_true")]
    pub keep_alive: bool,
    /// Keepalive interval in milliseconds
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
}

impl SshConfig {
    /// Create a new SSH configuration with no credentials set.
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            enabled: true,
            host: host.into(),
            port: default_ssh_port(),
            username: username.into(),
            password: None,
            private_key: None,
            private_key_content: None,
            passphrase: None,
            keep_alive: true,
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
        }
    }

    /// Set the port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set password authentication.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set key file authentication.
    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }

    /// Set inline key authentication.
    pub fn with_key_content(mut self, pem: impl Into<String>) -> Self {
        self.private_key_content = Some(pem.into());
        self
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("private_key", &self.private_key)
            .field("private_key_content", &self.private_key_content.as_ref().map(|_| "****"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "****"))
            .field("keep_alive", &self.keep_alive)
            .field("keep_alive_interval_ms", &self.keep_alive_interval_ms)
            .finish()
    }
}

/// Parameters needed to build and connect one adapter.
///
/// Used inline by session mode and embedded in [`NamedConnection`] for pool mode.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Backend tag
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    /// Server hostname or IP
    #[serde(default)]
    pub host: Option<String>,
    /// Server port
    #[serde(default)]
    pub port: Option<u16>,
    /// Login username
    #[serde(default)]
    pub user: Option<String>,
    /// Login password
    #[serde(default)]
    pub password: Option<String>,
    /// Database (or schema / keyspace) name
    #[serde(default)]
    pub database: Option<String>,
    /// Database file path (SQLite)
    #[serde(default)]
    pub file_path: Option<PathBuf>,
    /// Authentication database (MongoDB)
    #[serde(default)]
    pub auth_source: Option<String>,
    /// Allow write statements through the safety gate
    #[serde(default)]
    pub allow_write: bool,
    /// Optional SSH tunnel settings
    #[serde(default, rename = "ssh")]
    pub ssh: Option<SshConfig>,
}

impl ConnectionConfig {
    /// Create a new configuration for a backend with everything else unset.
    pub fn new(db_type: DatabaseType) -> Self {
        Self {
            db_type,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            file_path: None,
            auth_source: None,
            allow_write: false,
            ssh: None,
        }
    }

    /// Create a configuration for a SQLite file.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(DatabaseType::Sqlite);
        config.file_path = Some(path.into());
        config
    }

    /// Set host and port.
    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some(host.into());
        self.port = Some(port);
        self
    }

    /// Set user and password.
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Set the database name.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the SSH tunnel.
    pub fn with_ssh(mut self, ssh: SshConfig) -> Self {
        self.ssh = Some(ssh);
        self
    }

    /// Set whether write statements are allowed.
    pub fn with_allow_write(mut self, allow_write: bool) -> Self {
        self.allow_write = allow_write;
        self
    }

    /// Host to connect to, defaulting to localhost.
    pub fn host_or_default(&self) -> &str {
        self.host.as_deref().unwrap_or("localhost")
    }

    /// Port to connect to, defaulting to the backend's standard port.
    pub fn port_or_default(&self) -> Option<u16> {
        self.port.or_else(|| self.db_type.default_port())
    }

    /// The SSH settings, if present and enabled.
    pub fn active_ssh(&self) -> Option<&SshConfig> {
        self.ssh.as_ref().filter(|ssh| ssh.enabled)
    }

    /// Copy of this configuration pointed at a local tunnel endpoint.
    pub fn through_tunnel(&self, local_port: u16) -> Self {
        let mut config = self.clone();
        config.host = Some("127.0.0.1".to_string());
        config.port = Some(local_port);
        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.db_type == DatabaseType::Sqlite {
            if self.file_path.is_none() {
                return Err("SQLite connections require a file path".to_string());
            }
        } else if self.port_or_default().is_none() {
            return Err(format!("Port is required for {} connections", self.db_type));
        }
        if let Some(ssh) = self.active_ssh() {
            if ssh.host.is_empty() {
                return Err("SSH host is required when the tunnel is enabled".to_string());
            }
            if ssh.username.is_empty() {
                return Err("SSH username is required when the tunnel is enabled".to_string());
            }
        }
        Ok(())
    }

    /// Get the display connection string (without password).
    pub fn display_url(&self) -> String {
        if let Some(path) = &self.file_path {
            return format!("{}://{}", self.db_type, path.display());
        }
        let user = self.user.as_deref().map(|u| format!("{u}@")).unwrap_or_default();
        let port = self.port_or_default().map(|p| format!(":{p}")).unwrap_or_default();
        let database = self.database.as_deref().unwrap_or_default();
        format!("{}://{}{}{}/{}", self.db_type, user, self.host_or_default(), port, database)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("db_type", &self.db_type)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "****"))
            .field("database", &self.database)
            .field("file_path", &self.file_path)
            .field("auth_source", &self.auth_source)
            .field("allow_write", &self.allow_write)
            .field("ssh", &self.ssh)
            .finish()
    }
}

/// A configured connection addressed by a unique name (pool mode).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedConnection {
    /// Unique connection name
    pub name: String,
    /// Connection parameters
    #[serde(flatten)]
    pub config: ConnectionConfig,
    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,
    /// Whether this is the initially active connection
    #[serde(default)]
    pub is_default: bool,
}

impl NamedConnection {
    /// Create a named connection.
    pub fn new(name: impl Into<String>, config: ConnectionConfig) -> Self {
        Self { name: name.into(), config, description: None, is_default: false }
    }

    /// Mark this connection as the default.
    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }
}

/// Listing entry for a configured connection (no secrets).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    /// Connection name
    pub name: String,
    /// Backend tag
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    /// Free-form description
    pub description: Option<String>,
    /// Whether this is the configured default
    pub is_default: bool,
    /// Whether this is the currently active connection
    pub is_current: bool,
}
