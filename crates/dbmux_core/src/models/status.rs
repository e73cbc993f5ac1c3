//! Runtime status reports for pooled connections, sessions and tunnels.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::connection::DatabaseType;
use crate::models::schema::SchemaCacheStats;

/// Result of probing one configured connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    /// Connection name
    pub name: String,
    /// Backend tag
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    /// Whether the probe succeeded
    pub connected: bool,
    /// Probe round trip in milliseconds, when connected
    pub response_time_ms: Option<u64>,
    /// When the probe ran
    pub last_checked: DateTime<Utc>,
    /// Failure message, when not connected
    pub error: Option<String>,
}

/// Pool entry state for one configured connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryState {
    /// Not opened
    Idle,
    /// Creation in flight
    Connecting,
    /// Adapter open and cached
    Connected,
}

/// Pool status for one configured connection.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    /// Connection name
    pub name: String,
    /// Backend tag
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    /// Entry state
    pub state: EntryState,
    /// Whether the connection goes through an SSH tunnel
    pub tunneled: bool,
    /// Whether this is the current connection
    pub is_current: bool,
}

/// Session listing entry (no secrets).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    /// Session identifier
    pub id: String,
    /// Backend tag
    #[serde(rename = "type")]
    pub db_type: DatabaseType,
    /// Connection string without password
    pub target: String,
    /// When the session was opened
    pub created_at: DateTime<Utc>,
    /// Last time the session was used
    pub last_accessed_at: DateTime<Utc>,
    /// Whether the session owns an SSH tunnel
    pub tunneled: bool,
    /// Schema cache statistics for the session
    pub cache: SchemaCacheStats,
}

/// SSH tunnel listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelInfo {
    /// Tunnel key (connection name or session id)
    pub name: String,
    /// Local forwarding port on 127.0.0.1
    pub local_port: u16,
    /// SSH server host
    pub ssh_host: String,
    /// SSH server port
    pub ssh_port: u16,
    /// Forwarding target host
    pub remote_host: String,
    /// Forwarding target port
    pub remote_port: u16,
    /// When the tunnel was established
    pub established_at: DateTime<Utc>,
}
