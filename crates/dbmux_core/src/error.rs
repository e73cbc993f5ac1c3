//! Error types for dbmux.
//!
//! Every failure the core surfaces is a [`DbmuxError`]. The type is `Clone` so
//! that one failed connection attempt can be delivered to every task waiting on
//! the same in-flight creation.

use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type DbmuxResult<T> = Result<T, DbmuxError>;

/// Shareable wrapper around an underlying error so `DbmuxError` stays `Clone`.
#[derive(Clone)]
pub struct SharedSource(Arc<dyn std::error::Error + Send + Sync>);

impl SharedSource {
    fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self(Arc::new(err))
    }
}

impl fmt::Debug for SharedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for SharedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for SharedSource {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

/// Main error type for dbmux.
#[derive(Debug, Clone, Error)]
pub enum DbmuxError {
    /// Adapter connect, authentication or network failure.
    #[error("Connection error: {message}")]
    Connection {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the operator.
        hint: Option<String>,
        /// Optional underlying error.
        #[source]
        cause: Option<SharedSource>,
    },

    /// SSH authentication failure, missing key file or local bind failure.
    #[error("SSH tunnel error: {message}")]
    Tunnel {
        /// Human-readable error message.
        message: String,
        /// Actionable hint for the operator.
        hint: Option<String>,
        /// Optional underlying error.
        #[source]
        cause: Option<SharedSource>,
    },

    /// No session is registered under this id.
    #[error("Session {session_id} does not exist")]
    SessionNotFound {
        /// The id that was looked up.
        session_id: String,
    },

    /// The session existed but was removed by the idle sweep.
    #[error("Session {session_id} has expired")]
    SessionExpired {
        /// The id that was looked up.
        session_id: String,
    },

    /// Pool mode: no named connection with this name is configured.
    #[error("Connection '{name}' does not exist. Available connections: {}", .available.join(", "))]
    ConnectionNameNotFound {
        /// Requested name.
        name: String,
        /// Names that are configured.
        available: Vec<String>,
    },

    /// The query safety gate rejected the statement.
    #[error("Write blocked: {message}")]
    WriteBlocked {
        /// Leading keyword that classified the statement as a write.
        keyword: String,
        /// Higher-risk shape detected in the statement, if any.
        pattern: Option<String>,
        /// Full operator-facing explanation.
        message: String,
    },

    /// Table lookup against the cached schema failed.
    #[error("Table \"{table}\" does not exist")]
    TableNotFound {
        /// Requested table name.
        table: String,
    },

    /// Query execution error reported by the backend.
    #[error("{message}")]
    Query {
        /// Backend error message.
        message: String,
        /// Backend error code (e.g., "42P01").
        code: Option<String>,
        /// Additional detail from the backend.
        detail: Option<String>,
        /// Backend hint.
        hint: Option<String>,
    },

    /// Schema introspection failed.
    #[error("Schema error: {message}")]
    Schema {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error.
        #[source]
        cause: Option<SharedSource>,
    },

    /// Invalid or unreadable configuration.
    #[error("Config error: {message}")]
    Config {
        /// Human-readable error message.
        message: String,
    },

    /// No adapter constructor is registered for the backend tag.
    #[error("Unsupported database type: {db_type}")]
    UnsupportedBackend {
        /// The backend tag.
        db_type: String,
    },

    /// Optional adapter capability that the backend does not implement.
    #[error("{operation} is not supported by the {db_type} adapter")]
    Unsupported {
        /// Capability name (e.g., "beginTransaction").
        operation: String,
        /// The backend tag.
        db_type: String,
    },

    /// Unexpected internal error.
    #[error("Internal error: {message}")]
    Internal {
        /// Human-readable error message.
        message: String,
        /// Optional underlying error.
        #[source]
        cause: Option<SharedSource>,
    },
}

impl DbmuxError {
    // ========== Constructors ==========

    /// Create a new connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), hint: None, cause: None }
    }

    /// Create a new connection error with an actionable hint.
    pub fn connection_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), hint: Some(hint.into()), cause: None }
    }

    /// Create a new connection error with source.
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            hint: None,
            cause: Some(SharedSource::new(source)),
        }
    }

    /// Create a new tunnel error.
    pub fn tunnel(message: impl Into<String>) -> Self {
        Self::Tunnel { message: message.into(), hint: None, cause: None }
    }

    /// Create a new tunnel error with source.
    pub fn tunnel_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Tunnel { message: message.into(), hint: None, cause: Some(SharedSource::new(source)) }
    }

    /// Create a new tunnel error with an actionable hint.
    pub fn tunnel_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Tunnel { message: message.into(), hint: Some(hint.into()), cause: None }
    }

    /// Create a new session-not-found error.
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound { session_id: session_id.into() }
    }

    /// Create a new session-expired error.
    pub fn session_expired(session_id: impl Into<String>) -> Self {
        Self::SessionExpired { session_id: session_id.into() }
    }

    /// Create a new unknown-connection-name error.
    pub fn connection_name_not_found(name: impl Into<String>, available: Vec<String>) -> Self {
        Self::ConnectionNameNotFound { name: name.into(), available }
    }

    /// Create a new table-not-found error.
    pub fn table_not_found(table: impl Into<String>) -> Self {
        Self::TableNotFound { table: table.into() }
    }

    /// Create a new query error without backend details.
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query { message: message.into(), code: None, detail: None, hint: None }
    }

    /// Create a new schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema { message: message.into(), cause: None }
    }

    /// Create a new schema error with source.
    pub fn schema_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Schema { message: message.into(), cause: Some(SharedSource::new(source)) }
    }

    /// Create a new config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Create an error for an optional adapter capability that is missing.
    pub fn unsupported(operation: impl Into<String>, db_type: impl Into<String>) -> Self {
        Self::Unsupported { operation: operation.into(), db_type: db_type.into() }
    }

    /// Create a new internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), cause: None }
    }

    /// Create a new internal error with source.
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), cause: Some(SharedSource::new(source)) }
    }

    // ========== Methods ==========

    /// Check if this error came from the query safety gate.
    pub fn is_write_blocked(&self) -> bool {
        matches!(self, Self::WriteBlocked { .. })
    }

    /// Check if this error means the session handle is gone.
    pub fn is_session_gone(&self) -> bool {
        matches!(self, Self::SessionNotFound { .. } | Self::SessionExpired { .. })
    }

    /// Get the error category name.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "Connection",
            Self::Tunnel { .. } => "Tunnel",
            Self::SessionNotFound { .. } | Self::SessionExpired { .. } => "Session",
            Self::ConnectionNameNotFound { .. } => "Config",
            Self::WriteBlocked { .. } => "Safety",
            Self::TableNotFound { .. } | Self::Schema { .. } => "Schema",
            Self::Query { .. } => "Query",
            Self::Config { .. } => "Config",
            Self::UnsupportedBackend { .. } | Self::Unsupported { .. } => "Unsupported",
            Self::Internal { .. } => "Internal",
        }
    }

    /// Get actionable hint for the operator.
    pub fn hint(&self) -> Option<&str> {
        match self {
            Self::Connection { hint, .. } => {
                hint.as_deref().or(Some("Check that the database server is running and reachable"))
            }
            Self::Tunnel { hint, .. } => {
                hint.as_deref().or(Some("Check the SSH host, credentials and key permissions"))
            }
            Self::SessionNotFound { .. } => Some("Open a new session with the connect call"),
            Self::SessionExpired { .. } => {
                Some("The session was idle for too long; open a new session")
            }
            Self::ConnectionNameNotFound { .. } => {
                Some("Use one of the configured connection names")
            }
            Self::WriteBlocked { .. } => {
                Some("Enable writes with the allow_write setting or --danger-allow-write")
            }
            Self::TableNotFound { .. } => Some("Refresh the schema if the table was just created"),
            Self::Query { hint, .. } => hint.as_deref(),
            Self::Schema { .. } => None,
            Self::Config { .. } => Some("Check the configuration file and environment"),
            Self::UnsupportedBackend { .. } => Some("Register an adapter for this database type"),
            Self::Unsupported { .. } => None,
            Self::Internal { .. } => Some("Please report this issue"),
        }
    }

    /// Convert to operator-displayable error info.
    pub fn to_error_info(&self) -> ErrorInfo {
        let error_type = format!("{} Error", self.category());
        let message = self.to_string();
        let hint = self.hint().map(String::from);

        let technical_detail = match self {
            Self::Query { code, detail, .. } => {
                let mut parts = Vec::new();
                if let Some(code) = code {
                    parts.push(format!("Code: {code}"));
                }
                if let Some(detail) = detail {
                    parts.push(format!("Detail: {detail}"));
                }
                if parts.is_empty() {
                    None
                } else {
                    Some(parts.join("\n"))
                }
            }
            Self::WriteBlocked { keyword, pattern, .. } => Some(match pattern {
                Some(pattern) => format!("Keyword: {keyword}\nPattern: {pattern}"),
                None => format!("Keyword: {keyword}"),
            }),
            Self::Connection { cause: Some(cause), .. }
            | Self::Tunnel { cause: Some(cause), .. }
            | Self::Schema { cause: Some(cause), .. }
            | Self::Internal { cause: Some(cause), .. } => Some(cause.to_string()),
            _ => None,
        };

        ErrorInfo { error_type, message, hint, technical_detail }
    }
}

/// Operator-displayable error information.
#[derive(Debug, Clone)]
pub struct ErrorInfo {
    /// Category name (e.g., "Connection Error").
    pub error_type: String,
    /// Human-readable message.
    pub message: String,
    /// Actionable suggestion.
    pub hint: Option<String>,
    /// Technical detail for diagnostics.
    pub technical_detail: Option<String>,
}

// ========== Error Conversions ==========

/// Convert from tokio_postgres::Error to DbmuxError.
impl From<tokio_postgres::Error> for DbmuxError {
    fn from(err: tokio_postgres::Error) -> Self {
        if let Some(db_err) = err.as_db_error() {
            let message = db_err.message().to_string();
            let code_str = db_err.code().code();

            match code_str {
                "28P01" => {
                    return DbmuxError::Connection {
                        message,
                        hint: Some("Invalid password - check your credentials".to_string()),
                        cause: None,
                    }
                }
                "28000" => {
                    return DbmuxError::Connection {
                        message,
                        hint: Some(
                            "Authentication failed - check username and permissions".to_string(),
                        ),
                        cause: None,
                    }
                }
                _ if code_str.starts_with("08") => {
                    return DbmuxError::Connection {
                        message,
                        hint: None,
                        cause: Some(SharedSource::new(err)),
                    }
                }
                _ => {
                    return DbmuxError::Query {
                        message,
                        code: Some(code_str.to_string()),
                        detail: db_err.detail().map(String::from),
                        hint: db_err.hint().map(String::from),
                    }
                }
            }
        }

        if err.is_closed() {
            return DbmuxError::Connection {
                message: "Connection closed".to_string(),
                hint: None,
                cause: Some(SharedSource::new(err)),
            };
        }

        DbmuxError::Connection {
            message: err.to_string(),
            hint: None,
            cause: Some(SharedSource::new(err)),
        }
    }
}

/// Convert from rusqlite::Error to DbmuxError.
impl From<rusqlite::Error> for DbmuxError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, message) => DbmuxError::Query {
                message: message.clone().unwrap_or_else(|| err.to_string()),
                code: Some(format!("{:?}", code.code)),
                detail: None,
                hint: None,
            },
            _ => DbmuxError::Query {
                message: err.to_string(),
                code: None,
                detail: None,
                hint: None,
            },
        }
    }
}

/// Convert from serde_json::Error to DbmuxError.
impl From<serde_json::Error> for DbmuxError {
    fn from(err: serde_json::Error) -> Self {
        DbmuxError::Config { message: format!("JSON error: {err}") }
    }
}

/// Convert from russh::Error to DbmuxError.
impl From<russh::Error> for DbmuxError {
    fn from(err: russh::Error) -> Self {
        DbmuxError::Tunnel {
            message: err.to_string(),
            hint: None,
            cause: Some(SharedSource::new(err)),
        }
    }
}

/// Convert from russh_keys::Error to DbmuxError.
impl From<russh_keys::Error> for DbmuxError {
    fn from(err: russh_keys::Error) -> Self {
        DbmuxError::Tunnel {
            message: format!("Failed to load SSH key: {err}"),
            hint: Some("Check the key format and passphrase".to_string()),
            cause: Some(SharedSource::new(err)),
        }
    }
}

/// Convert from std::io::Error to DbmuxError.
impl From<std::io::Error> for DbmuxError {
    fn from(err: std::io::Error) -> Self {
        DbmuxError::Internal { message: err.to_string(), cause: Some(SharedSource::new(err)) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_clone_and_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = DbmuxError::connection_with_source("Failed to connect", io);
        let cloned = err.clone();

        assert_eq!(err.to_string(), cloned.to_string());
        let source = std::error::Error::source(&cloned).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("refused"));
    }

    #[test]
    fn test_connection_name_not_found_lists_available() {
        let err = DbmuxError::connection_name_not_found(
            "missing",
            vec!["prod".to_string(), "staging".to_string()],
        );
        assert_eq!(
            err.to_string(),
            "Connection 'missing' does not exist. Available connections: prod, staging"
        );
        assert_eq!(err.category(), "Config");
    }

    #[test]
    fn test_every_category_produces_error_info() {
        let errors = vec![
            DbmuxError::connection("x"),
            DbmuxError::tunnel("x"),
            DbmuxError::session_not_found("abc"),
            DbmuxError::session_expired("abc"),
            DbmuxError::table_not_found("users"),
            DbmuxError::query("x"),
            DbmuxError::schema("x"),
            DbmuxError::config("x"),
            DbmuxError::unsupported("commit", "redis"),
            DbmuxError::internal("x"),
        ];

        for err in errors {
            let info = err.to_error_info();
            assert!(info.error_type.ends_with(" Error"));
            assert!(!info.message.is_empty());
        }
    }

    #[test]
    fn test_session_errors_are_distinct() {
        assert!(DbmuxError::session_not_found("a").is_session_gone());
        assert!(DbmuxError::session_expired("a").is_session_gone());
        assert!(matches!(
            DbmuxError::session_expired("a"),
            DbmuxError::SessionExpired { .. }
        ));
    }
}
