//! Runtime configuration and the named-connection catalog.
//!
//! Configuration is read from a JSON file with `${VAR}` / `${VAR:-default}`
//! references resolved in connection fields, then adjusted by `DBMUX_*`
//! environment overrides.

use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use parking_lot::RwLock;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};

use crate::error::{DbmuxError, DbmuxResult};
use crate::models::{ConnectionConfig, ConnectionSummary, NamedConnection, SchemaCacheConfig};

/// Name given to the only connection in single-connection mode.
pub const SINGLE_CONNECTION_NAME: &str = "default";

/// Default idle timeout for sessions (1 hour).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 3600;

/// Default period of the idle-session sweep (5 minutes).
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 300;

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env reference regex")
});

/// Session-mode settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    /// Idle time after which a session is closed by the sweep
    pub timeout_secs: u64,
    /// Period of the idle sweep; 0 disables it
    pub cleanup_interval_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_SESSION_TIMEOUT_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
        }
    }
}

impl SessionSettings {
    /// Idle timeout as a duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Sweep period as a duration, or `None` when the sweep is disabled.
    pub fn cleanup_interval(&self) -> Option<Duration> {
        (self.cleanup_interval_secs > 0).then(|| Duration::from_secs(self.cleanup_interval_secs))
    }
}

/// Global settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Allow write statements on pool connections
    pub allow_write: bool,
    /// Regex patterns of statements that bypass the write gate
    pub ddl_whitelist: Vec<String>,
    /// Session-mode settings
    pub session: SessionSettings,
    /// Schema cache settings
    pub schema_cache: SchemaCacheConfig,
}

/// Complete runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbmuxConfig {
    /// Named connections for pool mode
    #[serde(default)]
    pub databases: Vec<NamedConnection>,
    /// Global settings
    #[serde(default)]
    pub settings: Settings,
}

impl DbmuxConfig {
    /// Wrap one connection as a single-connection configuration.
    pub fn single(config: ConnectionConfig) -> Self {
        let settings = Settings { allow_write: config.allow_write, ..Settings::default() };
        Self {
            databases: vec![NamedConnection::new(SINGLE_CONNECTION_NAME, config).as_default()],
            settings,
        }
    }

    /// Load, resolve and validate a configuration file.
    pub fn load(path: &Path) -> DbmuxResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DbmuxError::config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        let mut config = Self::from_json(&content)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;

        tracing::info!(
            path = %path.display(),
            databases = config.databases.len(),
            allow_write = config.settings.allow_write,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Parse JSON and resolve `${VAR}` references from the process
    /// environment. Does not validate.
    pub fn from_json(content: &str) -> DbmuxResult<Self> {
        let mut config: Self = serde_json::from_str(content)
            .map_err(|e| DbmuxError::config(format!("Failed to parse config: {e}")))?;
        config.resolve_env_refs(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Resolve `${VAR}` references in connection and SSH fields.
    pub fn resolve_env_refs(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for db in &mut self.databases {
            let config = &mut db.config;
            for field in [
                &mut config.host,
                &mut config.user,
                &mut config.password,
                &mut config.database,
            ] {
                resolve_field(field, &lookup);
            }
            if let Some(ssh) = &mut config.ssh {
                ssh.host = expand_env_refs(&ssh.host, &lookup);
                ssh.username = expand_env_refs(&ssh.username, &lookup);
                resolve_field(&mut ssh.password, &lookup);
                resolve_field(&mut ssh.passphrase, &lookup);
                resolve_field(&mut ssh.private_key_content, &lookup);
                if let Some(path) = &mut ssh.private_key {
                    if let Some(text) = path.to_str() {
                        *path = expand_env_refs(text, &lookup).into();
                    }
                }
            }
        }
    }

    /// Apply `DBMUX_*` overrides. Unparseable values are logged and ignored.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("DBMUX_ALLOW_WRITE") {
            match parse_bool(&value) {
                Some(allow) => self.settings.allow_write = allow,
                None => tracing::warn!(value = %value, "Ignoring invalid DBMUX_ALLOW_WRITE"),
            }
        }
        override_secs(&lookup, "DBMUX_SESSION_TIMEOUT_SECS", &mut self.settings.session.timeout_secs);
        override_secs(
            &lookup,
            "DBMUX_SESSION_CLEANUP_INTERVAL_SECS",
            &mut self.settings.session.cleanup_interval_secs,
        );
        override_secs(&lookup, "DBMUX_SCHEMA_CACHE_TTL_SECS", &mut self.settings.schema_cache.ttl_secs);
    }

    /// Check that at least one connection is configured, names are unique
    /// and every connection is well formed.
    pub fn validate(&self) -> DbmuxResult<()> {
        if self.databases.is_empty() {
            return Err(DbmuxError::config("At least one database connection must be configured"));
        }

        let mut seen = HashSet::new();
        for db in &self.databases {
            if db.name.trim().is_empty() {
                return Err(DbmuxError::config("Connection names must not be empty"));
            }
            if !seen.insert(db.name.as_str()) {
                return Err(DbmuxError::config(format!("Duplicate connection name '{}'", db.name)));
            }
            db.config
                .validate()
                .map_err(|e| DbmuxError::config(format!("Connection '{}': {e}", db.name)))?;
        }
        Ok(())
    }

    /// Whether this configuration holds exactly one connection.
    pub fn is_single(&self) -> bool {
        self.databases.len() == 1
    }
}

fn resolve_field(field: &mut Option<String>, lookup: &impl Fn(&str) -> Option<String>) {
    if let Some(value) = field {
        *value = expand_env_refs(value, lookup);
    }
}

/// Replace `${VAR}` and `${VAR:-default}` in `value`. References with no value
/// and no default are left as written.
pub fn expand_env_refs(value: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    ENV_REF
        .replace_all(value, |caps: &Captures| {
            let name = &caps[1];
            match (lookup(name), caps.get(2)) {
                (Some(resolved), _) => resolved,
                (None, Some(default)) => default.as_str().to_string(),
                (None, None) => {
                    tracing::warn!(var = %name, "Environment variable not set, keeping reference");
                    caps[0].to_string()
                }
            }
        })
        .into_owned()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn override_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, target: &mut u64) {
    if let Some(value) = lookup(key) {
        match value.trim().parse::<u64>() {
            Ok(secs) => *target = secs,
            Err(_) => tracing::warn!(key, value = %value, "Ignoring invalid duration override"),
        }
    }
}

/// The configured named connections and the current-connection pointer.
#[derive(Debug)]
pub struct ConnectionCatalog {
    connections: Vec<NamedConnection>,
    current: RwLock<String>,
}

impl ConnectionCatalog {
    /// Build a catalog. The current connection starts at the one marked
    /// default, else the first.
    pub fn new(connections: Vec<NamedConnection>) -> DbmuxResult<Self> {
        let initial = connections
            .iter()
            .find(|c| c.is_default)
            .or_else(|| connections.first())
            .map(|c| c.name.clone())
            .ok_or_else(|| DbmuxError::config("At least one database connection must be configured"))?;
        Ok(Self { connections, current: RwLock::new(initial) })
    }

    /// Look up a connection by name.
    pub fn get(&self, name: &str) -> DbmuxResult<&NamedConnection> {
        self.connections
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| DbmuxError::connection_name_not_found(name, self.names()))
    }

    /// Look up `name`, or the current connection when omitted.
    pub fn resolve(&self, name: Option<&str>) -> DbmuxResult<&NamedConnection> {
        match name {
            Some(name) => self.get(name),
            None => {
                let current = self.current_name();
                self.get(&current)
            }
        }
    }

    /// Name of the current connection.
    pub fn current_name(&self) -> String {
        self.current.read().clone()
    }

    /// Point the current connection at `name`.
    pub fn switch_database(&self, name: &str) -> DbmuxResult<()> {
        self.get(name)?;
        let mut current = self.current.write();
        if *current != name {
            tracing::info!(from = %current, to = %name, "Switched current connection");
            *current = name.to_string();
        }
        Ok(())
    }

    /// Summaries of every configured connection.
    pub fn list_databases(&self) -> Vec<ConnectionSummary> {
        let current = self.current_name();
        self.connections
            .iter()
            .map(|c| ConnectionSummary {
                name: c.name.clone(),
                db_type: c.config.db_type,
                description: c.description.clone(),
                is_default: c.is_default,
                is_current: c.name == current,
            })
            .collect()
    }

    /// Configured names, in configuration order.
    pub fn names(&self) -> Vec<String> {
        self.connections.iter().map(|c| c.name.clone()).collect()
    }

    /// All configured connections.
    pub fn connections(&self) -> &[NamedConnection] {
        &self.connections
    }
}
