//! Backend services for dbmux.
//!
//! This module contains the multiplexer core:
//! - `safety` - Write classification and the query guard
//! - `schema` - Per-connection schema cache with TTL
//! - `database` - Gate + adapter + cache facade for one connection
//! - `singleflight` - Keyed single in-flight creation
//! - `ssh_tunnel` - Local port forwarding over SSH
//! - `pool` - Named connection pool
//! - `session` - Session registry with idle expiry

pub mod database;
pub mod pool;
pub mod safety;
pub mod schema;
pub mod session;
pub mod singleflight;
pub mod ssh_tunnel;

pub use database::DatabaseService;
pub use pool::{ConnectionPool, PoolEntry};
pub use safety::{DangerousPattern, QueryGuard};
pub use schema::SchemaCache;
pub use session::{Session, SessionManager};
pub use singleflight::SingleFlight;
pub use ssh_tunnel::{RusshConnector, SshConnector, SshTransport, TunnelManager};
