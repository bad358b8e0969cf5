//! Server and per-connection configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::fetch::DEFAULT_FETCH_TTL;
use crate::writer::WriterConfig;

/// Default listen address.
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9000";

/// Default websocket route.
pub const DEFAULT_PATH: &str = "/api/data";

/// Settings applied to every connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// How long a fetch may stay in flight; also the sweep period.
    pub fetch_ttl: Duration,
    /// Outbound queue settings.
    pub writer: WriterConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            fetch_ttl: DEFAULT_FETCH_TTL,
            writer: WriterConfig::default(),
        }
    }
}

/// Settings for the listening server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Route that accepts websocket upgrades.
    pub path: String,
    pub connection: ConnectionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            path: DEFAULT_PATH.to_string(),
            connection: ConnectionConfig::default(),
        }
    }
}
