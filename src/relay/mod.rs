//! Game Session Relay
//!
//! One [`ConnectionRelay`] per custom server listens locally and relays each
//! accepted client to the real server through a [`RelaySession`].

pub mod listener;
pub mod registry;
pub mod session;

pub use listener::ConnectionRelay;
pub use registry::RelayRegistry;
pub use session::{RelaySession, SessionEnd, SessionState, SessionSummary};

use std::fmt;
use std::time::Duration;

use crate::config::ProxyConfig;
use crate::serverlist::ServerMap;

/// Socket settings shared by every relay
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub connect_timeout: Duration,
    pub buffer_size: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self::from(&ProxyConfig::default())
    }
}

impl From<&ProxyConfig> for RelaySettings {
    fn from(config: &ProxyConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            buffer_size: config.buffer_size,
        }
    }
}

/// Real address of a game server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTarget {
    pub server_id: String,
    pub host: String,
    pub port: u16,
}

impl ServerTarget {
    pub fn new(server_id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            server_id: server_id.into(),
            host: host.into(),
            port,
        }
    }

    /// Look up a custom server identifier in the fetched upstream list
    pub fn resolve(server_id: &str, upstream: &ServerMap) -> Option<Self> {
        upstream
            .get(server_id)
            .map(|info| Self::new(server_id, info.ip.clone(), info.port))
    }
}

impl fmt::Display for ServerTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
