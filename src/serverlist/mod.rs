//! Server List
//!
//! The upstream list is fetched, merged with the region's custom servers and
//! re-served locally so the game client sees relay addresses instead of the
//! real game servers.

pub mod endpoint;
pub mod file;
pub mod http;

pub use endpoint::ListEndpoint;
pub use file::FileServerList;
pub use http::HttpServerList;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

use crate::config::CustomServerEntry;

/// One upstream server entry; only `ip` and `port` are interpreted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub ip: String,
    pub port: u16,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ServerInfo {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            extra: serde_json::Map::new(),
        }
    }
}

/// Server identifier to upstream address
pub type ServerMap = BTreeMap<String, ServerInfo>;

/// Errors from fetching or serving the list
#[derive(Debug, Error)]
pub enum ListError {
    #[error("list port {port} is already in use")]
    PortInUse {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("failed to fetch server list from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("server list at {url} answered with status {status}")]
    Status { url: String, status: u16 },

    #[error("failed to parse server list from {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("server list I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ListError {
    /// Classify a bind failure on the list-serving port
    pub fn from_bind(port: u16, err: io::Error) -> Self {
        let in_use = err.kind() == io::ErrorKind::AddrInUse
            || (cfg!(windows) && err.kind() == io::ErrorKind::PermissionDenied);
        if in_use {
            ListError::PortInUse { port, source: err }
        } else {
            ListError::Io(err)
        }
    }
}

/// Fetches the upstream list and serves the overridden copy
pub trait ServerListSource {
    /// Retrieve the upstream list, merged across every configured path
    fn fetch(&mut self) -> impl Future<Output = Result<ServerMap, ListError>> + Send;

    /// Start serving the overridden list on `ip`; resolves once listening
    fn listen(&mut self, ip: IpAddr) -> impl Future<Output = Result<SocketAddr, ListError>> + Send;

    /// Stop serving; safe to call more than once
    fn close(&mut self);
}

/// Rewrite custom servers to point at their local relays
pub fn apply_overrides(
    list: &ServerMap,
    custom: &BTreeMap<String, CustomServerEntry>,
) -> ServerMap {
    let mut overridden = list.clone();
    for (id, entry) in custom {
        if let Some(server) = overridden.get_mut(id) {
            let addr = entry.listen_addr();
            server.ip = addr.ip().to_string();
            server.port = addr.port();
        }
    }
    overridden
}
