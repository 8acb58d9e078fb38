//! Configuration Types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Address a relay binds to when a custom server omits `ip`
pub const DEFAULT_RELAY_IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// Process-level settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Region code selecting an entry of the region table
    pub region: String,
    pub regions_file: PathBuf,
    pub modules_dir: PathBuf,
    /// Hosts file to edit; the platform default when unset
    pub hosts_file: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub buffer_size: usize,
    pub log_level: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            region: "NA".to_string(),
            regions_file: PathBuf::from("regions.toml"),
            modules_dir: PathBuf::from("modules"),
            hosts_file: None,
            shutdown_grace: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            buffer_size: 16 * 1024,
            log_level: "info".to_string(),
        }
    }
}

impl ProxyConfig {
    /// Hosts file path, falling back to the platform location
    pub fn hosts_path(&self) -> PathBuf {
        self.hosts_file
            .clone()
            .unwrap_or_else(crate::hosts::default_hosts_path)
    }
}

/// The full set of supported regions, keyed by region code
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RegionTable {
    #[serde(default)]
    pub regions: BTreeMap<String, RegionDescriptor>,
}

impl RegionTable {
    /// Look up a region by code, case-insensitively
    pub fn get(&self, code: &str) -> Option<RegionDescriptor> {
        self.regions
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(code))
            .map(|(k, region)| {
                let mut region = region.clone();
                region.code = k.clone();
                region
            })
    }

    /// Region codes in table order
    pub fn codes(&self) -> Vec<&str> {
        self.regions.keys().map(String::as_str).collect()
    }
}

/// Immutable per-region deployment profile
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegionDescriptor {
    #[serde(skip)]
    pub code: String,
    /// Full upstream list URL; mutually exclusive with `paths`
    #[serde(default)]
    pub url: Option<String>,
    /// Upstream list paths on `hostname:port`
    #[serde(default)]
    pub paths: Vec<String>,
    /// Hostname the game client resolves for the server list
    pub hostname: String,
    pub port: u16,
    /// Local IP the hostname is redirected to
    pub listen_hostname: IpAddr,
    #[serde(default)]
    pub custom_servers: BTreeMap<String, CustomServerEntry>,
}

/// Where the upstream server list is fetched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListSource {
    Url(String),
    Paths {
        hostname: String,
        port: u16,
        paths: Vec<String>,
    },
}

impl ListSource {
    /// Every upstream URL to fetch, paired with the local path it is served on
    pub fn endpoints(&self) -> Vec<(String, String)> {
        match self {
            ListSource::Url(url) => {
                let path = url_path(url);
                vec![(url.clone(), path)]
            }
            ListSource::Paths {
                hostname,
                port,
                paths,
            } => paths
                .iter()
                .map(|p| (format!("http://{}:{}{}", hostname, port, p), p.clone()))
                .collect(),
        }
    }
}

/// Path component of an http URL, without query string
fn url_path(url: &str) -> String {
    let rest = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url);
    let path = match rest.find('/') {
        Some(idx) => &rest[idx..],
        None => "/",
    };
    let path = path.split(['?', '#']).next().unwrap_or("/");
    if path.is_empty() {
        "/".to_string()
    } else {
        path.to_string()
    }
}

impl RegionDescriptor {
    /// Resolve the list source declared by this region
    pub fn list_source(&self) -> ListSource {
        match &self.url {
            Some(url) => ListSource::Url(url.clone()),
            None => ListSource::Paths {
                hostname: self.hostname.clone(),
                port: self.port,
                paths: self.paths.clone(),
            },
        }
    }

    /// Address the local list-serving endpoint binds to
    pub fn list_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_hostname, self.port)
    }
}

/// Per-server relay listen settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CustomServerEntry {
    #[serde(default)]
    pub ip: Option<IpAddr>,
    pub port: u16,
}

impl CustomServerEntry {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip.unwrap_or(DEFAULT_RELAY_IP), self.port)
    }
}
