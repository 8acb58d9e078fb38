//! Hosts File Override
//!
//! Installs and removes a single `ip hostname` record in the host resolution
//! table. Both operations are idempotent and leave every other byte of the
//! file untouched, so `set` followed by `remove` restores the original file.

use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[cfg(unix)]
const EROFS: i32 = 30;

/// Failure classes surfaced to the operator
#[derive(Debug, Error)]
pub enum HostsError {
    #[error("insufficient privileges to modify hosts file {path}")]
    InsufficientPrivilege { path: PathBuf },

    #[error("hosts file {path} is read-only")]
    ReadOnly { path: PathBuf },

    #[error("failed to update hosts file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl HostsError {
    pub fn path(&self) -> &Path {
        match self {
            HostsError::InsufficientPrivilege { path }
            | HostsError::ReadOnly { path }
            | HostsError::Io { path, .. } => path,
        }
    }
}

/// Platform location of the hosts file
pub fn default_hosts_path() -> PathBuf {
    #[cfg(windows)]
    {
        let root = std::env::var("SystemRoot").unwrap_or_else(|_| "C:\\Windows".to_string());
        PathBuf::from(root)
            .join("System32")
            .join("drivers")
            .join("etc")
            .join("hosts")
    }

    #[cfg(not(windows))]
    {
        PathBuf::from("/etc/hosts")
    }
}

/// One hostname to IP override record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostsOverrideRecord {
    pub ip: IpAddr,
    pub hostname: String,
}

impl HostsOverrideRecord {
    pub fn new(ip: IpAddr, hostname: impl Into<String>) -> Self {
        Self {
            ip,
            hostname: hostname.into(),
        }
    }

    /// Whether a hosts line is exactly this record, ignoring comments and spacing
    fn matches(&self, line: &str) -> bool {
        let data = line.split('#').next().unwrap_or("");
        let mut parts = data.split_whitespace();
        let ip_matches = parts
            .next()
            .and_then(|ip| ip.parse::<IpAddr>().ok())
            .is_some_and(|ip| ip == self.ip);
        let host_matches = parts
            .next()
            .is_some_and(|host| host.eq_ignore_ascii_case(&self.hostname));
        ip_matches && host_matches && parts.next().is_none()
    }

    fn to_line(&self) -> String {
        format!("{} {}", self.ip, self.hostname)
    }
}

/// Return `content` with the record appended, or `None` if already present
pub fn add_record(content: &str, record: &HostsOverrideRecord) -> Option<String> {
    if content.lines().any(|line| record.matches(line)) {
        return None;
    }

    let newline = if content.contains("\r\n") { "\r\n" } else { "\n" };
    let mut updated = String::with_capacity(content.len() + record.hostname.len() + 48);
    updated.push_str(content);

    if content.is_empty() || content.ends_with('\n') {
        updated.push_str(&record.to_line());
        updated.push_str(newline);
    } else {
        // Keep the original unterminated last line byte-identical on removal
        updated.push_str(newline);
        updated.push_str(&record.to_line());
    }

    Some(updated)
}

/// Return `content` without any line matching the record, or `None` if absent
pub fn remove_record(content: &str, record: &HostsOverrideRecord) -> Option<String> {
    let mut updated = String::with_capacity(content.len());
    let mut removed = false;

    for line in content.split_inclusive('\n') {
        if !record.matches(line) {
            updated.push_str(line);
            continue;
        }

        removed = true;
        if !line.ends_with('\n') {
            // Unterminated last line: drop the separator that preceded it
            if updated.ends_with("\r\n") {
                updated.truncate(updated.len() - 2);
            } else if updated.ends_with('\n') {
                updated.truncate(updated.len() - 1);
            }
        }
    }

    removed.then_some(updated)
}

/// Applies and reverts the server-list hostname override
#[derive(Debug, Clone)]
pub struct HostsOverride {
    path: PathBuf,
}

impl HostsOverride {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Override backed by the platform hosts file
    pub fn system() -> Self {
        Self::new(default_hosts_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make `hostname` resolve to `ip`; no-op when the record already exists
    pub fn set(&self, ip: IpAddr, hostname: &str) -> Result<(), HostsError> {
        let record = HostsOverrideRecord::new(ip, hostname);
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(self.classify(e)),
        };

        match add_record(&content, &record) {
            Some(updated) => {
                std::fs::write(&self.path, updated).map_err(|e| self.classify(e))?;
                info!("Added hosts record {} {}", ip, hostname);
            }
            None => debug!("Hosts record {} {} already present", ip, hostname),
        }

        Ok(())
    }

    /// Remove the `hostname` to `ip` record; no-op when it does not exist
    pub fn remove(&self, ip: IpAddr, hostname: &str) -> Result<(), HostsError> {
        let record = HostsOverrideRecord::new(ip, hostname);
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(self.classify(e)),
        };

        match remove_record(&content, &record) {
            Some(updated) => {
                std::fs::write(&self.path, updated).map_err(|e| self.classify(e))?;
                info!("Removed hosts record {} {}", ip, hostname);
            }
            None => debug!("Hosts record {} {} not present", ip, hostname),
        }

        Ok(())
    }

    /// Whether the record is currently installed
    pub fn contains(&self, ip: IpAddr, hostname: &str) -> Result<bool, HostsError> {
        let record = HostsOverrideRecord::new(ip, hostname);
        match std::fs::read_to_string(&self.path) {
            Ok(content) => Ok(content.lines().any(|line| record.matches(line))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.classify(e)),
        }
    }

    fn classify(&self, err: io::Error) -> HostsError {
        classify_error(&self.path, err)
    }
}

/// Map an I/O failure on the hosts file to an operator-facing class
pub fn classify_error(path: &Path, err: io::Error) -> HostsError {
    let path = path.to_path_buf();

    #[cfg(unix)]
    if err.raw_os_error() == Some(EROFS) {
        return HostsError::ReadOnly { path };
    }

    if err.kind() == io::ErrorKind::PermissionDenied {
        let read_only = std::fs::metadata(&path)
            .map(|meta| meta.permissions().readonly())
            .unwrap_or(false);
        return if read_only {
            HostsError::ReadOnly { path }
        } else {
            HostsError::InsufficientPrivilege { path }
        };
    }

    HostsError::Io { path, source: err }
}
