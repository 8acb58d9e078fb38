//! Lifecycle Coordinator
//!
//! Drives startup (preload, fetch, relay setup, hosts override) and the
//! ordered best-effort shutdown. The hosts override is only installed once
//! the list endpoint is listening, and is removed on every shutdown.

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{RegionDescriptor, RegionTable};
use crate::diagnostics::PortConflictDiagnostics;
use crate::hosts::{HostsError, HostsOverride};
use crate::modules::{ModulePreloader, ModuleRegistry};
use crate::relay::{RelayRegistry, RelaySettings};
use crate::serverlist::{ListError, ServerListSource};
use crate::shutdown::ShutdownCoordinator;

/// Startup and shutdown phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Preloading,
    FetchingList,
    FetchFailed,
    ListReady,
    RelaysStarting,
    Running,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Conditions that abort startup with a non-zero exit status
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Unsupported region: {0}")]
    UnsupportedRegion(String),

    #[error(transparent)]
    Hosts(#[from] HostsError),

    #[error("stale hosts record {ip} {hostname} could not be removed from {}", .path.display())]
    StaleOverride {
        ip: IpAddr,
        hostname: String,
        path: PathBuf,
        #[source]
        source: HostsError,
    },

    #[error("list port {port} is already in use")]
    PortConflict { port: u16 },

    #[error("failed to obtain server list: {0}")]
    ListSource(#[source] ListError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<ListError> for StartupError {
    fn from(err: ListError) -> Self {
        match err {
            ListError::PortInUse { port, .. } => StartupError::PortConflict { port },
            other => StartupError::ListSource(other),
        }
    }
}

impl StartupError {
    /// Process exit status for this failure
    pub fn exit_code(&self) -> i32 {
        1
    }

    /// Print the operator-facing diagnostic and return the exit status
    pub async fn report(&self, diagnostics: &PortConflictDiagnostics) -> i32 {
        match self {
            StartupError::Hosts(HostsError::ReadOnly { path }) => {
                eprintln!("{}", hosts_banner("FILE SET TO READ-ONLY"));
                eprintln!("Your hosts file seems to be set to read-only.");
                eprintln!("Find this file and make sure it's writable:");
                eprintln!("\n    {}\n", path.display());
            }
            StartupError::Hosts(HostsError::InsufficientPrivilege { .. }) => {
                eprintln!("{}", hosts_banner("RUN AS ADMINISTRATOR!"));
                eprintln!(
                    "You don't have sufficient privileges to create or modify the hosts file."
                );
                eprintln!("Please try again with administrator (root) privileges.");
            }
            StartupError::PortConflict { port } => {
                diagnostics.report(*port).await;
            }
            StartupError::Other(e) => eprintln!("{:#}", e),
            other => eprintln!("{}", other),
        }
        self.exit_code()
    }
}

fn hosts_banner(reason: &str) -> String {
    format!(
        "
*********************************
*                               *
*  FAILED TO WRITE HOSTS FILE!  *
*  ---------------------------  *
*  {:^27}  *
*                               *
*********************************
",
        reason
    )
}

/// Select the configured region or fail with [`StartupError::UnsupportedRegion`]
pub fn select_region(table: &RegionTable, code: &str) -> Result<RegionDescriptor, StartupError> {
    table
        .get(code)
        .ok_or_else(|| StartupError::UnsupportedRegion(code.to_string()))
}

/// Owns the process-wide orchestration of one region deployment
pub struct LifecycleCoordinator<S: ServerListSource> {
    region: RegionDescriptor,
    source: S,
    hosts: HostsOverride,
    preloader: ModulePreloader,
    settings: RelaySettings,
    modules: Arc<ModuleRegistry>,
    relays: Option<RelayRegistry>,
    state: LifecycleState,
}

impl<S: ServerListSource> LifecycleCoordinator<S> {
    pub fn new(
        region: RegionDescriptor,
        source: S,
        hosts: HostsOverride,
        preloader: ModulePreloader,
        settings: RelaySettings,
    ) -> Self {
        Self {
            region,
            source,
            hosts,
            preloader,
            settings,
            modules: Arc::new(ModuleRegistry::new()),
            relays: None,
            state: LifecycleState::Idle,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn region(&self) -> &RegionDescriptor {
        &self.region
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    /// Relays built from the fetched list, once the list is ready
    pub fn relays(&self) -> Option<&RelayRegistry> {
        self.relays.as_ref()
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Open sessions across every relay
    pub fn active_sessions(&self) -> usize {
        self.relays.as_ref().map_or(0, RelayRegistry::active_sessions)
    }

    fn transition(&mut self, next: LifecycleState) {
        debug!("Lifecycle {} -> {}", self.state, next);
        self.state = next;
    }

    /// Clear a stale override from an unclean exit and check writability
    ///
    /// Permission failures are fatal since the later install would fail too.
    /// Other failures are tolerated only once the record is known to be gone,
    /// as a leftover record would point the list fetch back at this process.
    fn clear_stale_override(&self) -> Result<(), StartupError> {
        let ip = self.region.listen_hostname;
        let hostname = &self.region.hostname;

        let err = match self.hosts.remove(ip, hostname) {
            Ok(()) => return Ok(()),
            Err(e @ (HostsError::InsufficientPrivilege { .. } | HostsError::ReadOnly { .. })) => {
                return Err(e.into());
            }
            Err(e) => e,
        };

        match self.hosts.contains(ip, hostname) {
            Ok(false) => {
                warn!("Could not clear stale hosts record: {}", err);
                Ok(())
            }
            Ok(true) | Err(_) => Err(StartupError::StaleOverride {
                ip,
                hostname: hostname.clone(),
                path: self.hosts.path().to_path_buf(),
                source: err,
            }),
        }
    }

    /// Run startup up to the steady `Running` state
    pub async fn start(&mut self) -> Result<(), StartupError> {
        self.clear_stale_override()?;

        self.transition(LifecycleState::Preloading);
        info!("[proxy] preloading modules");
        self.modules = Arc::new(self.preloader.preload());

        self.transition(LifecycleState::FetchingList);
        let upstream = match self.source.fetch().await {
            Ok(list) => list,
            Err(e) => {
                self.transition(LifecycleState::FetchFailed);
                self.source.close();
                return Err(e.into());
            }
        };
        self.transition(LifecycleState::ListReady);

        let mut relays = RelayRegistry::build(
            &self.region,
            &upstream,
            Arc::clone(&self.modules),
            self.settings.clone(),
        );

        if let Err(e) = self.source.listen(self.region.listen_hostname).await {
            self.source.close();
            return Err(e.into());
        }

        if let Err(e) = self
            .hosts
            .set(self.region.listen_hostname, &self.region.hostname)
        {
            self.source.close();
            return Err(e.into());
        }
        info!("[sls] server list overridden");

        self.transition(LifecycleState::RelaysStarting);
        relays.start_all().await;
        self.relays = Some(relays);

        self.transition(LifecycleState::Running);
        Ok(())
    }

    /// Remove the override and close every listener; each step runs even if
    /// an earlier one fails, and repeated calls do nothing
    pub fn shutdown(&mut self) {
        if matches!(
            self.state,
            LifecycleState::ShuttingDown | LifecycleState::Terminated
        ) {
            return;
        }
        self.transition(LifecycleState::ShuttingDown);
        info!("terminating...");

        if let Err(e) = self
            .hosts
            .remove(self.region.listen_hostname, &self.region.hostname)
        {
            error!("Failed to remove hosts record: {}", e);
        }

        self.source.close();

        if let Some(relays) = self.relays.as_mut() {
            relays.stop_all();
        }
    }

    /// Give in-flight sessions the grace period, then mark termination
    pub async fn terminate(&mut self, shutdown: &ShutdownCoordinator) {
        self.shutdown();
        shutdown.drain(|| self.active_sessions()).await;
        self.transition(LifecycleState::Terminated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_in_use_maps_to_conflict() {
        let err: StartupError = ListError::PortInUse {
            port: 8080,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        }
        .into();
        assert!(matches!(err, StartupError::PortConflict { port: 8080 }));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_select_region() {
        let table = RegionTable::default();
        let err = select_region(&table, "XX").unwrap_err();
        assert_eq!(err.to_string(), "Unsupported region: XX");
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_banner_centers_reason() {
        let banner = hosts_banner("RUN AS ADMINISTRATOR!");
        assert!(banner.contains("*     RUN AS ADMINISTRATOR!     *"));
    }
}
