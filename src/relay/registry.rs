//! Relay Registry

use std::sync::Arc;
use tracing::{error, info};

use super::{ConnectionRelay, RelaySettings, ServerTarget};
use crate::config::RegionDescriptor;
use crate::modules::ModuleRegistry;
use crate::serverlist::ServerMap;

/// Every relay of the active region, in server identifier order
pub struct RelayRegistry {
    relays: Vec<ConnectionRelay>,
    skipped: Vec<String>,
}

impl RelayRegistry {
    /// Create a relay for each custom server present in the upstream list
    pub fn build(
        region: &RegionDescriptor,
        upstream: &ServerMap,
        modules: Arc<ModuleRegistry>,
        settings: RelaySettings,
    ) -> Self {
        let mut relays = Vec::new();
        let mut skipped = Vec::new();

        for (id, entry) in &region.custom_servers {
            match ServerTarget::resolve(id, upstream) {
                Some(target) => relays.push(ConnectionRelay::new(
                    entry.listen_addr(),
                    target,
                    Arc::clone(&modules),
                    settings.clone(),
                )),
                None => {
                    error!(server_id = %id, "server {} not found", id);
                    skipped.push(id.clone());
                }
            }
        }

        Self { relays, skipped }
    }

    /// Identifiers with no upstream counterpart
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionRelay> {
        self.relays.iter()
    }

    pub fn get(&self, server_id: &str) -> Option<&ConnectionRelay> {
        self.relays.iter().find(|r| r.server_id() == server_id)
    }

    /// Start every relay; a bind failure only affects its own relay
    pub async fn start_all(&mut self) -> usize {
        let mut started = 0;
        for relay in &mut self.relays {
            match relay.start().await {
                Ok(_) => started += 1,
                Err(e) => error!(server_id = %relay.server_id(), "{:#}", e),
            }
        }
        info!("Started {}/{} relays", started, self.relays.len());
        started
    }

    /// Close every listener; safe to repeat
    pub fn stop_all(&mut self) {
        for relay in &mut self.relays {
            relay.stop();
        }
    }

    /// Sessions still open across all relays
    pub fn active_sessions(&self) -> usize {
        self.relays.iter().map(ConnectionRelay::active_sessions).sum()
    }
}
