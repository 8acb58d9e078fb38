//! Connection Relay

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Context;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::{RelaySession, RelaySettings, ServerTarget};
use crate::modules::ModuleRegistry;
use crate::Result;

/// Decrements the active-session count when a session task ends
struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(counter))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Local listener relaying one game server
pub struct ConnectionRelay {
    server_id: String,
    listen_addr: SocketAddr,
    target: ServerTarget,
    modules: Arc<ModuleRegistry>,
    settings: RelaySettings,
    active_sessions: Arc<AtomicUsize>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ConnectionRelay {
    pub fn new(
        listen_addr: SocketAddr,
        target: ServerTarget,
        modules: Arc<ModuleRegistry>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            server_id: target.server_id.clone(),
            listen_addr,
            target,
            modules,
            settings,
            active_sessions: Arc::new(AtomicUsize::new(0)),
            accept_task: None,
            local_addr: None,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn target(&self) -> &ServerTarget {
        &self.target
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Bound address once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.accept_task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Bind the listener and start accepting clients
    pub async fn start(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr.filter(|_| self.is_listening()) {
            return Ok(addr);
        }

        let listener = TcpListener::bind(self.listen_addr)
            .await
            .with_context(|| {
                format!(
                    "Failed to bind relay for server {} on {}",
                    self.server_id, self.listen_addr
                )
            })?;
        let local_addr = listener.local_addr()?;
        info!("[game] listening on {}", local_addr);

        let server_id = self.server_id.clone();
        let target = self.target.clone();
        let modules = Arc::clone(&self.modules);
        let settings = self.settings.clone();
        let active = Arc::clone(&self.active_sessions);

        self.accept_task = Some(tokio::spawn(async move {
            accept_loop(listener, server_id, target, modules, settings, active).await;
        }));
        self.local_addr = Some(local_addr);

        Ok(local_addr)
    }

    /// Stop accepting new clients; running sessions are left to finish
    pub fn stop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
            debug!(server_id = %self.server_id, "Relay listener closed");
        }
    }
}

impl Drop for ConnectionRelay {
    fn drop(&mut self) {
        self.stop();
    }
}

#[instrument(skip_all, fields(server_id = %server_id))]
async fn accept_loop(
    listener: TcpListener,
    server_id: String,
    target: ServerTarget,
    modules: Arc<ModuleRegistry>,
    settings: RelaySettings,
    active: Arc<AtomicUsize>,
) {
    loop {
        match listener.accept().await {
            Ok((socket, addr)) => {
                debug!("Accepted connection from {}", addr);
                let guard = ActiveGuard::new(&active);
                let target = target.clone();
                let modules = Arc::clone(&modules);
                let settings = settings.clone();

                tokio::spawn(async move {
                    let _guard = guard;
                    handle_client(socket, addr, target, &modules, &settings).await;
                });
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    socket: TcpStream,
    addr: SocketAddr,
    target: ServerTarget,
    modules: &ModuleRegistry,
    settings: &RelaySettings,
) {
    if let Err(e) = socket.set_nodelay(true) {
        warn!("Failed to disable Nagle for {}: {}", addr, e);
    }

    let session = RelaySession::new(addr, target, modules);
    session.run(socket, settings).await;
}
