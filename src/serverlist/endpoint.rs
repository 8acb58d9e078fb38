//! Local list-serving endpoint

use super::{ListError, ServerMap};
use axum::{routing::get, Json, Router};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// HTTP endpoint serving the overridden list at each upstream path
pub struct ListEndpoint {
    addr: SocketAddr,
    reserved: Option<TcpListener>,
    server: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ListEndpoint {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            reserved: None,
            server: None,
            local_addr: None,
        }
    }

    /// Bind the list port ahead of serving so a conflict surfaces early
    pub async fn reserve(&mut self) -> Result<SocketAddr, ListError> {
        if let Some(listener) = &self.reserved {
            return Ok(listener.local_addr()?);
        }

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| ListError::from_bind(self.addr.port(), e))?;
        let local = listener.local_addr()?;
        debug!("Reserved list port {}", local);
        self.reserved = Some(listener);
        Ok(local)
    }

    /// Serve `lists` (path to list) on `ip`, returning the bound address
    pub async fn serve(
        &mut self,
        ip: IpAddr,
        lists: BTreeMap<String, ServerMap>,
    ) -> Result<SocketAddr, ListError> {
        if let Some(previous) = self.server.take() {
            previous.abort();
        }

        let listener = match self.reserved.take() {
            Some(listener) if listener.local_addr()?.ip() == ip => listener,
            _ => {
                let addr = SocketAddr::new(ip, self.addr.port());
                TcpListener::bind(addr)
                    .await
                    .map_err(|e| ListError::from_bind(addr.port(), e))?
            }
        };
        let local = listener.local_addr()?;

        let mut app = Router::new();
        for (path, list) in lists {
            debug!("Serving {} servers at {}", list.len(), path);
            let list = Arc::new(list);
            app = app.route(
                &path,
                get(move || {
                    let list = Arc::clone(&list);
                    async move { Json(list.as_ref().clone()) }
                }),
            );
        }

        self.server = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Server list endpoint error: {}", e);
            }
        }));
        self.local_addr = Some(local);

        info!("Server list endpoint listening on {}", local);
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_listening(&self) -> bool {
        self.server.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop serving and release the port
    pub fn close(&mut self) {
        if let Some(handle) = self.server.take() {
            handle.abort();
            info!("Server list endpoint closed");
        }
        self.reserved = None;
        self.local_addr = None;
    }
}

impl Drop for ListEndpoint {
    fn drop(&mut self) {
        if let Some(handle) = self.server.take() {
            handle.abort();
        }
    }
}
