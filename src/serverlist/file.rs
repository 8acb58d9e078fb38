//! Server-list source backed by a local JSON document

use super::{apply_overrides, ListEndpoint, ListError, ServerListSource, ServerMap};
use crate::config::RegionDescriptor;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tracing::info;

enum Origin {
    File(PathBuf),
    Inline(ServerMap),
}

/// Serves a fixed list instead of querying upstream
///
/// Used for offline operation with `--server-list` and as a stand-in
/// upstream in tests. The list port is still reserved on fetch, so port
/// conflicts behave exactly as with the HTTP source.
pub struct FileServerList {
    region: RegionDescriptor,
    origin: Origin,
    endpoint: ListEndpoint,
    list: ServerMap,
}

impl FileServerList {
    pub fn new(region: RegionDescriptor, path: impl Into<PathBuf>) -> Self {
        Self::with_origin(region, Origin::File(path.into()))
    }

    pub fn from_map(region: RegionDescriptor, list: ServerMap) -> Self {
        Self::with_origin(region, Origin::Inline(list))
    }

    fn with_origin(region: RegionDescriptor, origin: Origin) -> Self {
        let endpoint = ListEndpoint::new(region.list_listen_addr());
        Self {
            region,
            origin,
            endpoint,
            list: ServerMap::new(),
        }
    }

    /// Address the list is being served on
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr()
    }
}

impl ServerListSource for FileServerList {
    async fn fetch(&mut self) -> Result<ServerMap, ListError> {
        self.endpoint.reserve().await?;

        self.list = match &self.origin {
            Origin::Inline(list) => list.clone(),
            Origin::File(path) => {
                let content = tokio::fs::read_to_string(path).await?;
                serde_json::from_str(&content).map_err(|source| ListError::Parse {
                    origin: path.display().to_string(),
                    source,
                })?
            }
        };

        info!("Loaded {} servers from local list", self.list.len());
        Ok(self.list.clone())
    }

    async fn listen(&mut self, ip: IpAddr) -> Result<SocketAddr, ListError> {
        let overridden = apply_overrides(&self.list, &self.region.custom_servers);
        let lists = self
            .region
            .list_source()
            .endpoints()
            .into_iter()
            .map(|(_, path)| (path, overridden.clone()))
            .collect();
        self.endpoint.serve(ip, lists).await
    }

    fn close(&mut self) {
        self.endpoint.close();
    }
}
