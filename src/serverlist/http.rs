//! HTTP server-list source

use super::{apply_overrides, ListEndpoint, ListError, ServerListSource, ServerMap};
use crate::config::RegionDescriptor;
use crate::Result;
use anyhow::Context;
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info};

/// Fetches JSON server lists from the region's upstream endpoints
pub struct HttpServerList {
    region: RegionDescriptor,
    client: reqwest::Client,
    endpoint: ListEndpoint,
    lists: BTreeMap<String, ServerMap>,
}

impl HttpServerList {
    pub fn new(region: RegionDescriptor, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let endpoint = ListEndpoint::new(region.list_listen_addr());

        Ok(Self {
            region,
            client,
            endpoint,
            lists: BTreeMap::new(),
        })
    }

    async fn fetch_one(&self, url: &str) -> std::result::Result<ServerMap, ListError> {
        debug!("Fetching server list from {}", url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|source| ListError::Fetch {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ListError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|source| ListError::Fetch {
            url: url.to_string(),
            source,
        })?;

        serde_json::from_str(&body).map_err(|source| ListError::Parse {
            origin: url.to_string(),
            source,
        })
    }
}

impl ServerListSource for HttpServerList {
    async fn fetch(&mut self) -> std::result::Result<ServerMap, ListError> {
        self.endpoint.reserve().await?;

        let mut merged = ServerMap::new();
        for (url, path) in self.region.list_source().endpoints() {
            let list = self.fetch_one(&url).await?;
            info!("Fetched {} servers from {}", list.len(), url);
            merged.extend(list.iter().map(|(id, s)| (id.clone(), s.clone())));
            self.lists.insert(path, list);
        }

        Ok(merged)
    }

    async fn listen(&mut self, ip: IpAddr) -> std::result::Result<SocketAddr, ListError> {
        let lists = self
            .lists
            .iter()
            .map(|(path, list)| {
                (
                    path.clone(),
                    apply_overrides(list, &self.region.custom_servers),
                )
            })
            .collect();
        self.endpoint.serve(ip, lists).await
    }

    fn close(&mut self) {
        self.endpoint.close();
    }
}
