//! Server discovery: a manually-updated list of addresses, and a registry-
//! backed variant that refreshes itself over HTTP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::RpcError;
use crate::protocol::DEFAULT_DISCOVERY_REFRESH_INTERVAL;

/// How [`Discovery::get`] picks one address out of the known set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Random,
    RoundRobin,
}

/// Source of truth for which server addresses an [`crate::xclient::XClient`]
/// can dial.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Forces an immediate refresh from the backing source, if any.
    async fn refresh(&self) -> Result<(), RpcError>;

    /// Replaces the known server list outright.
    async fn update(&self, servers: Vec<String>) -> Result<(), RpcError>;

    /// Picks one address per `mode`. Fails with
    /// [`RpcError::NoAvailableServers`] if the known list is empty.
    async fn get(&self, mode: SelectMode) -> Result<String, RpcError>;

    /// Returns every known address.
    async fn get_all(&self) -> Result<Vec<String>, RpcError>;
}

/// A static (or externally-updated) list of server addresses.
pub struct MultiServersDiscovery {
    servers: RwLock<Vec<String>>,
    index: AtomicUsize,
}

impl MultiServersDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        // Start the round-robin cursor at a random offset, matching the Go
        // source's `r.index = r.r.Intn(math.MaxInt32 - 1)` (avoids every
        // freshly-constructed discovery picking server 0 first).
        let index = if servers.is_empty() {
            0
        } else {
            rand::thread_rng().gen_range(0..servers.len())
        };
        Self {
            servers: RwLock::new(servers),
            index: AtomicUsize::new(index),
        }
    }
}

#[async_trait]
impl Discovery for MultiServersDiscovery {
    async fn refresh(&self) -> Result<(), RpcError> {
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), RpcError> {
        *self.servers.write().await = servers;
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, RpcError> {
        let servers = self.servers.read().await;
        pick(&servers, mode, &self.index)
    }

    async fn get_all(&self) -> Result<Vec<String>, RpcError> {
        Ok(self.servers.read().await.clone())
    }
}

/// Clamps the round-robin cursor into range and returns the address it
/// lands on, or picks uniformly at random — the shared selection logic
/// behind both [`MultiServersDiscovery`] and [`RegistryDiscovery`].
fn pick(servers: &[String], mode: SelectMode, index: &AtomicUsize) -> Result<String, RpcError> {
    if servers.is_empty() {
        return Err(RpcError::NoAvailableServers);
    }
    match mode {
        SelectMode::Random => {
            let i = rand::thread_rng().gen_range(0..servers.len());
            Ok(servers[i].clone())
        }
        SelectMode::RoundRobin => {
            let i = index.fetch_add(1, Ordering::SeqCst) % servers.len();
            Ok(servers[i].clone())
        }
    }
}

/// A [`Discovery`] backed by an `rpcie` registry's HTTP API: periodically
/// GETs the registry and parses the `X-Rpcie-Servers` header.
pub struct RegistryDiscovery {
    registry_url: String,
    refresh_interval: Duration,
    http: reqwest::Client,
    servers: RwLock<Vec<String>>,
    index: AtomicUsize,
    last_refresh: RwLock<Option<Instant>>,
}

impl RegistryDiscovery {
    pub fn new(registry_url: impl Into<String>) -> Self {
        Self::with_refresh_interval(registry_url, DEFAULT_DISCOVERY_REFRESH_INTERVAL)
    }

    pub fn with_refresh_interval(registry_url: impl Into<String>, refresh_interval: Duration) -> Self {
        Self {
            registry_url: registry_url.into(),
            refresh_interval,
            http: reqwest::Client::new(),
            servers: RwLock::new(Vec::new()),
            index: AtomicUsize::new(0),
            last_refresh: RwLock::new(None),
        }
    }

    async fn refresh_if_stale(&self) -> Result<(), RpcError> {
        let stale = match *self.last_refresh.read().await {
            None => true,
            Some(last) => last.elapsed() > self.refresh_interval,
        };
        if stale {
            self.refresh().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<(), RpcError> {
        let response = self
            .http
            .get(&self.registry_url)
            .send()
            .await
            .map_err(|err| RpcError::Method(format!("registry refresh: {err}")))?;

        let header = response
            .headers()
            .get("X-Rpcie-Servers")
            .and_then(|value| value.to_str().ok())
            .unwrap_or("");

        let servers: Vec<String> = header
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        *self.servers.write().await = servers;
        *self.last_refresh.write().await = Some(Instant::now());
        Ok(())
    }

    async fn update(&self, servers: Vec<String>) -> Result<(), RpcError> {
        *self.servers.write().await = servers;
        *self.last_refresh.write().await = Some(Instant::now());
        Ok(())
    }

    async fn get(&self, mode: SelectMode) -> Result<String, RpcError> {
        if let Err(err) = self.refresh_if_stale().await {
            warn!("rpc discovery: refresh failed: {err}");
        }
        let servers = self.servers.read().await;
        pick(&servers, mode, &self.index)
    }

    async fn get_all(&self) -> Result<Vec<String>, RpcError> {
        if let Err(err) = self.refresh_if_stale().await {
            warn!("rpc discovery: refresh failed: {err}");
        }
        Ok(self.servers.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_discovery_fails_to_produce_a_server() {
        let discovery = MultiServersDiscovery::new(Vec::new());
        let err = discovery.get(SelectMode::RoundRobin).await.unwrap_err();
        assert!(matches!(err, RpcError::NoAvailableServers));
    }

    #[tokio::test]
    async fn round_robin_cycles_through_every_server() {
        let servers = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let discovery = MultiServersDiscovery::new(servers.clone());

        let mut seen = std::collections::HashSet::new();
        for _ in 0..servers.len() {
            seen.insert(discovery.get(SelectMode::RoundRobin).await.unwrap());
        }
        assert_eq!(seen.len(), servers.len());
    }

    #[tokio::test]
    async fn update_replaces_the_server_list() {
        let discovery = MultiServersDiscovery::new(vec!["a".to_string()]);
        discovery.update(vec!["b".to_string(), "c".to_string()]).await.unwrap();
        assert_eq!(discovery.get_all().await.unwrap(), vec!["b".to_string(), "c".to_string()]);
    }
}
