//! Endpoint discovery: refreshing and selecting among a changing set of
//! server addresses.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;

use crate::error::{DiscoveryError, OrpcError, Result};

/// How [`Discovery::get`] chooses one endpoint from the current list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Random,
    RoundRobin,
}

/// A source of truth for the set of currently reachable server addresses.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Repopulates the endpoint list from upstream. May be a no-op for
    /// static implementations.
    async fn refresh(&self) -> Result<()>;

    /// Replaces the endpoint list explicitly.
    fn update(&self, servers: Vec<String>);

    /// Chooses one endpoint by `mode`.
    fn get(&self, mode: SelectMode) -> Result<String>;

    /// Snapshot of the full endpoint list.
    fn get_all(&self) -> Vec<String>;
}

fn select(servers: &[String], mode: SelectMode, round_robin_index: &AtomicUsize) -> Result<String> {
    if servers.is_empty() {
        return Err(OrpcError::Discovery(DiscoveryError::NoServers));
    }
    match mode {
        SelectMode::Random => {
            let i = rand::thread_rng().gen_range(0..servers.len());
            Ok(servers[i].clone())
        }
        SelectMode::RoundRobin => {
            let i = round_robin_index.fetch_add(1, Ordering::SeqCst) % servers.len();
            Ok(servers[i].clone())
        }
    }
}

/// A statically configured endpoint list — useful for tests and for
/// callers that already know their server set.
pub struct StaticDiscovery {
    servers: Mutex<Vec<String>>,
    round_robin_index: AtomicUsize,
}

impl StaticDiscovery {
    pub fn new(servers: Vec<String>) -> Self {
        StaticDiscovery {
            servers: Mutex::new(servers),
            round_robin_index: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    fn update(&self, servers: Vec<String>) {
        *self.servers.lock().unwrap() = servers;
    }

    fn get(&self, mode: SelectMode) -> Result<String> {
        let servers = self.servers.lock().unwrap();
        select(&servers, mode, &self.round_robin_index)
    }

    fn get_all(&self) -> Vec<String> {
        self.servers.lock().unwrap().clone()
    }
}

/// Discovery backed by a running [`crate::registry::Registry`]'s HTTP
/// surface: `refresh()` GETs the registry and parses the
/// `X-Orpc-Servers` response header.
pub struct RegistryDiscovery {
    registry_url: String,
    client: reqwest::Client,
    servers: Mutex<Vec<String>>,
    last_update: Mutex<Option<Instant>>,
    update_ttl: Duration,
    round_robin_index: AtomicUsize,
}

impl RegistryDiscovery {
    pub fn new(registry_url: impl Into<String>, update_ttl: Duration) -> Self {
        RegistryDiscovery {
            registry_url: registry_url.into(),
            client: reqwest::Client::new(),
            servers: Mutex::new(Vec::new()),
            last_update: Mutex::new(None),
            update_ttl,
            round_robin_index: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Discovery for RegistryDiscovery {
    async fn refresh(&self) -> Result<()> {
        {
            let last_update = self.last_update.lock().unwrap();
            if let Some(last) = *last_update {
                if Instant::now() < last + self.update_ttl {
                    return Ok(());
                }
            }
        }

        let response = self
            .client
            .get(&self.registry_url)
            .send()
            .await
            .map_err(|e| OrpcError::Other(Box::new(e)))?;
        let servers = response
            .headers()
            .get("X-Orpc-Servers")
            .and_then(|v| v.to_str().ok())
            .map(|csv| {
                csv.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        *self.servers.lock().unwrap() = servers;
        *self.last_update.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    fn update(&self, servers: Vec<String>) {
        *self.servers.lock().unwrap() = servers;
        *self.last_update.lock().unwrap() = Some(Instant::now());
    }

    fn get(&self, mode: SelectMode) -> Result<String> {
        let servers = self.servers.lock().unwrap();
        select(&servers, mode, &self.round_robin_index)
    }

    fn get_all(&self) -> Vec<String> {
        self.servers.lock().unwrap().clone()
    }
}
