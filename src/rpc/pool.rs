//! Provider pool
//!
//! Keeps a prioritized list of RPC endpoints, hands out a cached healthy
//! client, and rotates to the next endpoint when the current one stops
//! answering. Endpoints are never dropped; rotation wraps around.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RpcConfig;
use crate::error::{Error, Result};
use crate::rpc::client::{ChainClient, Connector};

/// One RPC endpoint and its observed health
#[derive(Debug, Clone, Serialize)]
pub struct Endpoint {
    pub url: String,
    pub name: String,
    pub last_healthy: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, name: Option<String>) -> Self {
        let url = url.into();
        let name = name.unwrap_or_else(|| {
            url::Url::parse(&url)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.to_string()))
                .unwrap_or_else(|| url.clone())
        });
        Self {
            url,
            name,
            last_healthy: None,
            consecutive_failures: 0,
        }
    }
}

struct CachedClient {
    index: usize,
    client: Arc<dyn ChainClient>,
    fetched_at: Instant,
}

/// Failover pool over the configured RPC endpoints
pub struct ProviderPool {
    endpoints: RwLock<Vec<Endpoint>>,
    clients: Vec<Arc<dyn ChainClient>>,
    index: AtomicUsize,
    cache: RwLock<Option<CachedClient>>,
    /// Serializes cache refreshes so concurrent callers don't all probe
    refresh_gate: Mutex<()>,
    cache_ttl: Duration,
    probe_timeout: Duration,
    health_interval: Duration,
    failure_threshold: u32,
}

impl ProviderPool {
    /// Create a pool with one client per configured endpoint
    pub fn new(config: &RpcConfig, connector: &dyn Connector) -> Result<Self> {
        if config.endpoints.is_empty() {
            return Err(Error::Config("no rpc endpoints configured".to_string()));
        }

        let endpoints: Vec<Endpoint> = config
            .endpoints
            .iter()
            .map(|e| Endpoint::new(e.url.clone(), e.name.clone()))
            .collect();
        let clients = endpoints.iter().map(|e| connector.connect(e)).collect();

        info!(
            endpoints = endpoints.len(),
            primary = %endpoints[0].name,
            "Provider pool initialized"
        );

        Ok(Self {
            endpoints: RwLock::new(endpoints),
            clients,
            index: AtomicUsize::new(0),
            cache: RwLock::new(None),
            refresh_gate: Mutex::new(()),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            health_interval: Duration::from_secs(config.health_interval_secs),
            failure_threshold: config.failure_threshold,
        })
    }

    /// Return a healthy client, probing endpoints if the cache expired
    pub async fn get_client(&self) -> Result<Arc<dyn ChainClient>> {
        if let Some(client) = self.cached().await {
            return Ok(client);
        }

        let _gate = self.refresh_gate.lock().await;
        // Another caller may have refreshed while we waited
        if let Some(client) = self.cached().await {
            return Ok(client);
        }

        let count = self.clients.len();
        let start = self.index.load(Ordering::SeqCst) % count;

        for offset in 0..count {
            let idx = (start + offset) % count;
            match self.probe(idx).await {
                Ok(block) => {
                    self.mark_healthy(idx).await;
                    self.index.store(idx, Ordering::SeqCst);
                    let client = self.clients[idx].clone();
                    *self.cache.write().await = Some(CachedClient {
                        index: idx,
                        client: client.clone(),
                        fetched_at: Instant::now(),
                    });
                    let name = self.endpoint_name(idx).await;
                    if offset > 0 {
                        warn!(
                            endpoint = %name,
                            index = idx,
                            skipped = offset,
                            "Failed over to RPC endpoint"
                        );
                    } else {
                        debug!(endpoint = %name, block, "RPC endpoint healthy");
                    }
                    return Ok(client);
                }
                Err(e) => {
                    let failures = self.mark_failed(idx).await;
                    let name = self.endpoint_name(idx).await;
                    warn!(
                        endpoint = %name,
                        failures,
                        error = %e,
                        "RPC endpoint probe failed"
                    );
                }
            }
        }

        error!(endpoints = count, "All RPC endpoints are down");
        Err(Error::AllEndpointsDown(count))
    }

    /// Invalidate the cached client and advance to the next endpoint
    pub async fn rotate(&self) {
        let count = self.clients.len();
        let previous = self
            .index
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |i| Some((i + 1) % count))
            .unwrap_or(0);
        let next = (previous + 1) % count;
        *self.cache.write().await = None;

        let from = self.endpoint_name(previous).await;
        let to = self.endpoint_name(next).await;
        warn!(
            from = %from,
            to = %to,
            "Rotating RPC endpoint"
        );
    }

    /// Run one health-monitor iteration against the current endpoint.
    ///
    /// Returns whether the endpoint answered. After `failure_threshold`
    /// consecutive failures the pool rotates.
    pub async fn check_health(&self) -> bool {
        let idx = self.index.load(Ordering::SeqCst) % self.clients.len();
        match self.probe(idx).await {
            Ok(_) => {
                self.mark_healthy(idx).await;
                true
            }
            Err(e) => {
                let failures = self.mark_failed(idx).await;
                let name = self.endpoint_name(idx).await;
                warn!(
                    endpoint = %name,
                    failures,
                    threshold = self.failure_threshold,
                    error = %e,
                    "Health probe failed"
                );
                if failures >= self.failure_threshold
                    && self.index.load(Ordering::SeqCst) % self.clients.len() == idx
                {
                    self.rotate().await;
                }
                false
            }
        }
    }

    /// Spawn the background health monitor
    pub fn spawn_health_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        let period = self.health_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // First tick fires immediately; the pool was just probed on startup
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.check_health().await;
                    }
                    _ = cancel.cancelled() => {
                        info!("RPC health monitor stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Current block number through the pool, rotating on connectivity errors
    pub async fn current_block(&self) -> Result<u64> {
        let client = self.get_client().await?;
        match client.block_number().await {
            Err(e) if e.is_connectivity() => {
                self.rotate().await;
                Err(e)
            }
            other => other,
        }
    }

    /// Raw code/data at an address through the pool
    pub async fn code_at(&self, address: &str) -> Result<Vec<u8>> {
        let client = self.get_client().await?;
        match client.code_at(address).await {
            Err(e) if e.is_connectivity() => {
                self.rotate().await;
                Err(e)
            }
            other => other,
        }
    }

    /// Snapshot of all endpoints
    pub async fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.read().await.clone()
    }

    /// Index of the endpoint currently in use
    pub fn current_index(&self) -> usize {
        self.index.load(Ordering::SeqCst) % self.clients.len()
    }

    async fn cached(&self) -> Option<Arc<dyn ChainClient>> {
        let cache = self.cache.read().await;
        cache
            .as_ref()
            .filter(|c| c.fetched_at.elapsed() < self.cache_ttl)
            .filter(|c| c.index == self.index.load(Ordering::SeqCst) % self.clients.len())
            .map(|c| c.client.clone())
    }

    async fn probe(&self, idx: usize) -> Result<u64> {
        match tokio::time::timeout(self.probe_timeout, self.clients[idx].block_number()).await {
            Ok(result) => result,
            Err(_) => Err(Error::RpcTimeout(self.probe_timeout.as_millis() as u64)),
        }
    }

    async fn mark_healthy(&self, idx: usize) {
        let mut endpoints = self.endpoints.write().await;
        if let Some(endpoint) = endpoints.get_mut(idx) {
            endpoint.consecutive_failures = 0;
            endpoint.last_healthy = Some(Utc::now());
        }
    }

    async fn mark_failed(&self, idx: usize) -> u32 {
        let mut endpoints = self.endpoints.write().await;
        match endpoints.get_mut(idx) {
            Some(endpoint) => {
                endpoint.consecutive_failures += 1;
                endpoint.consecutive_failures
            }
            None => 0,
        }
    }

    async fn endpoint_name(&self, idx: usize) -> String {
        self.endpoints
            .read()
            .await
            .get(idx)
            .map(|e| e.name.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;

    struct MockClient {
        up: AtomicBool,
        probes: AtomicUsize,
        block: u64,
    }

    impl MockClient {
        fn new(up: bool, block: u64) -> Arc<Self> {
            Arc::new(Self {
                up: AtomicBool::new(up),
                probes: AtomicUsize::new(0),
                block,
            })
        }

        fn set_up(&self, up: bool) {
            self.up.store(up, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl ChainClient for MockClient {
        async fn block_number(&self) -> Result<u64> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if self.up.load(Ordering::SeqCst) {
                Ok(self.block)
            } else {
                Err(Error::Rpc("connection refused".to_string()))
            }
        }

        async fn code_at(&self, _address: &str) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    struct MockConnector {
        clients: HashMap<String, Arc<MockClient>>,
    }

    impl Connector for MockConnector {
        fn connect(&self, endpoint: &Endpoint) -> Arc<dyn ChainClient> {
            self.clients[&endpoint.url].clone()
        }
    }

    fn pool_with(clients: &[(&str, Arc<MockClient>)]) -> ProviderPool {
        let config = RpcConfig {
            endpoints: clients
                .iter()
                .map(|(name, _)| EndpointConfig {
                    url: format!("https://{}.rpc.test", name),
                    name: Some(name.to_string()),
                })
                .collect(),
            cache_ttl_secs: 60,
            probe_timeout_ms: 200,
            health_interval_secs: 15,
            failure_threshold: 3,
        };
        let connector = MockConnector {
            clients: clients
                .iter()
                .map(|(name, c)| (format!("https://{}.rpc.test", name), c.clone()))
                .collect(),
        };
        ProviderPool::new(&config, &connector).unwrap()
    }

    #[tokio::test]
    async fn test_failover_to_first_responder_then_rotate_after_threshold() {
        let a = MockClient::new(false, 1);
        let b = MockClient::new(false, 2);
        let c = MockClient::new(true, 3);
        let pool = pool_with(&[("a", a.clone()), ("b", b.clone()), ("c", c.clone())]);

        let client = pool.get_client().await.unwrap();
        assert_eq!(client.block_number().await.unwrap(), 3);
        assert_eq!(pool.current_index(), 2);

        let endpoints = pool.endpoints().await;
        assert_eq!(endpoints[0].consecutive_failures, 1);
        assert_eq!(endpoints[1].consecutive_failures, 1);
        assert!(endpoints[2].last_healthy.is_some());

        // C goes down: two failures keep it, the third rotates to A
        c.set_up(false);
        assert!(!pool.check_health().await);
        assert!(!pool.check_health().await);
        assert_eq!(pool.current_index(), 2);
        assert!(!pool.check_health().await);
        assert_eq!(pool.current_index(), 0);
    }

    #[tokio::test]
    async fn test_cached_client_is_reused() {
        let a = MockClient::new(true, 10);
        let pool = pool_with(&[("a", a.clone())]);

        pool.get_client().await.unwrap();
        pool.get_client().await.unwrap();
        pool.get_client().await.unwrap();

        // Only the first call probed
        assert_eq!(a.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_all_endpoints_down() {
        let a = MockClient::new(false, 1);
        let b = MockClient::new(false, 2);
        let pool = pool_with(&[("a", a), ("b", b)]);

        match pool.get_client().await {
            Err(Error::AllEndpointsDown(2)) => {}
            other => panic!("expected AllEndpointsDown, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_rotate_wraps_and_invalidates_cache() {
        let a = MockClient::new(true, 1);
        let b = MockClient::new(true, 2);
        let pool = pool_with(&[("a", a.clone()), ("b", b.clone())]);

        pool.get_client().await.unwrap();
        pool.rotate().await;
        assert_eq!(pool.current_index(), 1);

        let client = pool.get_client().await.unwrap();
        assert_eq!(client.block_number().await.unwrap(), 2);

        pool.rotate().await;
        assert_eq!(pool.current_index(), 0);
        assert_eq!(pool.endpoints().await.len(), 2);
    }

    #[tokio::test]
    async fn test_recovered_endpoint_resets_failures() {
        let a = MockClient::new(false, 1);
        let pool = pool_with(&[("a", a.clone()), ("b", MockClient::new(true, 2))]);

        assert!(!pool.check_health().await);
        a.set_up(true);
        assert!(pool.check_health().await);
        assert_eq!(pool.endpoints().await[0].consecutive_failures, 0);
        assert_eq!(pool.current_index(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failover_runs_on_spawned_tasks() {
        let a = MockClient::new(false, 1);
        let b = MockClient::new(true, 2);
        let pool = Arc::new(pool_with(&[("a", a), ("b", b)]));

        let worker = pool.clone();
        let block = tokio::spawn(async move { worker.current_block().await })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(block, 2);

        let worker = pool.clone();
        tokio::spawn(async move {
            worker.rotate().await;
            worker.check_health().await
        })
        .await
        .unwrap();
        assert_eq!(pool.endpoints().await[0].consecutive_failures, 2);
    }

    #[test]
    fn test_endpoint_name_defaults_to_host() {
        let endpoint = Endpoint::new("https://rpc.example.com/?api-key=x", None);
        assert_eq!(endpoint.name, "rpc.example.com");
    }
}
