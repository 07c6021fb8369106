//! Chain client seam
//!
//! The pool only needs a liveness call and a raw code/data lookup, so the
//! concrete RPC client is hidden behind [`ChainClient`].

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::rpc::pool::Endpoint;

/// Minimal chain access used by the core
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Current block (slot) number; doubles as the liveness probe
    async fn block_number(&self) -> Result<u64>;

    /// Raw on-chain code/data stored at an address
    async fn code_at(&self, address: &str) -> Result<Vec<u8>>;
}

/// Builds one client per configured endpoint
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Arc<dyn ChainClient>;
}

/// Solana JSON-RPC backed client
pub struct SolanaChainClient {
    inner: RpcClient,
}

impl SolanaChainClient {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            inner: RpcClient::new_with_timeout(url.to_string(), timeout),
        }
    }
}

#[async_trait]
impl ChainClient for SolanaChainClient {
    async fn block_number(&self) -> Result<u64> {
        Ok(self.inner.get_slot().await?)
    }

    async fn code_at(&self, address: &str) -> Result<Vec<u8>> {
        let pubkey = Pubkey::from_str(address)
            .map_err(|e| Error::Rpc(format!("Invalid address {}: {}", address, e)))?;
        Ok(self.inner.get_account_data(&pubkey).await?)
    }
}

/// Connector producing [`SolanaChainClient`]s
pub struct SolanaConnector {
    request_timeout: Duration,
}

impl SolanaConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Connector for SolanaConnector {
    fn connect(&self, endpoint: &Endpoint) -> Arc<dyn ChainClient> {
        Arc::new(SolanaChainClient::new(&endpoint.url, self.request_timeout))
    }
}
