//! RPC endpoint failover

pub mod client;
pub mod pool;

pub use client::{ChainClient, Connector, SolanaConnector};
pub use pool::{Endpoint, ProviderPool};
