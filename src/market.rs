//! Market data types and the provider seams the core consumes
//!
//! Discovery and metrics collection live outside the core. Candidates arrive
//! as [`CandidateToken`] events, metrics through a [`MetricsProvider`], and
//! live prices through a [`PriceSource`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A newly discovered trading pair handed to the core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateToken {
    /// Token address
    pub token: String,
    /// Pair / pool address
    pub pair: String,
    #[serde(default = "default_chain")]
    pub chain: String,
    /// Block (slot) at which the pair was created, if known
    #[serde(default)]
    pub creation_block: Option<u64>,
    /// When the pair was discovered
    pub timestamp: DateTime<Utc>,
}

fn default_chain() -> String {
    "solana".to_string()
}

impl CandidateToken {
    pub fn new(token: impl Into<String>, pair: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            pair: pair.into(),
            chain: default_chain(),
            creation_block: None,
            timestamp: Utc::now(),
        }
    }
}

/// Share of supply held by one of the largest holders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopHolder {
    pub address: String,
    /// Fraction of total supply, 0..1
    pub share: f64,
}

/// Raw metrics for a token as reported by a market-data provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MarketMetrics {
    pub liquidity_usd: f64,
    pub volume_24h: f64,
    pub price_usd: f64,
    #[serde(default)]
    pub holders: Option<u64>,
    /// Buy tax in percent
    #[serde(default)]
    pub buy_tax: Option<f64>,
    /// Sell tax in percent
    #[serde(default)]
    pub sell_tax: Option<f64>,
    #[serde(default)]
    pub fdv: Option<f64>,
    #[serde(default)]
    pub top_holders: Option<Vec<TopHolder>>,
    /// Whether the pool's LP tokens are locked or burned
    #[serde(default)]
    pub lp_locked: Option<bool>,
}

impl MarketMetrics {
    /// Metrics assumed when the provider returned nothing
    pub fn worst_case() -> Self {
        Self::default()
    }

    /// Summed share of the reported top holders
    pub fn top_holder_share(&self) -> Option<f64> {
        self.top_holders
            .as_ref()
            .filter(|holders| !holders.is_empty())
            .map(|holders| holders.iter().map(|h| h.share.max(0.0)).sum::<f64>().min(1.0))
    }

    /// 24h volume relative to pool liquidity
    pub fn volume_to_liquidity(&self) -> f64 {
        if self.liquidity_usd <= 0.0 {
            return 0.0;
        }
        self.volume_24h / self.liquidity_usd
    }
}

/// Source of token metrics; `None` means the data is unavailable
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    async fn fetch(&self, token: &str) -> Option<MarketMetrics>;
}

/// Source of current token prices in USD
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn price_usd(&self, token: &str) -> Result<f64>;
}
