// DexScreener API client: market metrics and USD prices for the core
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::market::{MarketMetrics, MetricsProvider, PriceSource};

const DEXSCREENER_BASE: &str = "https://api.dexscreener.com";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidity {
    pub usd: Option<f64>,
    pub base: Option<f64>,
    pub quote: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub m5: Option<f64>,
    pub h1: Option<f64>,
    pub h6: Option<f64>,
    pub h24: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaseToken {
    pub address: String,
    pub name: Option<String>,
    pub symbol: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DexPair {
    #[serde(rename = "chainId")]
    pub chain_id: String,
    #[serde(rename = "dexId")]
    pub dex_id: String,
    #[serde(rename = "pairAddress")]
    pub pair_address: String,
    #[serde(rename = "baseToken")]
    pub base_token: BaseToken,
    #[serde(rename = "priceUsd")]
    pub price_usd: Option<String>,
    pub volume: Option<Volume>,
    pub liquidity: Option<Liquidity>,
    #[serde(rename = "fdv")]
    pub fdv: Option<f64>,
}

impl DexPair {
    pub fn liquidity_usd(&self) -> f64 {
        self.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0)
    }

    pub fn price(&self) -> Option<f64> {
        self.price_usd
            .as_ref()
            .and_then(|p| p.parse::<f64>().ok())
            .filter(|p| p.is_finite() && *p > 0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPairsResponse {
    pub pairs: Option<Vec<DexPair>>,
}

/// Deepest pool for `token` on `chain`
pub fn best_pair(pairs: Vec<DexPair>, chain: &str, token: &str) -> Option<DexPair> {
    pairs
        .into_iter()
        .filter(|p| p.chain_id == chain && p.base_token.address == token)
        .max_by(|a, b| a.liquidity_usd().total_cmp(&b.liquidity_usd()))
}

/// DexScreener reports pool data only; holder, tax and LP lock data stay
/// unknown so the scorer applies its missing-data rules.
pub fn pair_to_metrics(pair: &DexPair) -> MarketMetrics {
    MarketMetrics {
        liquidity_usd: pair.liquidity_usd(),
        volume_24h: pair.volume.as_ref().and_then(|v| v.h24).unwrap_or(0.0),
        price_usd: pair.price().unwrap_or(0.0),
        holders: None,
        buy_tax: None,
        sell_tax: None,
        fdv: pair.fdv,
        top_holders: None,
        lp_locked: None,
    }
}

pub struct DexScreenerClient {
    client: reqwest::Client,
    base_url: String,
    chain: String,
}

impl DexScreenerClient {
    pub fn new(chain: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build DexScreener client: {}", e)))?;

        Ok(Self {
            client,
            base_url: DEXSCREENER_BASE.to_string(),
            chain: chain.into(),
        })
    }

    /// Fetch the deepest pair for a token
    pub async fn get_token_pair(&self, token: &str) -> Result<Option<DexPair>> {
        let url = format!("{}/latest/dex/tokens/{}", self.base_url, token);
        let resp = self.client.get(&url).send().await?.error_for_status()?;
        let data: TokenPairsResponse = resp.json().await?;

        Ok(data
            .pairs
            .and_then(|pairs| best_pair(pairs, &self.chain, token)))
    }
}

#[async_trait]
impl MetricsProvider for DexScreenerClient {
    async fn fetch(&self, token: &str) -> Option<MarketMetrics> {
        match self.get_token_pair(token).await {
            Ok(Some(pair)) => {
                let metrics = pair_to_metrics(&pair);
                debug!(
                    token = %token,
                    dex = %pair.dex_id,
                    liquidity_usd = metrics.liquidity_usd,
                    volume_24h = metrics.volume_24h,
                    "Fetched metrics"
                );
                Some(metrics)
            }
            Ok(None) => {
                debug!(token = %token, "No pairs listed");
                None
            }
            Err(e) => {
                warn!(token = %token, error = %e, "Metrics fetch failed");
                None
            }
        }
    }
}

#[async_trait]
impl PriceSource for DexScreenerClient {
    async fn price_usd(&self, token: &str) -> Result<f64> {
        self.get_token_pair(token)
            .await?
            .and_then(|pair| pair.price())
            .ok_or_else(|| Error::PriceUnavailable(token.to_string()))
    }
}
