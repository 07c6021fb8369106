//! Exchange adapter seam
//!
//! The core never encodes swaps itself. LIVE trades go through an
//! [`ExchangeAdapter`]; [`HttpExchangeAdapter`] talks to a trade API that
//! builds, signs and lands the swap and reports the fill.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Fill reported for a buy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyReceipt {
    pub tx_ref: String,
    pub executed_price_usd: f64,
    pub tokens_received: f64,
}

/// Fill reported for a sell
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SellReceipt {
    pub tx_ref: String,
    pub executed_price_usd: f64,
    pub usd_received: f64,
}

/// Capability to execute swaps on the DEX
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn buy(&self, token: &str, usd_amount: f64, slippage_pct: f64) -> Result<BuyReceipt>;

    async fn sell(&self, token: &str, token_amount: f64, slippage_pct: f64) -> Result<SellReceipt>;
}

/// Trade action
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
enum TradeAction {
    Buy,
    Sell,
}

impl TradeAction {
    fn side(self) -> &'static str {
        match self {
            TradeAction::Buy => "buy",
            TradeAction::Sell => "sell",
        }
    }
}

/// Trade request body
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct TradeRequest<'a> {
    action: TradeAction,
    token: &'a str,
    /// USD for buys, tokens for sells
    amount: f64,
    slippage_pct: f64,
}

/// Trade response body; fill fields are present on success
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TradeResponse {
    tx_ref: Option<String>,
    executed_price_usd: Option<f64>,
    tokens_received: Option<f64>,
    usd_received: Option<f64>,
    error: Option<String>,
}

/// Client for an HTTP trade API
pub struct HttpExchangeAdapter {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl HttpExchangeAdapter {
    pub fn new(url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build trade API client: {}", e)))?;

        Ok(Self {
            client,
            url: url.into(),
            api_key,
        })
    }

    async fn execute(&self, action: TradeAction, token: &str, amount: f64, slippage_pct: f64) -> Result<TradeResponse> {
        let side = action.side();
        let exchange_error = |message: String, retryable: bool| Error::Exchange {
            side,
            token: token.to_string(),
            message,
            retryable,
        };

        let request = TradeRequest {
            action,
            token,
            amount,
            slippage_pct,
        };

        let mut builder = self.client.post(&self.url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        debug!(token = %token, side, amount, "Sending trade request");

        let response = builder
            .send()
            .await
            .map_err(|e| exchange_error(format!("HTTP request failed: {}", e), true))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
            return Err(exchange_error(format!("HTTP {}: {}", status, body.trim()), retryable));
        }

        let trade: TradeResponse = response
            .json()
            .await
            .map_err(|e| exchange_error(format!("Failed to parse response: {}", e), false))?;

        if let Some(error) = trade.error.clone() {
            return Err(exchange_error(error, false));
        }

        Ok(trade)
    }
}

fn missing(side: &'static str, token: &str, field: &str) -> Error {
    Error::Exchange {
        side,
        token: token.to_string(),
        message: format!("No {} in response", field),
        retryable: false,
    }
}

#[async_trait]
impl ExchangeAdapter for HttpExchangeAdapter {
    async fn buy(&self, token: &str, usd_amount: f64, slippage_pct: f64) -> Result<BuyReceipt> {
        info!(token = %token, usd_amount, slippage_pct, "Executing buy");
        let trade = self.execute(TradeAction::Buy, token, usd_amount, slippage_pct).await?;

        Ok(BuyReceipt {
            tx_ref: trade.tx_ref.ok_or_else(|| missing("buy", token, "txRef"))?,
            executed_price_usd: trade
                .executed_price_usd
                .ok_or_else(|| missing("buy", token, "executedPriceUsd"))?,
            tokens_received: trade
                .tokens_received
                .ok_or_else(|| missing("buy", token, "tokensReceived"))?,
        })
    }

    async fn sell(&self, token: &str, token_amount: f64, slippage_pct: f64) -> Result<SellReceipt> {
        info!(token = %token, token_amount, slippage_pct, "Executing sell");
        let trade = self.execute(TradeAction::Sell, token, token_amount, slippage_pct).await?;

        Ok(SellReceipt {
            tx_ref: trade.tx_ref.ok_or_else(|| missing("sell", token, "txRef"))?,
            executed_price_usd: trade
                .executed_price_usd
                .ok_or_else(|| missing("sell", token, "executedPriceUsd"))?,
            usd_received: trade
                .usd_received
                .ok_or_else(|| missing("sell", token, "usdReceived"))?,
        })
    }
}
