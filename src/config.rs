//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

pub use crate::position::types::TradeMode;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub guard: GuardConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub auto_sell: AutoSellConfig,
}

/// A single RPC endpoint as configured
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct EndpointConfig {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// Endpoints in priority order
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<EndpointConfig>,
    /// How long a healthy client is reused before re-probing
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Timeout for a single liveness probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Background health monitor interval
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
    /// Consecutive failed probes before rotating away from an endpoint
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            cache_ttl_secs: default_cache_ttl_secs(),
            probe_timeout_ms: default_probe_timeout_ms(),
            health_interval_secs: default_health_interval_secs(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

/// Sub-metric weights for the risk score
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ScoringWeights {
    #[serde(default = "default_weight_liquidity")]
    pub liquidity: f64,
    #[serde(default = "default_weight_contract")]
    pub contract: f64,
    #[serde(default = "default_weight_activity")]
    pub activity: f64,
    #[serde(default = "default_weight_dev_wallets")]
    pub dev_wallets: f64,
}

impl ScoringWeights {
    pub fn total(&self) -> f64 {
        self.liquidity + self.contract + self.activity + self.dev_wallets
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            liquidity: default_weight_liquidity(),
            contract: default_weight_contract(),
            activity: default_weight_activity(),
            dev_wallets: default_weight_dev_wallets(),
        }
    }
}

/// Buy sizing policy for one risk tier
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct TierPolicy {
    /// Fraction of the normal trade size (0 vetoes the trade)
    pub buy_fraction: f64,
    /// Floor for the trade size in USD
    pub min_buy_usd: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TierPolicyTable {
    #[serde(default = "default_policy_low")]
    pub low: TierPolicy,
    #[serde(default = "default_policy_medium")]
    pub medium: TierPolicy,
    #[serde(default = "default_policy_high")]
    pub high: TierPolicy,
}

impl Default for TierPolicyTable {
    fn default() -> Self {
        Self {
            low: default_policy_low(),
            medium: default_policy_medium(),
            high: default_policy_high(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoringConfig {
    /// Liquidity at which the liquidity sub-metric saturates
    #[serde(default = "default_liquidity_threshold_usd")]
    pub liquidity_threshold_usd: f64,
    /// Below this liquidity the `low_liquidity` flag is raised
    #[serde(default = "default_flag_min_liquidity_usd")]
    pub min_liquidity_usd: f64,
    #[serde(default = "default_min_holders")]
    pub min_holders: u64,
    /// Buy/sell tax above this percentage is flagged
    #[serde(default = "default_max_tax_pct")]
    pub max_tax_pct: f64,
    /// Summed top-holder share at which dev concentration reaches 1.0
    #[serde(default = "default_dev_danger_share")]
    pub dev_danger_share: f64,
    /// Dev concentration assumed when holder data is missing
    #[serde(default = "default_unknown_dev_concentration")]
    pub unknown_dev_concentration: f64,
    /// 24h volume / liquidity ratio at which activity saturates
    #[serde(default = "default_activity_target_ratio")]
    pub activity_target_ratio: f64,
    #[serde(default = "default_volume_spike_ratio")]
    pub volume_spike_ratio: f64,
    #[serde(default = "default_dev_concentration_flag")]
    pub dev_concentration_flag: f64,
    #[serde(default)]
    pub weights: ScoringWeights,
    #[serde(default = "default_low_tier_min")]
    pub low_tier_min: u8,
    #[serde(default = "default_medium_tier_min")]
    pub medium_tier_min: u8,
    #[serde(default)]
    pub policy: TierPolicyTable,
    /// Advisory keywords searched for in the token's on-chain code/data
    #[serde(default = "default_bytecode_keywords")]
    pub bytecode_keywords: Vec<String>,
    #[serde(default = "default_true")]
    pub code_lookup_enabled: bool,
    #[serde(default = "default_code_lookup_timeout_ms")]
    pub code_lookup_timeout_ms: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            liquidity_threshold_usd: default_liquidity_threshold_usd(),
            min_liquidity_usd: default_flag_min_liquidity_usd(),
            min_holders: default_min_holders(),
            max_tax_pct: default_max_tax_pct(),
            dev_danger_share: default_dev_danger_share(),
            unknown_dev_concentration: default_unknown_dev_concentration(),
            activity_target_ratio: default_activity_target_ratio(),
            volume_spike_ratio: default_volume_spike_ratio(),
            dev_concentration_flag: default_dev_concentration_flag(),
            weights: ScoringWeights::default(),
            low_tier_min: default_low_tier_min(),
            medium_tier_min: default_medium_tier_min(),
            policy: TierPolicyTable::default(),
            bytecode_keywords: default_bytecode_keywords(),
            code_lookup_enabled: true,
            code_lookup_timeout_ms: default_code_lookup_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardConfig {
    #[serde(default = "default_max_trade_usd")]
    pub max_trade_usd: f64,
    #[serde(default = "default_max_daily_loss_usd")]
    pub max_daily_loss_usd: f64,
    #[serde(default = "default_max_loss_streak")]
    pub max_loss_streak: u32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_trade_usd: default_max_trade_usd(),
            max_daily_loss_usd: default_max_daily_loss_usd(),
            max_loss_streak: default_max_loss_streak(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Ledger document path; `None` keeps the ledger in memory
    #[serde(default = "default_ledger_path")]
    pub path: Option<String>,
    #[serde(default = "default_initial_balance_usd")]
    pub initial_balance_usd: f64,
    /// Simulated slippage applied to paper fills
    #[serde(default = "default_paper_slippage_pct")]
    pub slippage_pct: f64,
    /// Share of the balance committed per trade
    #[serde(default = "default_risk_percent")]
    pub risk_percent: f64,
    /// Buys below this amount are ignored
    #[serde(default = "default_min_trade_usd")]
    pub min_trade_usd: f64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// A lock marker older than this is considered left over from a crash
    #[serde(default = "default_stale_lock_secs")]
    pub stale_lock_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: default_ledger_path(),
            initial_balance_usd: default_initial_balance_usd(),
            slippage_pct: default_paper_slippage_pct(),
            risk_percent: default_risk_percent(),
            min_trade_usd: default_min_trade_usd(),
            lock_timeout_ms: default_lock_timeout_ms(),
            stale_lock_secs: default_stale_lock_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub mode: TradeMode,
    /// Pre-check: minimum pool liquidity
    #[serde(default = "default_exec_min_liquidity_usd")]
    pub min_liquidity_usd: f64,
    /// Pre-check: minimum blocks since pair creation (0 disables)
    #[serde(default)]
    pub min_block_age: u64,
    /// Per-token lock is held this long after completion
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_trade_timeout_ms")]
    pub trade_timeout_ms: u64,
    /// Slippage tolerance passed to the exchange adapter
    #[serde(default = "default_live_slippage_pct")]
    pub slippage_pct: f64,
    #[serde(default = "default_retry_initial_ms")]
    pub retry_initial_ms: u64,
    #[serde(default = "default_retry_max_elapsed_ms")]
    pub retry_max_elapsed_ms: u64,
    /// Concurrent candidate workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Trade API used for LIVE fills
    #[serde(default)]
    pub adapter_url: Option<String>,
    #[serde(default)]
    pub adapter_api_key: Option<String>,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: TradeMode::default(),
            min_liquidity_usd: default_exec_min_liquidity_usd(),
            min_block_age: 0,
            cooldown_secs: default_cooldown_secs(),
            trade_timeout_ms: default_trade_timeout_ms(),
            slippage_pct: default_live_slippage_pct(),
            retry_initial_ms: default_retry_initial_ms(),
            retry_max_elapsed_ms: default_retry_max_elapsed_ms(),
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            adapter_url: None,
            adapter_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoSellConfig {
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    /// Enable trailing stop to lock in profits
    #[serde(default = "default_true")]
    pub trailing_stop_enabled: bool,
    /// Distance from peak to trigger sell (e.g., 15 = sell if drops 15% from peak)
    #[serde(default = "default_trailing_stop_pct")]
    pub trailing_stop_pct: f64,
    #[serde(default = "default_price_poll_interval_ms")]
    pub price_poll_interval_ms: u64,
}

impl Default for AutoSellConfig {
    fn default() -> Self {
        Self {
            take_profit_pct: default_take_profit_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            trailing_stop_enabled: true,
            trailing_stop_pct: default_trailing_stop_pct(),
            price_poll_interval_ms: default_price_poll_interval_ms(),
        }
    }
}

fn default_endpoints() -> Vec<EndpointConfig> {
    vec![EndpointConfig {
        url: "https://api.mainnet-beta.solana.com".to_string(),
        name: Some("mainnet-beta".to_string()),
    }]
}

fn default_cache_ttl_secs() -> u64 {
    60
}

fn default_probe_timeout_ms() -> u64 {
    5_000
}

fn default_health_interval_secs() -> u64 {
    15
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_weight_liquidity() -> f64 {
    0.25
}

fn default_weight_contract() -> f64 {
    0.35
}

fn default_weight_activity() -> f64 {
    0.20
}

fn default_weight_dev_wallets() -> f64 {
    0.20
}

fn default_policy_low() -> TierPolicy {
    TierPolicy {
        buy_fraction: 1.0,
        min_buy_usd: 10.0,
    }
}

fn default_policy_medium() -> TierPolicy {
    TierPolicy {
        buy_fraction: 0.5,
        min_buy_usd: 5.0,
    }
}

fn default_policy_high() -> TierPolicy {
    TierPolicy {
        buy_fraction: 0.0,
        min_buy_usd: 0.0,
    }
}

fn default_liquidity_threshold_usd() -> f64 {
    20_000.0
}

fn default_flag_min_liquidity_usd() -> f64 {
    5_000.0
}

fn default_min_holders() -> u64 {
    50
}

fn default_max_tax_pct() -> f64 {
    10.0
}

fn default_dev_danger_share() -> f64 {
    0.5
}

fn default_unknown_dev_concentration() -> f64 {
    0.5
}

fn default_activity_target_ratio() -> f64 {
    1.0
}

fn default_volume_spike_ratio() -> f64 {
    3.0
}

fn default_dev_concentration_flag() -> f64 {
    0.6
}

fn default_low_tier_min() -> u8 {
    75
}

fn default_medium_tier_min() -> u8 {
    45
}

fn default_bytecode_keywords() -> Vec<String> {
    ["blacklist", "setfee", "pause", "onlyowner", "mint", "settax"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_code_lookup_timeout_ms() -> u64 {
    3_000
}

fn default_max_trade_usd() -> f64 {
    100.0
}

fn default_max_daily_loss_usd() -> f64 {
    200.0
}

fn default_max_loss_streak() -> u32 {
    3
}

fn default_ledger_path() -> Option<String> {
    Some("data/ledger.json".to_string())
}

fn default_initial_balance_usd() -> f64 {
    1_000.0
}

fn default_paper_slippage_pct() -> f64 {
    1.0
}

fn default_risk_percent() -> f64 {
    5.0
}

fn default_min_trade_usd() -> f64 {
    1.0
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_stale_lock_secs() -> u64 {
    60
}

fn default_exec_min_liquidity_usd() -> f64 {
    10_000.0
}

fn default_cooldown_secs() -> u64 {
    30
}

fn default_trade_timeout_ms() -> u64 {
    20_000
}

fn default_live_slippage_pct() -> f64 {
    5.0
}

fn default_retry_initial_ms() -> u64 {
    250
}

fn default_retry_max_elapsed_ms() -> u64 {
    3_000
}

fn default_workers() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_take_profit_pct() -> f64 {
    20.0
}

fn default_stop_loss_pct() -> f64 {
    10.0
}

fn default_trailing_stop_pct() -> f64 {
    15.0
}

fn default_price_poll_interval_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file and environment
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix SNIPER_)
            .add_source(
                config::Environment::with_prefix("SNIPER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.rpc.endpoints.is_empty() {
            anyhow::bail!("at least one rpc endpoint is required");
        }
        for endpoint in &self.rpc.endpoints {
            url::Url::parse(&endpoint.url)
                .with_context(|| format!("Invalid rpc endpoint url: {}", mask_url(&endpoint.url)))?;
        }
        if self.rpc.failure_threshold == 0 {
            anyhow::bail!("rpc.failure_threshold must be at least 1");
        }

        let weights = &self.scoring.weights;
        if [weights.liquidity, weights.contract, weights.activity, weights.dev_wallets]
            .iter()
            .any(|w| *w < 0.0)
        {
            anyhow::bail!("scoring weights cannot be negative");
        }
        if weights.total() <= 0.0 {
            anyhow::bail!("scoring weights must sum to a positive value");
        }
        if self.scoring.low_tier_min > 100 || self.scoring.medium_tier_min > self.scoring.low_tier_min {
            anyhow::bail!(
                "tier thresholds must satisfy medium ({}) <= low ({}) <= 100",
                self.scoring.medium_tier_min,
                self.scoring.low_tier_min
            );
        }
        if self.scoring.liquidity_threshold_usd <= 0.0 || self.scoring.dev_danger_share <= 0.0 {
            anyhow::bail!("liquidity_threshold_usd and dev_danger_share must be positive");
        }
        if self.scoring.activity_target_ratio <= 0.0 {
            anyhow::bail!("activity_target_ratio must be positive");
        }
        for policy in [&self.scoring.policy.low, &self.scoring.policy.medium, &self.scoring.policy.high] {
            if !(0.0..=1.0).contains(&policy.buy_fraction) || policy.min_buy_usd < 0.0 {
                anyhow::bail!("tier policy buy_fraction must be in [0, 1] and min_buy_usd >= 0");
            }
        }

        // Validate safety limits
        if self.guard.max_trade_usd <= 0.0 {
            anyhow::bail!("guard.max_trade_usd must be positive");
        }
        if self.guard.max_daily_loss_usd <= 0.0 {
            anyhow::bail!("guard.max_daily_loss_usd must be positive");
        }
        if self.guard.max_loss_streak == 0 {
            anyhow::bail!("guard.max_loss_streak must be at least 1");
        }

        if self.ledger.initial_balance_usd < 0.0 {
            anyhow::bail!("ledger.initial_balance_usd cannot be negative");
        }
        if !(0.0..100.0).contains(&self.ledger.slippage_pct) {
            anyhow::bail!("ledger.slippage_pct must be in [0, 100)");
        }
        if self.ledger.risk_percent <= 0.0 || self.ledger.risk_percent > 100.0 {
            anyhow::bail!("ledger.risk_percent must be in (0, 100]");
        }

        if self.execution.workers == 0 || self.execution.queue_capacity == 0 {
            anyhow::bail!("execution.workers and execution.queue_capacity must be positive");
        }
        if let Some(adapter_url) = &self.execution.adapter_url {
            url::Url::parse(adapter_url)
                .with_context(|| format!("Invalid execution.adapter_url: {}", mask_url(adapter_url)))?;
        }

        // Validate auto-sell percentages
        if self.auto_sell.take_profit_pct <= 0.0 {
            anyhow::bail!("take_profit_pct must be positive");
        }
        if self.auto_sell.stop_loss_pct <= 0.0 || self.auto_sell.stop_loss_pct >= 100.0 {
            anyhow::bail!("stop_loss_pct must be between 0 and 100");
        }
        if self.auto_sell.trailing_stop_enabled
            && (self.auto_sell.trailing_stop_pct <= 0.0 || self.auto_sell.trailing_stop_pct >= 100.0)
        {
            anyhow::bail!("trailing_stop_pct must be between 0 and 100");
        }
        if self.auto_sell.price_poll_interval_ms == 0 {
            anyhow::bail!("price_poll_interval_ms must be positive");
        }

        if self.execution.mode == TradeMode::Live {
            tracing::warn!("Execution mode is LIVE - trades will spend real funds");
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        let endpoints: Vec<String> = self
            .rpc
            .endpoints
            .iter()
            .map(|e| mask_url(&e.url))
            .collect();

        format!(
            r#"Configuration:
  RPC:
    endpoints: {:?}
    cache_ttl: {}s
    probe_timeout: {}ms
    health_interval: {}s (rotate after {} failures)
  Scoring:
    liquidity_threshold: ${}
    weights: liquidity={} contract={} activity={} dev_wallets={}
    tiers: LOW>={} MEDIUM>={}
  Guard:
    max_trade: ${}
    max_daily_loss: ${}
    max_loss_streak: {}
  Ledger:
    path: {}
    initial_balance: ${}
    risk: {}% slippage: {}%
  Execution:
    mode: {}
    min_liquidity: ${}
    cooldown: {}s
    trade_timeout: {}ms
    adapter: {} (api key {})
  Auto-Sell:
    take_profit: {}%
    stop_loss: {}%
    trailing_stop: {} ({}%)
    poll_interval: {}ms
"#,
            endpoints,
            self.rpc.cache_ttl_secs,
            self.rpc.probe_timeout_ms,
            self.rpc.health_interval_secs,
            self.rpc.failure_threshold,
            self.scoring.liquidity_threshold_usd,
            self.scoring.weights.liquidity,
            self.scoring.weights.contract,
            self.scoring.weights.activity,
            self.scoring.weights.dev_wallets,
            self.scoring.low_tier_min,
            self.scoring.medium_tier_min,
            self.guard.max_trade_usd,
            self.guard.max_daily_loss_usd,
            self.guard.max_loss_streak,
            self.ledger.path.as_deref().unwrap_or("(in-memory)"),
            self.ledger.initial_balance_usd,
            self.ledger.risk_percent,
            self.ledger.slippage_pct,
            self.execution.mode,
            self.execution.min_liquidity_usd,
            self.execution.cooldown_secs,
            self.execution.trade_timeout_ms,
            self.execution
                .adapter_url
                .as_deref()
                .map(mask_url)
                .unwrap_or_else(|| "(none)".to_string()),
            if self.execution.adapter_api_key.is_some() { "set" } else { "unset" },
            self.auto_sell.take_profit_pct,
            self.auto_sell.stop_loss_pct,
            self.auto_sell.trailing_stop_enabled,
            self.auto_sell.trailing_stop_pct,
            self.auto_sell.price_poll_interval_ms,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}
