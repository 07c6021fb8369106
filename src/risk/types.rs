//! Risk signal types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Risk tier derived from the score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskTier {
    Low,
    Medium,
    High,
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskTier::Low => write!(f, "LOW"),
            RiskTier::Medium => write!(f, "MEDIUM"),
            RiskTier::High => write!(f, "HIGH"),
        }
    }
}

/// Individual risk indicators raised while scoring
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    LowLiquidity,
    LowHolders,
    HighBuyTax,
    HighSellTax,
    TaxUnknown,
    /// Advisory keyword found in the token's on-chain code
    SuspiciousCode(String),
    LiquidityUnlocked,
    AbnormalVolumeSpike,
    DevConcentrationHigh,
    HolderDataUnavailable,
    MetricsUnavailable,
}

impl fmt::Display for RiskFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskFlag::LowLiquidity => write!(f, "low_liquidity"),
            RiskFlag::LowHolders => write!(f, "low_holders"),
            RiskFlag::HighBuyTax => write!(f, "high_buy_tax"),
            RiskFlag::HighSellTax => write!(f, "high_sell_tax"),
            RiskFlag::TaxUnknown => write!(f, "tax_unknown"),
            RiskFlag::SuspiciousCode(keyword) => write!(f, "suspicious_code:{}", keyword),
            RiskFlag::LiquidityUnlocked => write!(f, "liquidity_unlocked"),
            RiskFlag::AbnormalVolumeSpike => write!(f, "abnormal_volume_spike"),
            RiskFlag::DevConcentrationHigh => write!(f, "dev_concentration_high"),
            RiskFlag::HolderDataUnavailable => write!(f, "holder_data_unavailable"),
            RiskFlag::MetricsUnavailable => write!(f, "metrics_unavailable"),
        }
    }
}

/// Metrics snapshot carried on the signal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalMetrics {
    pub liquidity_usd: f64,
    pub holders: Option<u64>,
    pub volume_24h: f64,
    /// 0 (dispersed) .. 1 (fully concentrated)
    pub dev_concentration: f64,
    pub buy_tax: Option<f64>,
    pub sell_tax: Option<f64>,
    pub age_seconds: i64,
}

/// The four 0..1 sub-metrics behind the score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScores {
    pub liquidity: f64,
    pub contract_safety: f64,
    pub activity: f64,
    pub dev_wallets: f64,
}

/// Scored rug/fraud-risk assessment of a token. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSignal {
    pub token: String,
    /// 0 (worst) ..= 100 (best)
    pub score: u8,
    pub tier: RiskTier,
    pub flags: BTreeSet<RiskFlag>,
    pub metrics: SignalMetrics,
    pub components: SubScores,
    pub recommended_buy_fraction: f64,
    pub min_buy_usd: f64,
    pub created_at: DateTime<Utc>,
}

impl RiskSignal {
    /// The sizing policy refuses to trade this token
    pub fn is_vetoed(&self) -> bool {
        self.recommended_buy_fraction <= 0.0
    }

    pub fn has_flag(&self, flag: &RiskFlag) -> bool {
        self.flags.contains(flag)
    }

    /// Flags as a comma separated list for logs
    pub fn flag_list(&self) -> String {
        self.flags
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for RiskSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} score={} tier={} liq=${:.0} flags=[{}]",
            self.token,
            self.score,
            self.tier,
            self.metrics.liquidity_usd,
            self.flag_list()
        )
    }
}
