//! Weighted risk scoring
//!
//! Turns raw market metrics (and optional code heuristics) into a
//! [`RiskSignal`]. The scoring core is pure: identical inputs, including the
//! clock, always produce the same signal.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{ScoringConfig, TierPolicy};
use crate::error::Result;
use crate::market::{CandidateToken, MarketMetrics};
use crate::risk::bytecode::{CodeFindings, KeywordScanner};
use crate::risk::types::{RiskFlag, RiskSignal, RiskTier, SignalMetrics, SubScores};
use crate::rpc::ProviderPool;

/// Risk scorer
pub struct RiskScorer {
    config: ScoringConfig,
    scanner: KeywordScanner,
    pool: Option<Arc<ProviderPool>>,
}

impl RiskScorer {
    pub fn new(config: ScoringConfig) -> Result<Self> {
        let scanner = KeywordScanner::new(&config.bytecode_keywords)?;
        Ok(Self {
            config,
            scanner,
            pool: None,
        })
    }

    /// Enable live code lookups through the provider pool
    pub fn with_pool(mut self, pool: Arc<ProviderPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Score a candidate, running the optional code lookup first
    pub async fn score(&self, candidate: &CandidateToken, metrics: Option<&MarketMetrics>) -> RiskSignal {
        let findings = self.lookup_code(&candidate.token).await;
        let signal = self.score_at(candidate, metrics, findings.as_ref(), Utc::now());

        info!(
            token = %signal.token,
            score = signal.score,
            tier = %signal.tier,
            flags = %signal.flag_list(),
            "Token scored"
        );

        signal
    }

    /// Best-effort code heuristics; any failure yields `None`
    async fn lookup_code(&self, token: &str) -> Option<CodeFindings> {
        if !self.config.code_lookup_enabled {
            return None;
        }
        let pool = self.pool.as_ref()?;
        let timeout = Duration::from_millis(self.config.code_lookup_timeout_ms);

        match tokio::time::timeout(timeout, pool.code_at(token)).await {
            Ok(Ok(code)) => Some(self.scanner.scan(&code)),
            Ok(Err(e)) => {
                debug!(token = %token, error = %e, "Code lookup failed, scoring without it");
                None
            }
            Err(_) => {
                debug!(token = %token, "Code lookup timed out, scoring without it");
                pool.rotate().await;
                None
            }
        }
    }

    /// Pure scoring core
    pub fn score_at(
        &self,
        candidate: &CandidateToken,
        metrics: Option<&MarketMetrics>,
        code: Option<&CodeFindings>,
        now: DateTime<Utc>,
    ) -> RiskSignal {
        let cfg = &self.config;
        let mut flags = BTreeSet::new();

        let worst_case;
        let m = match metrics {
            Some(m) => m,
            None => {
                flags.insert(RiskFlag::MetricsUnavailable);
                worst_case = MarketMetrics::worst_case();
                &worst_case
            }
        };

        let dev_concentration = if metrics.is_none() {
            1.0
        } else {
            match m.top_holder_share() {
                Some(share) => (share / cfg.dev_danger_share).clamp(0.0, 1.0),
                None => {
                    flags.insert(RiskFlag::HolderDataUnavailable);
                    cfg.unknown_dev_concentration.clamp(0.0, 1.0)
                }
            }
        };

        let volume_ratio = m.volume_to_liquidity();
        let liquidity = (m.liquidity_usd / cfg.liquidity_threshold_usd).clamp(0.0, 1.0);
        let contract_safety = 1.0 - dev_concentration;
        let activity = (volume_ratio / cfg.activity_target_ratio).clamp(0.0, 1.0);
        // Same value as contract safety: concentration risk is weighted twice
        let dev_wallets = contract_safety;

        let w = &cfg.weights;
        let weighted = w.liquidity * liquidity
            + w.contract * contract_safety
            + w.activity * activity
            + w.dev_wallets * dev_wallets;
        let normalized = weighted / w.total();
        let score = (normalized * 100.0).round().clamp(0.0, 100.0) as u8;

        if m.liquidity_usd < cfg.min_liquidity_usd {
            flags.insert(RiskFlag::LowLiquidity);
        }
        match m.holders {
            Some(holders) if holders >= cfg.min_holders => {}
            _ => {
                flags.insert(RiskFlag::LowHolders);
            }
        }
        match (m.buy_tax, m.sell_tax) {
            (Some(buy), Some(sell)) => {
                if buy > cfg.max_tax_pct {
                    flags.insert(RiskFlag::HighBuyTax);
                }
                if sell > cfg.max_tax_pct {
                    flags.insert(RiskFlag::HighSellTax);
                }
            }
            (buy, sell) => {
                flags.insert(RiskFlag::TaxUnknown);
                if buy.map_or(false, |t| t > cfg.max_tax_pct) {
                    flags.insert(RiskFlag::HighBuyTax);
                }
                if sell.map_or(false, |t| t > cfg.max_tax_pct) {
                    flags.insert(RiskFlag::HighSellTax);
                }
            }
        }
        if m.lp_locked == Some(false) {
            flags.insert(RiskFlag::LiquidityUnlocked);
        }
        if volume_ratio > cfg.volume_spike_ratio {
            flags.insert(RiskFlag::AbnormalVolumeSpike);
        }
        if dev_concentration > cfg.dev_concentration_flag {
            flags.insert(RiskFlag::DevConcentrationHigh);
        }
        if let Some(findings) = code {
            for keyword in &findings.matched {
                flags.insert(RiskFlag::SuspiciousCode(keyword.clone()));
            }
        }

        let tier = self.tier_for(score);
        let policy = self.policy_for(tier);

        RiskSignal {
            token: candidate.token.clone(),
            score,
            tier,
            flags,
            metrics: SignalMetrics {
                liquidity_usd: m.liquidity_usd,
                holders: m.holders,
                volume_24h: m.volume_24h,
                dev_concentration,
                buy_tax: m.buy_tax,
                sell_tax: m.sell_tax,
                age_seconds: (now - candidate.timestamp).num_seconds().max(0),
            },
            components: SubScores {
                liquidity,
                contract_safety,
                activity,
                dev_wallets,
            },
            recommended_buy_fraction: policy.buy_fraction,
            min_buy_usd: policy.min_buy_usd,
            created_at: now,
        }
    }

    pub fn tier_for(&self, score: u8) -> RiskTier {
        if score >= self.config.low_tier_min {
            RiskTier::Low
        } else if score >= self.config.medium_tier_min {
            RiskTier::Medium
        } else {
            RiskTier::High
        }
    }

    pub fn policy_for(&self, tier: RiskTier) -> TierPolicy {
        match tier {
            RiskTier::Low => self.config.policy.low,
            RiskTier::Medium => self.config.policy.medium,
            RiskTier::High => self.config.policy.high,
        }
    }
}
