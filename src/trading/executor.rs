//! Execution coordinator
//!
//! Turns risk signals into trades. Per token the coordinator walks
//! IDLE -> LOCKED -> BUYING -> MONITORING -> SELLING -> cooldown -> IDLE;
//! a token that is anywhere past IDLE rejects new work with
//! [`ExecutionOutcome::AlreadyActive`].
//!
//! The coordinator is the only place that decides between skipping,
//! retrying and failing a trade.

use backoff::{future::retry, ExponentialBackoff};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::{AutoSellConfig, ExecutionConfig};
use crate::error::{Error, Result};
use crate::market::{CandidateToken, MetricsProvider, PriceSource};
use crate::position::monitor::{check_exit, MonitorSupervisor};
use crate::position::types::{ExitReason, TradeMode, TradeRecord};
use crate::position::PositionLedger;
use crate::risk::{RiskScorer, RiskSignal, RiskTier};
use crate::rpc::ProviderPool;
use crate::safety::{CapitalGuard, GuardRejection};
use crate::trading::adapter::{BuyReceipt, ExchangeAdapter, SellReceipt};

/// Where a token is in its trade lifecycle. Absent means IDLE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Locked,
    Buying,
    Monitoring,
    Selling,
    Cooldown { until: Instant },
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenState::Locked => write!(f, "LOCKED"),
            TokenState::Buying => write!(f, "BUYING"),
            TokenState::Monitoring => write!(f, "MONITORING"),
            TokenState::Selling => write!(f, "SELLING"),
            TokenState::Cooldown { .. } => write!(f, "COOLDOWN"),
        }
    }
}

/// Why a candidate was not traded
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    HighRisk { score: u8 },
    /// Tier policy allows no capital for this token
    Vetoed { tier: RiskTier },
    LowLiquidity { liquidity_usd: f64, min_usd: f64 },
    TooYoung { age_blocks: u64, min_blocks: u64 },
    NoBalance,
    BelowMinimum { usd_amount: f64 },
    Guard(GuardRejection),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::HighRisk { score } => write!(f, "high risk (score {})", score),
            SkipReason::Vetoed { tier } => write!(f, "{} tier policy allows no capital", tier),
            SkipReason::LowLiquidity { liquidity_usd, min_usd } => {
                write!(f, "liquidity ${:.0} below ${:.0}", liquidity_usd, min_usd)
            }
            SkipReason::TooYoung { age_blocks, min_blocks } => {
                write!(f, "pair age {} blocks below {}", age_blocks, min_blocks)
            }
            SkipReason::NoBalance => write!(f, "no balance available"),
            SkipReason::BelowMinimum { usd_amount } => {
                write!(f, "trade size ${:.2} below ledger minimum", usd_amount)
            }
            SkipReason::Guard(rejection) => write!(f, "guard: {}", rejection),
        }
    }
}

/// Result of one execution attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Bought(TradeRecord),
    Skipped(SkipReason),
    /// Token is already being handled or cooling down
    AlreadyActive,
}

/// Pure pre-trade checks. `current_block` is `None` when it could not be
/// looked up, which disables the age check.
pub fn pre_check(
    signal: &RiskSignal,
    candidate: &CandidateToken,
    current_block: Option<u64>,
    config: &ExecutionConfig,
) -> std::result::Result<(), SkipReason> {
    if signal.tier == RiskTier::High {
        return Err(SkipReason::HighRisk { score: signal.score });
    }

    if signal.metrics.liquidity_usd < config.min_liquidity_usd {
        return Err(SkipReason::LowLiquidity {
            liquidity_usd: signal.metrics.liquidity_usd,
            min_usd: config.min_liquidity_usd,
        });
    }

    if config.min_block_age > 0 {
        if let (Some(created), Some(current)) = (candidate.creation_block, current_block) {
            let age_blocks = current.saturating_sub(created);
            if age_blocks < config.min_block_age {
                return Err(SkipReason::TooYoung {
                    age_blocks,
                    min_blocks: config.min_block_age,
                });
            }
        }
    }

    Ok(())
}

/// `balance * risk% * fraction`, floored at `min_buy_usd`, capped at the
/// balance. `None` when the fraction vetoes the trade.
pub fn size_position(balance_usd: f64, risk_percent: f64, buy_fraction: f64, min_buy_usd: f64) -> Option<f64> {
    if buy_fraction <= 0.0 {
        return None;
    }
    let size = balance_usd * risk_percent / 100.0 * buy_fraction;
    Some(size.max(min_buy_usd).min(balance_usd.max(0.0)))
}

/// Execution coordinator
pub struct ExecutionCoordinator {
    config: ExecutionConfig,
    auto_sell: AutoSellConfig,
    risk_percent: f64,
    ledger: Arc<PositionLedger>,
    guard: Arc<CapitalGuard>,
    prices: Arc<dyn PriceSource>,
    adapter: Option<Arc<dyn ExchangeAdapter>>,
    pool: Option<Arc<ProviderPool>>,
    states: DashMap<String, TokenState>,
    supervisor: MonitorSupervisor,
}

impl ExecutionCoordinator {
    pub fn new(
        config: ExecutionConfig,
        auto_sell: AutoSellConfig,
        risk_percent: f64,
        ledger: Arc<PositionLedger>,
        guard: Arc<CapitalGuard>,
        prices: Arc<dyn PriceSource>,
    ) -> Self {
        Self {
            config,
            auto_sell,
            risk_percent,
            ledger,
            guard,
            prices,
            adapter: None,
            pool: None,
            states: DashMap::new(),
            supervisor: MonitorSupervisor::new(),
        }
    }

    /// Exchange adapter used for LIVE trades
    pub fn with_adapter(mut self, adapter: Arc<dyn ExchangeAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    /// Provider pool for block-age checks and rotation on trade timeouts
    pub fn with_pool(mut self, pool: Arc<ProviderPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn mode(&self) -> TradeMode {
        self.config.mode
    }

    /// Current lifecycle state; `None` is IDLE
    pub fn token_state(&self, token: &str) -> Option<TokenState> {
        match self.states.get(token).map(|s| *s) {
            Some(TokenState::Cooldown { until }) if until <= Instant::now() => None,
            other => other,
        }
    }

    pub fn active_monitors(&self) -> usize {
        self.supervisor.active_count()
    }

    /// Score-to-trade pipeline for one candidate
    pub async fn evaluate(
        self: &Arc<Self>,
        candidate: &CandidateToken,
        scorer: &RiskScorer,
        metrics: &dyn MetricsProvider,
    ) -> Result<ExecutionOutcome> {
        let market = metrics.fetch(&candidate.token).await;
        let signal = scorer.score(candidate, market.as_ref()).await;
        self.execute(&signal, candidate).await
    }

    /// Attempt a trade for a scored candidate
    pub async fn execute(self: &Arc<Self>, signal: &RiskSignal, candidate: &CandidateToken) -> Result<ExecutionOutcome> {
        let token = signal.token.as_str();

        if !self.try_lock(token) {
            debug!(token = %token, "Token already active");
            return Ok(ExecutionOutcome::AlreadyActive);
        }

        let result = self.enter(signal, candidate).await;

        match &result {
            Ok(ExecutionOutcome::Bought(record)) => {
                info!(
                    token = %token,
                    mode = %record.mode,
                    usd = record.usd,
                    price = record.price,
                    tier = %signal.tier,
                    score = signal.score,
                    "Position opened"
                );
            }
            Ok(ExecutionOutcome::Skipped(reason)) => {
                self.cool_down(token);
                info!(token = %token, score = signal.score, reason = %reason, "Trade skipped");
            }
            Ok(ExecutionOutcome::AlreadyActive) => {}
            Err(e) => {
                self.cool_down(token);
                if self.config.mode == TradeMode::Live {
                    error!(token = %token, error = %e, "Live trade failed");
                } else {
                    warn!(token = %token, error = %e, "Paper trade failed");
                }
            }
        }

        result
    }

    /// IDLE (or expired cooldown) -> LOCKED
    fn try_lock(&self, token: &str) -> bool {
        match self.states.entry(token.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(TokenState::Locked);
                true
            }
            Entry::Occupied(mut slot) => match *slot.get() {
                TokenState::Cooldown { until } if until <= Instant::now() => {
                    slot.insert(TokenState::Locked);
                    true
                }
                _ => false,
            },
        }
    }

    /// MONITORING (or IDLE with a recovered position) -> SELLING. False
    /// when another caller is selling, already sold, or a buy is in flight.
    fn try_begin_sell(&self, token: &str) -> bool {
        match self.states.entry(token.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(TokenState::Selling);
                true
            }
            Entry::Occupied(mut slot) => match *slot.get() {
                TokenState::Monitoring => {
                    slot.insert(TokenState::Selling);
                    true
                }
                _ => false,
            },
        }
    }

    fn set_state(&self, token: &str, state: TokenState) {
        self.states.insert(token.to_string(), state);
    }

    fn cool_down(&self, token: &str) {
        let until = Instant::now() + Duration::from_secs(self.config.cooldown_secs);
        self.set_state(token, TokenState::Cooldown { until });
    }

    async fn enter(self: &Arc<Self>, signal: &RiskSignal, candidate: &CandidateToken) -> Result<ExecutionOutcome> {
        let token = signal.token.as_str();

        let current_block = self.current_block_for(candidate).await;
        if let Err(reason) = pre_check(signal, candidate, current_block, &self.config) {
            return Ok(ExecutionOutcome::Skipped(reason));
        }

        let balance = self.ledger.balance().await;
        let usd_amount = match size_position(
            balance,
            self.risk_percent,
            signal.recommended_buy_fraction,
            signal.min_buy_usd,
        ) {
            Some(size) if size > 0.0 => size,
            Some(_) => return Ok(ExecutionOutcome::Skipped(SkipReason::NoBalance)),
            None => return Ok(ExecutionOutcome::Skipped(SkipReason::Vetoed { tier: signal.tier })),
        };

        if let Err(rejection) = self.guard.can_trade(usd_amount) {
            return Ok(ExecutionOutcome::Skipped(SkipReason::Guard(rejection)));
        }

        self.set_state(token, TokenState::Buying);

        let record = match self.config.mode {
            TradeMode::Paper => {
                let price = self.prices.price_usd(token).await?;
                match self.ledger.buy_open(token, price, usd_amount).await? {
                    Some(record) => record,
                    None => return Ok(ExecutionOutcome::Skipped(SkipReason::BelowMinimum { usd_amount })),
                }
            }
            TradeMode::Live => {
                let receipt = self.live_buy(token, usd_amount).await?;
                match self.ledger.record_live_buy(token, &receipt, usd_amount).await {
                    Ok(record) => record,
                    Err(e) => {
                        error!(
                            token = %token,
                            tx_ref = %receipt.tx_ref,
                            error = %e,
                            "Live buy filled but the ledger write failed, position is untracked"
                        );
                        return Err(e);
                    }
                }
            }
        };

        self.set_state(token, TokenState::Monitoring);
        self.start_monitor(token);

        Ok(ExecutionOutcome::Bought(record))
    }

    /// Current block when the age check needs it; lookup failures disable the check
    async fn current_block_for(&self, candidate: &CandidateToken) -> Option<u64> {
        if self.config.min_block_age == 0 || candidate.creation_block.is_none() {
            return None;
        }
        let pool = self.pool.as_ref()?;
        match pool.current_block().await {
            Ok(block) => Some(block),
            Err(e) => {
                warn!(token = %candidate.token, error = %e, "Block lookup failed, skipping age check");
                None
            }
        }
    }

    fn adapter(&self) -> Result<&Arc<dyn ExchangeAdapter>> {
        self.adapter
            .as_ref()
            .ok_or_else(|| Error::Config("LIVE trading requires an exchange adapter".to_string()))
    }

    fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.retry_initial_ms),
            max_interval: Duration::from_millis(self.config.retry_initial_ms * 4),
            max_elapsed_time: Some(Duration::from_millis(self.config.retry_max_elapsed_ms)),
            ..Default::default()
        }
    }

    /// Adapter buy raced against the trade timeout. Transient errors are
    /// retried; a timeout is not, since the order may still land.
    async fn live_buy(&self, token: &str, usd_amount: f64) -> Result<BuyReceipt> {
        let adapter = self.adapter()?;
        let timeout = Duration::from_millis(self.config.trade_timeout_ms);
        let slippage = self.config.slippage_pct;

        let result = retry(self.retry_policy(), || async {
            match tokio::time::timeout(timeout, adapter.buy(token, usd_amount, slippage)).await {
                Ok(Ok(receipt)) => Ok(receipt),
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(token = %token, error = %e, "Retryable buy error");
                    Err(backoff::Error::transient(e))
                }
                Ok(Err(e)) => Err(backoff::Error::permanent(e)),
                Err(_) => Err(backoff::Error::permanent(Error::TradeTimeout {
                    token: token.to_string(),
                    timeout_ms: self.config.trade_timeout_ms,
                })),
            }
        })
        .await;

        self.on_trade_result(token, "buy", &result).await;
        result
    }

    async fn live_sell(&self, token: &str, token_amount: f64) -> Result<SellReceipt> {
        let adapter = self.adapter()?;
        let timeout = Duration::from_millis(self.config.trade_timeout_ms);
        let slippage = self.config.slippage_pct;

        let result = retry(self.retry_policy(), || async {
            match tokio::time::timeout(timeout, adapter.sell(token, token_amount, slippage)).await {
                Ok(Ok(receipt)) => Ok(receipt),
                Ok(Err(e)) if e.is_retryable() => {
                    warn!(token = %token, error = %e, "Retryable sell error");
                    Err(backoff::Error::transient(e))
                }
                Ok(Err(e)) => Err(backoff::Error::permanent(e)),
                Err(_) => Err(backoff::Error::permanent(Error::TradeTimeout {
                    token: token.to_string(),
                    timeout_ms: self.config.trade_timeout_ms,
                })),
            }
        })
        .await;

        self.on_trade_result(token, "sell", &result).await;
        result
    }

    async fn on_trade_result<T>(&self, token: &str, side: &str, result: &Result<T>) {
        if let Err(Error::TradeTimeout { timeout_ms, .. }) = result {
            warn!(
                token = %token,
                side,
                timeout_ms = *timeout_ms,
                "Trade timed out; a late fill would not be in the ledger"
            );
            if let Some(pool) = &self.pool {
                pool.rotate().await;
            }
        }
    }

    /// Spawn the exit monitor. When the supervisor refuses (shutting
    /// down), the state entry is dropped so the open position is picked
    /// up again by [`Self::resume_monitors`].
    fn start_monitor(self: &Arc<Self>, token: &str) -> bool {
        let this = Arc::clone(self);
        let owned = token.to_string();
        let interval = Duration::from_millis(self.auto_sell.price_poll_interval_ms);

        let started = self.supervisor.spawn(token, interval, move || {
            let this = Arc::clone(&this);
            let token = owned.clone();
            async move { this.monitor_tick(&token).await }
        });

        if !started && !self.supervisor.is_monitoring(token) {
            warn!(token = %token, "Monitor not started, position is unwatched until resumed");
            self.states.remove_if(token, |_, state| *state == TokenState::Monitoring);
        }
        started
    }

    /// One poll: fetch price, raise the high-water mark, sell on a trigger.
    /// Returns true once the position is gone.
    async fn monitor_tick(self: &Arc<Self>, token: &str) -> Result<bool> {
        let position = match self.ledger.position(token).await {
            Some(position) => position,
            None => {
                info!(token = %token, "Position no longer open, stopping monitor");
                self.cool_down(token);
                return Ok(true);
            }
        };

        let price = self.prices.price_usd(token).await?;
        self.ledger.record_price(token, price).await?;

        let highest = position.highest_price_seen_usd.max(price);
        match check_exit(position.exit_basis_usd(), highest, price, &self.auto_sell) {
            None => {
                debug!(
                    token = %token,
                    price,
                    pnl_pct = position.pnl_pct_at(price),
                    "No exit trigger"
                );
                Ok(false)
            }
            Some(reason) => {
                info!(
                    token = %token,
                    reason = %reason,
                    entry = position.exit_basis_usd(),
                    highest,
                    price,
                    pnl_pct = position.pnl_pct_at(price),
                    "Exit triggered"
                );
                self.exit_position(token, price, reason).await?;
                Ok(true)
            }
        }
    }

    /// Sell the whole position and report the result to the guard.
    /// Only one caller per token gets past the SELLING claim; the others
    /// get `Ok(None)`. On failure the token returns to MONITORING with a
    /// live monitor.
    async fn exit_position(
        self: &Arc<Self>,
        token: &str,
        price: f64,
        reason: ExitReason,
    ) -> Result<Option<TradeRecord>> {
        if !self.try_begin_sell(token) {
            let state = self.token_state(token).map(|s| s.to_string()).unwrap_or_default();
            info!(token = %token, reason = %reason, state = %state, "Sell already in flight, skipping");
            return Ok(None);
        }

        // Re-read under the claim: a racing seller may have closed it
        let position = match self.ledger.position(token).await {
            Some(position) => position,
            None => {
                self.cool_down(token);
                return Ok(None);
            }
        };

        let sold = match position.mode {
            TradeMode::Paper => self.ledger.sell_close(token, price, 1.0, reason).await,
            TradeMode::Live => match self.live_sell(token, position.tokens_held).await {
                Ok(receipt) => {
                    let booked = self.ledger.record_live_sell(token, &receipt, 1.0, reason).await;
                    if let Err(e) = &booked {
                        error!(
                            token = %token,
                            tx_ref = %receipt.tx_ref,
                            error = %e,
                            "Live sell filled but the ledger write failed"
                        );
                    }
                    booked.map(Some)
                }
                Err(e) => Err(e),
            },
        };

        let record = match sold {
            Ok(record) => record,
            Err(e) => {
                self.set_state(token, TokenState::Monitoring);
                if !self.supervisor.is_monitoring(token) {
                    self.start_monitor(token);
                }
                return Err(e);
            }
        };

        if let Some(pnl) = record.as_ref().and_then(|r| r.pnl_usd) {
            if pnl > 0.0 {
                self.guard.record_win(pnl);
            } else {
                self.guard.record_loss(-pnl);
            }
            info!(token = %token, reason = %reason, pnl_usd = pnl, "Position closed");
        }

        self.cool_down(token);
        Ok(record)
    }

    /// Manual exit at the current price. Cancels the monitor first.
    /// Returns `Ok(None)` when there is no position or a sell for the
    /// token is already in flight.
    pub async fn close_position(self: &Arc<Self>, token: &str) -> Result<Option<TradeRecord>> {
        if self.token_state(token) == Some(TokenState::Selling) {
            info!(token = %token, "Manual close ignored, sell already in flight");
            return Ok(None);
        }
        self.supervisor.cancel(token);

        if self.ledger.position(token).await.is_none() {
            return Ok(None);
        }

        let price = match self.prices.price_usd(token).await {
            Ok(price) => price,
            Err(e) => {
                warn!(token = %token, error = %e, "Manual close failed, resuming monitor");
                if self.token_state(token) != Some(TokenState::Selling) {
                    self.set_state(token, TokenState::Monitoring);
                    self.start_monitor(token);
                }
                return Err(e);
            }
        };

        self.exit_position(token, price, ExitReason::Manual).await
    }

    /// Restart monitors for positions recovered from the ledger
    pub async fn resume_monitors(self: &Arc<Self>) -> usize {
        let mut resumed = 0;
        for position in self.ledger.positions().await {
            self.set_state(&position.token, TokenState::Monitoring);
            if self.start_monitor(&position.token) {
                resumed += 1;
                info!(
                    token = %position.token,
                    mode = %position.mode,
                    entry = position.entry_price_usd,
                    "Resumed monitor for recovered position"
                );
            }
        }
        resumed
    }

    /// Consume candidates from the work queue with `workers` concurrent
    /// workers until the queue is closed and drained
    pub async fn run_queue(
        self: &Arc<Self>,
        queue: async_channel::Receiver<CandidateToken>,
        scorer: Arc<RiskScorer>,
        metrics: Arc<dyn MetricsProvider>,
    ) {
        let workers = (0..self.config.workers.max(1)).map(|worker| {
            let this = Arc::clone(self);
            let queue = queue.clone();
            let scorer = Arc::clone(&scorer);
            let metrics = Arc::clone(&metrics);

            async move {
                while let Ok(candidate) = queue.recv().await {
                    if let Err(e) = this.evaluate(&candidate, &scorer, metrics.as_ref()).await {
                        debug!(worker, token = %candidate.token, error = %e, "Candidate failed");
                    }
                }
                debug!(worker, "Worker stopped");
            }
        });

        futures::future::join_all(workers).await;
    }

    /// Cancel and drain every monitor
    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuardConfig, LedgerConfig};
    use crate::position::store::MemoryStore;
    use crate::risk::{SignalMetrics, SubScores};
    use async_trait::async_trait;
    use std::collections::{BTreeSet, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockPrices {
        prices: Mutex<HashMap<String, f64>>,
    }

    impl MockPrices {
        fn set(&self, token: &str, price: f64) {
            self.prices.lock().unwrap().insert(token.to_string(), price);
        }
    }

    #[async_trait]
    impl PriceSource for MockPrices {
        async fn price_usd(&self, token: &str) -> Result<f64> {
            self.prices
                .lock()
                .unwrap()
                .get(token)
                .copied()
                .ok_or_else(|| Error::PriceUnavailable(token.to_string()))
        }
    }

    struct MockAdapter {
        delay: Duration,
        sell_delay: Duration,
        transient_failures: usize,
        calls: AtomicUsize,
        sells: AtomicUsize,
        price: f64,
    }

    impl MockAdapter {
        fn new(price: f64) -> Self {
            Self {
                delay: Duration::ZERO,
                sell_delay: Duration::ZERO,
                transient_failures: 0,
                calls: AtomicUsize::new(0),
                sells: AtomicUsize::new(0),
                price,
            }
        }
    }

    #[async_trait]
    impl ExchangeAdapter for MockAdapter {
        async fn buy(&self, token: &str, usd_amount: f64, _slippage_pct: f64) -> Result<BuyReceipt> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if call < self.transient_failures {
                return Err(Error::Exchange {
                    side: "buy",
                    token: token.to_string(),
                    message: "node busy".into(),
                    retryable: true,
                });
            }
            Ok(BuyReceipt {
                tx_ref: format!("buy-{}", call),
                executed_price_usd: self.price,
                tokens_received: usd_amount / self.price,
            })
        }

        async fn sell(&self, _token: &str, token_amount: f64, _slippage_pct: f64) -> Result<SellReceipt> {
            let call = self.sells.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.sell_delay).await;
            Ok(SellReceipt {
                tx_ref: format!("sell-{}", call),
                executed_price_usd: self.price,
                usd_received: token_amount * self.price,
            })
        }
    }

    fn signal(token: &str, tier: RiskTier, fraction: f64, liquidity_usd: f64) -> RiskSignal {
        RiskSignal {
            token: token.to_string(),
            score: match tier {
                RiskTier::Low => 85,
                RiskTier::Medium => 60,
                RiskTier::High => 20,
            },
            tier,
            flags: BTreeSet::new(),
            metrics: SignalMetrics {
                liquidity_usd,
                holders: Some(500),
                volume_24h: liquidity_usd / 2.0,
                dev_concentration: 0.1,
                buy_tax: Some(0.0),
                sell_tax: Some(0.0),
                age_seconds: 60,
            },
            components: SubScores {
                liquidity: 1.0,
                contract_safety: 0.9,
                activity: 0.5,
                dev_wallets: 0.9,
            },
            recommended_buy_fraction: fraction,
            min_buy_usd: 10.0,
            created_at: chrono::Utc::now(),
        }
    }

    fn exec_config(mode: TradeMode, cooldown_secs: u64) -> ExecutionConfig {
        ExecutionConfig {
            mode,
            cooldown_secs,
            trade_timeout_ms: 1_000,
            retry_initial_ms: 1,
            retry_max_elapsed_ms: 500,
            ..Default::default()
        }
    }

    fn auto_sell() -> AutoSellConfig {
        AutoSellConfig {
            price_poll_interval_ms: 10,
            ..Default::default()
        }
    }

    struct Harness {
        coordinator: Arc<ExecutionCoordinator>,
        ledger: Arc<PositionLedger>,
        guard: Arc<CapitalGuard>,
        prices: Arc<MockPrices>,
    }

    fn harness(config: ExecutionConfig, adapter: Option<Arc<MockAdapter>>) -> Harness {
        let ledger_config = LedgerConfig {
            path: None,
            ..Default::default()
        };
        let ledger = Arc::new(PositionLedger::new(Arc::new(MemoryStore::new()), ledger_config));
        let guard = Arc::new(CapitalGuard::new(GuardConfig::default()));
        let prices = Arc::new(MockPrices::default());

        let mut coordinator = ExecutionCoordinator::new(
            config,
            auto_sell(),
            5.0,
            ledger.clone(),
            guard.clone(),
            prices.clone(),
        );
        if let Some(adapter) = adapter {
            coordinator = coordinator.with_adapter(adapter);
        }

        Harness {
            coordinator: Arc::new(coordinator),
            ledger,
            guard,
            prices,
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..300 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_pre_checks() {
        let config = ExecutionConfig {
            min_liquidity_usd: 10_000.0,
            min_block_age: 5,
            ..Default::default()
        };
        let mut candidate = CandidateToken::new("tok", "pair");
        candidate.creation_block = Some(100);

        assert!(matches!(
            pre_check(&signal("tok", RiskTier::High, 0.0, 50_000.0), &candidate, Some(200), &config),
            Err(SkipReason::HighRisk { .. })
        ));
        assert!(matches!(
            pre_check(&signal("tok", RiskTier::Low, 1.0, 5_000.0), &candidate, Some(200), &config),
            Err(SkipReason::LowLiquidity { .. })
        ));
        assert_eq!(
            pre_check(&signal("tok", RiskTier::Low, 1.0, 50_000.0), &candidate, Some(102), &config),
            Err(SkipReason::TooYoung {
                age_blocks: 2,
                min_blocks: 5
            })
        );
        // Unknown current block disables the age check
        assert!(pre_check(&signal("tok", RiskTier::Low, 1.0, 50_000.0), &candidate, None, &config).is_ok());
        assert!(pre_check(&signal("tok", RiskTier::Medium, 0.5, 50_000.0), &candidate, Some(105), &config).is_ok());
    }

    #[test]
    fn test_size_position() {
        assert_eq!(size_position(1000.0, 5.0, 1.0, 10.0), Some(50.0));
        assert_eq!(size_position(1000.0, 5.0, 0.5, 5.0), Some(25.0));
        // Floored at the tier minimum, capped at the balance
        assert_eq!(size_position(100.0, 5.0, 1.0, 10.0), Some(10.0));
        assert_eq!(size_position(8.0, 5.0, 1.0, 10.0), Some(8.0));
        assert_eq!(size_position(1000.0, 5.0, 0.0, 0.0), None);
    }

    #[tokio::test]
    async fn test_paper_trade_exits_on_take_profit() {
        let h = harness(exec_config(TradeMode::Paper, 30), None);
        h.prices.set("tok", 1.0);

        let outcome = h
            .coordinator
            .execute(&signal("tok", RiskTier::Low, 1.0, 50_000.0), &CandidateToken::new("tok", "pair"))
            .await
            .unwrap();
        let record = match outcome {
            ExecutionOutcome::Bought(record) => record,
            other => panic!("unexpected outcome: {:?}", other),
        };
        assert!((record.usd - 50.0).abs() < 1e-9);
        assert_eq!(h.coordinator.token_state("tok"), Some(TokenState::Monitoring));

        h.prices.set("tok", 1.3);
        for _ in 0..300 {
            if h.ledger.position("tok").await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(h.ledger.position("tok").await.is_none());

        let state = h.ledger.snapshot().await;
        let sell = state.trades.last().unwrap();
        assert_eq!(sell.reason, Some(ExitReason::TakeProfit));
        assert_eq!(state.stats.wins, 1);
        assert_eq!(h.guard.state().loss_streak, 0);

        // Cooling down after the exit
        wait_until(|| matches!(h.coordinator.token_state("tok"), Some(TokenState::Cooldown { .. }))).await;
        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_exits_measured_from_quoted_entry() {
        let h = harness(exec_config(TradeMode::Paper, 30), None);
        for (token, exit_price, reason) in [("tp", 1.21, ExitReason::TakeProfit), ("sl", 0.89, ExitReason::StopLoss)] {
            h.prices.set(token, 1.0);
            let outcome = h
                .coordinator
                .execute(&signal(token, RiskTier::Low, 1.0, 50_000.0), &CandidateToken::new(token, "pair"))
                .await
                .unwrap();
            assert!(matches!(outcome, ExecutionOutcome::Bought(_)));
            // Filled at 1.01 after slippage, thresholds still count from 1.00
            let position = h.ledger.position(token).await.unwrap();
            assert!((position.entry_price_usd - 1.01).abs() < 1e-9);

            h.prices.set(token, exit_price);
            for _ in 0..300 {
                if h.ledger.position(token).await.is_none() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            assert!(h.ledger.position(token).await.is_none(), "{} still open", token);

            let state = h.ledger.snapshot().await;
            let sell = state.trades.iter().rev().find(|t| t.token == token).unwrap();
            assert_eq!(sell.reason, Some(reason));
        }
        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_loss_reports_loss_to_guard() {
        let h = harness(exec_config(TradeMode::Paper, 0), None);
        h.prices.set("tok", 1.0);

        h.coordinator
            .execute(&signal("tok", RiskTier::Low, 1.0, 50_000.0), &CandidateToken::new("tok", "pair"))
            .await
            .unwrap();
        h.prices.set("tok", 0.5);

        let guard = h.guard.clone();
        wait_until(|| guard.state().loss_streak == 1).await;

        let state = h.ledger.snapshot().await;
        assert_eq!(state.trades.last().unwrap().reason, Some(ExitReason::StopLoss));
        assert!(h.guard.state().daily_loss_usd > 20.0);
        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_skips_are_named() {
        let h = harness(exec_config(TradeMode::Paper, 0), None);
        h.prices.set("tok", 1.0);
        let candidate = CandidateToken::new("tok", "pair");

        let outcome = h
            .coordinator
            .execute(&signal("tok", RiskTier::High, 0.0, 50_000.0), &candidate)
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Skipped(SkipReason::HighRisk { .. })));

        // Zero cooldown: the token is immediately available again
        let outcome = h
            .coordinator
            .execute(&signal("tok", RiskTier::Medium, 0.0, 50_000.0), &candidate)
            .await
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Skipped(SkipReason::Vetoed { .. })));

        h.guard.disable_trading("operator halt");
        let outcome = h
            .coordinator
            .execute(&signal("tok", RiskTier::Low, 1.0, 50_000.0), &candidate)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            ExecutionOutcome::Skipped(SkipReason::Guard(GuardRejection::TradingDisabled { .. }))
        ));
        assert!(h.ledger.snapshot().await.trades.is_empty());
    }

    #[tokio::test]
    async fn test_cooldown_absorbs_duplicates() {
        let h = harness(exec_config(TradeMode::Paper, 30), None);
        let candidate = CandidateToken::new("tok", "pair");

        let first = h
            .coordinator
            .execute(&signal("tok", RiskTier::High, 0.0, 50_000.0), &candidate)
            .await
            .unwrap();
        assert!(matches!(first, ExecutionOutcome::Skipped(_)));

        let second = h
            .coordinator
            .execute(&signal("tok", RiskTier::Low, 1.0, 50_000.0), &candidate)
            .await
            .unwrap();
        assert_eq!(second, ExecutionOutcome::AlreadyActive);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_executions_buy_once() {
        let h = harness(exec_config(TradeMode::Paper, 30), None);
        h.prices.set("tok", 1.0);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let coordinator = h.coordinator.clone();
                tokio::spawn(async move {
                    coordinator
                        .execute(&signal("tok", RiskTier::Low, 1.0, 50_000.0), &CandidateToken::new("tok", "pair"))
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut bought = 0;
        let mut active = 0;
        for handle in handles {
            match handle.await.unwrap() {
                ExecutionOutcome::Bought(_) => bought += 1,
                ExecutionOutcome::AlreadyActive => active += 1,
                other => panic!("unexpected outcome: {:?}", other),
            }
        }

        assert_eq!(bought, 1);
        assert_eq!(active, 9);
        assert_eq!(h.ledger.snapshot().await.trades.len(), 1);
        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_live_timeout_is_not_retried() {
        let adapter = Arc::new(MockAdapter {
            delay: Duration::from_millis(300),
            ..MockAdapter::new(1.0)
        });
        let mut config = exec_config(TradeMode::Live, 0);
        config.trade_timeout_ms = 50;
        let h = harness(config, Some(adapter.clone()));

        let err = h
            .coordinator
            .execute(&signal("tok", RiskTier::Low, 1.0, 50_000.0), &CandidateToken::new("tok", "pair"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::TradeTimeout { timeout_ms: 50, .. }));
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
        assert!(h.ledger.position("tok").await.is_none());
    }

    #[tokio::test]
    async fn test_live_buy_retries_transient_errors() {
        let adapter = Arc::new(MockAdapter {
            transient_failures: 2,
            ..MockAdapter::new(2.0)
        });
        let h = harness(exec_config(TradeMode::Live, 0), Some(adapter.clone()));
        h.prices.set("tok", 2.0);

        let outcome = h
            .coordinator
            .execute(&signal("tok", RiskTier::Low, 1.0, 50_000.0), &CandidateToken::new("tok", "pair"))
            .await
            .unwrap();

        match outcome {
            ExecutionOutcome::Bought(record) => {
                assert_eq!(record.mode, TradeMode::Live);
                assert_eq!(record.tx_ref.as_deref(), Some("buy-2"));
                assert!((record.tokens - 25.0).abs() < 1e-9);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);
        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_live_without_adapter_fails() {
        let h = harness(exec_config(TradeMode::Live, 0), None);
        let err = h
            .coordinator
            .execute(&signal("tok", RiskTier::Low, 1.0, 50_000.0), &CandidateToken::new("tok", "pair"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_manual_close() {
        let h = harness(exec_config(TradeMode::Paper, 0), None);
        h.prices.set("tok", 1.0);

        h.coordinator
            .execute(&signal("tok", RiskTier::Low, 1.0, 50_000.0), &CandidateToken::new("tok", "pair"))
            .await
            .unwrap();

        let record = h.coordinator.close_position("tok").await.unwrap().unwrap();
        assert_eq!(record.reason, Some(ExitReason::Manual));
        assert!(h.ledger.position("tok").await.is_none());
        assert!(h.coordinator.close_position("tok").await.unwrap().is_none());
        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_manual_close_during_live_sell_sells_once() {
        let adapter = Arc::new(MockAdapter {
            sell_delay: Duration::from_millis(200),
            ..MockAdapter::new(1.0)
        });
        let h = harness(exec_config(TradeMode::Live, 30), Some(adapter.clone()));
        h.prices.set("tok", 1.0);

        h.coordinator
            .execute(&signal("tok", RiskTier::Low, 1.0, 50_000.0), &CandidateToken::new("tok", "pair"))
            .await
            .unwrap();
        h.prices.set("tok", 1.3);

        let coordinator = h.coordinator.clone();
        wait_until(|| coordinator.token_state("tok") == Some(TokenState::Selling)).await;
        assert!(h.coordinator.close_position("tok").await.unwrap().is_none());

        wait_until(|| matches!(coordinator.token_state("tok"), Some(TokenState::Cooldown { .. }))).await;
        assert_eq!(adapter.sells.load(Ordering::SeqCst), 1);

        let state = h.ledger.snapshot().await;
        assert_eq!(state.trades.len(), 2);
        assert_eq!(state.trades[1].reason, Some(ExitReason::TakeProfit));
        assert!(state.positions.is_empty());
        assert!(state.reconciles(1e-9));
        h.coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_refused_monitor_leaves_token_resumable() {
        let h = harness(exec_config(TradeMode::Paper, 0), None);
        h.ledger.buy_open("tok", 1.0, 20.0).await.unwrap();
        h.prices.set("tok", 1.0);

        h.coordinator.shutdown().await;
        assert_eq!(h.coordinator.resume_monitors().await, 0);
        assert_eq!(h.coordinator.token_state("tok"), None);
        assert!(h.ledger.position("tok").await.is_some());
    }

    #[tokio::test]
    async fn test_resume_monitors_for_recovered_positions() {
        let h = harness(exec_config(TradeMode::Paper, 0), None);
        h.ledger.buy_open("a", 1.0, 20.0).await.unwrap();
        h.ledger.buy_open("b", 1.0, 20.0).await.unwrap();
        h.prices.set("a", 1.0);
        h.prices.set("b", 1.0);

        assert_eq!(h.coordinator.resume_monitors().await, 2);
        assert_eq!(h.coordinator.active_monitors(), 2);
        assert_eq!(h.coordinator.token_state("a"), Some(TokenState::Monitoring));

        h.coordinator.shutdown().await;
        assert_eq!(h.coordinator.active_monitors(), 0);
    }

    struct FixedMetrics;

    #[async_trait]
    impl MetricsProvider for FixedMetrics {
        async fn fetch(&self, _token: &str) -> Option<crate::market::MarketMetrics> {
            Some(crate::market::MarketMetrics {
                liquidity_usd: 100_000.0,
                volume_24h: 50_000.0,
                price_usd: 1.0,
                holders: Some(300),
                buy_tax: Some(1.0),
                sell_tax: Some(1.0),
                fdv: None,
                top_holders: Some(vec![crate::market::TopHolder {
                    address: "dev".into(),
                    share: 0.05,
                }]),
                lp_locked: Some(true),
            })
        }
    }

    #[tokio::test]
    async fn test_run_queue_fans_out_candidates() {
        let h = harness(exec_config(TradeMode::Paper, 30), None);
        let scorer = Arc::new(RiskScorer::new(Default::default()).unwrap());
        let (tx, rx) = async_channel::bounded(16);

        for token in ["a", "b", "c", "a"] {
            h.prices.set(token, 1.0);
            tx.send(CandidateToken::new(token, "pair")).await.unwrap();
        }
        tx.close();

        h.coordinator.run_queue(rx, scorer, Arc::new(FixedMetrics)).await;

        let state = h.ledger.snapshot().await;
        assert_eq!(state.positions.len(), 3);
        assert_eq!(state.trades.len(), 3);
        h.coordinator.shutdown().await;
    }
}
