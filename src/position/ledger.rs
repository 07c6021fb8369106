//! Position ledger
//!
//! Balance, open positions and trade history, persisted as one document.
//! Every mutation is serialized: in-process mutex, then the store's
//! cross-process lock, then read, modify, atomic persist and release. Reads
//! come from the last persisted snapshot and never wait on a writer.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::LedgerConfig;
use crate::error::{Error, Result};
use crate::position::store::{JsonFileStore, LedgerStore, MemoryStore};
use crate::position::types::{
    ExitReason, LedgerState, LedgerSummary, Position, PositionStatus, Side, TradeMode, TradeRecord,
};
use crate::trading::adapter::{BuyReceipt, SellReceipt};

/// Float tolerance for balance comparisons
const BALANCE_EPSILON: f64 = 1e-9;

/// Positions smaller than this are treated as fully closed
const DUST_TOKENS: f64 = 1e-12;

/// Durable, concurrency-safe ledger service
pub struct PositionLedger {
    store: Arc<dyn LedgerStore>,
    config: LedgerConfig,
    write_lock: Mutex<()>,
    snapshot: RwLock<Arc<LedgerState>>,
}

impl PositionLedger {
    pub fn new(store: Arc<dyn LedgerStore>, config: LedgerConfig) -> Self {
        let initial = LedgerState::new(config.initial_balance_usd);
        Self {
            store,
            config,
            write_lock: Mutex::new(()),
            snapshot: RwLock::new(Arc::new(initial)),
        }
    }

    /// Build the configured backend and recover any persisted state
    pub async fn open(config: LedgerConfig) -> Result<Self> {
        let store: Arc<dyn LedgerStore> = match &config.path {
            Some(path) => Arc::new(JsonFileStore::new(
                path,
                Duration::from_secs(config.stale_lock_secs),
            )),
            None => Arc::new(MemoryStore::new()),
        };
        let ledger = Self::new(store, config);
        ledger.load().await?;
        Ok(ledger)
    }

    /// Read the persisted aggregate into the snapshot
    pub async fn load(&self) -> Result<()> {
        match self.store.load().await? {
            Some(state) => {
                if !state.reconciles(1e-6) {
                    warn!(
                        balance = state.balance_usd,
                        replayed = state.replayed_balance(),
                        "Loaded ledger does not reconcile with its trade history"
                    );
                }
                info!(
                    store = %self.store.describe(),
                    balance_usd = state.balance_usd,
                    open_positions = state.positions.len(),
                    trades = state.trades.len(),
                    "Ledger loaded"
                );
                *self.snapshot.write().await = Arc::new(state);
            }
            None => {
                info!(
                    store = %self.store.describe(),
                    balance_usd = self.config.initial_balance_usd,
                    "Starting new ledger"
                );
            }
        }
        Ok(())
    }

    /// Paper buy of `usd_amount` at `price_usd` plus simulated slippage.
    /// Returns `None` when the amount is below the minimum trade size.
    pub async fn buy_open(&self, token: &str, price_usd: f64, usd_amount: f64) -> Result<Option<TradeRecord>> {
        validate_price(price_usd)?;
        let exec_price = price_usd * (1.0 + self.config.slippage_pct / 100.0);
        let min_trade = self.config.min_trade_usd;

        let record = self.mutate(|state| {
            if usd_amount < min_trade {
                debug!(token = %token, usd_amount, "Buy below minimum trade size ignored");
                return Ok((None, false));
            }
            let fill = Fill {
                exec_price,
                quote_price: price_usd,
                tokens: usd_amount / exec_price,
                usd_amount,
                tx_ref: None,
            };
            let record = open_or_merge(state, token, TradeMode::Paper, fill)?;
            Ok((Some(record), true))
        })
        .await?;

        if let Some(r) = &record {
            log_buy(r);
        }
        Ok(record)
    }

    /// Paper buy sized at `risk_percent` of the balance at lock time
    pub async fn paper_buy(&self, token: &str, price_usd: f64) -> Result<Option<TradeRecord>> {
        validate_price(price_usd)?;
        let exec_price = price_usd * (1.0 + self.config.slippage_pct / 100.0);
        let risk_fraction = self.config.risk_percent / 100.0;
        let min_trade = self.config.min_trade_usd;

        let record = self.mutate(|state| {
            let usd_amount = state.balance_usd * risk_fraction;
            if usd_amount < min_trade {
                debug!(token = %token, usd_amount, "Paper buy below minimum trade size ignored");
                return Ok((None, false));
            }
            let fill = Fill {
                exec_price,
                quote_price: price_usd,
                tokens: usd_amount / exec_price,
                usd_amount,
                tx_ref: None,
            };
            let record = open_or_merge(state, token, TradeMode::Paper, fill)?;
            Ok((Some(record), true))
        })
        .await?;

        if let Some(r) = &record {
            log_buy(r);
        }
        Ok(record)
    }

    /// Book an exchange fill exactly as reported
    pub async fn record_live_buy(&self, token: &str, receipt: &BuyReceipt, usd_amount: f64) -> Result<TradeRecord> {
        validate_price(receipt.executed_price_usd)?;
        if !receipt.tokens_received.is_finite() || receipt.tokens_received <= 0.0 {
            return Err(Error::Internal(format!(
                "Live buy for {} received no tokens ({})",
                token, receipt.tx_ref
            )));
        }

        let record = self
            .mutate(|state| {
                let fill = Fill {
                    exec_price: receipt.executed_price_usd,
                    quote_price: receipt.executed_price_usd,
                    tokens: receipt.tokens_received,
                    usd_amount,
                    tx_ref: Some(receipt.tx_ref.clone()),
                };
                let record = open_or_merge(state, token, TradeMode::Live, fill)?;
                Ok((record, true))
            })
            .await?;

        log_buy(&record);
        Ok(record)
    }

    /// Paper sell of `fraction` of the position at `price_usd` minus
    /// simulated slippage. Returns `None` when no position is open.
    pub async fn sell_close(
        &self,
        token: &str,
        price_usd: f64,
        fraction: f64,
        reason: ExitReason,
    ) -> Result<Option<TradeRecord>> {
        validate_price(price_usd)?;
        validate_fraction(fraction)?;
        let exec_price = price_usd * (1.0 - self.config.slippage_pct / 100.0);

        let record = self.mutate(|state| {
            let record = close_fraction(state, token, fraction, exec_price, None, reason, None);
            let changed = record.is_some();
            Ok((record, changed))
        })
        .await?;

        log_sell(token, record.as_ref());
        Ok(record)
    }

    /// Book an exchange sell exactly as reported. A fill with no open
    /// position to book against is an error: the proceeds would be lost.
    pub async fn record_live_sell(
        &self,
        token: &str,
        receipt: &SellReceipt,
        fraction: f64,
        reason: ExitReason,
    ) -> Result<TradeRecord> {
        validate_price(receipt.executed_price_usd)?;
        validate_fraction(fraction)?;

        let booked = self
            .mutate(|state| {
                let record = close_fraction(
                    state,
                    token,
                    fraction,
                    receipt.executed_price_usd,
                    Some(receipt.usd_received),
                    reason,
                    Some(receipt.tx_ref.clone()),
                )
                .ok_or_else(|| Error::PositionNotFound(token.to_string()))?;
                Ok((record, true))
            })
            .await;

        match booked {
            Ok(record) => {
                log_sell(token, Some(&record));
                Ok(record)
            }
            Err(e @ Error::PositionNotFound(_)) => {
                error!(
                    token = %token,
                    tx_ref = %receipt.tx_ref,
                    usd_received = receipt.usd_received,
                    "Live sell filled with no open position to book against"
                );
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Raise the position's high-water mark. Returns true if it moved.
    pub async fn record_price(&self, token: &str, price_usd: f64) -> Result<bool> {
        validate_price(price_usd)?;
        let raised = match self.position(token).await {
            Some(position) => price_usd > position.highest_price_seen_usd,
            None => false,
        };
        if !raised {
            return Ok(false);
        }

        self.mutate(|state| match state.positions.get_mut(token) {
            Some(position) if price_usd > position.highest_price_seen_usd => {
                position.highest_price_seen_usd = price_usd;
                Ok((true, true))
            }
            _ => Ok((false, false)),
        })
        .await
    }

    pub async fn snapshot(&self) -> Arc<LedgerState> {
        self.snapshot.read().await.clone()
    }

    pub async fn summary(&self) -> LedgerSummary {
        LedgerSummary::from(self.snapshot().await.as_ref())
    }

    pub async fn balance(&self) -> f64 {
        self.snapshot.read().await.balance_usd
    }

    pub async fn position(&self, token: &str) -> Option<Position> {
        self.snapshot.read().await.positions.get(token).cloned()
    }

    pub async fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.snapshot.read().await.positions.values().cloned().collect();
        positions.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
        positions
    }

    /// Most recent `limit` trades, oldest first
    pub async fn trades(&self, limit: usize) -> Vec<TradeRecord> {
        let snapshot = self.snapshot.read().await;
        let skip = snapshot.trades.len().saturating_sub(limit);
        snapshot.trades[skip..].to_vec()
    }

    pub fn store_location(&self) -> String {
        self.store.describe()
    }

    /// Run `op` on a fresh copy of the persisted state under the ledger lock.
    /// `op` returns its output and whether the state changed; an error from
    /// `op` discards every modification.
    async fn mutate<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut LedgerState) -> Result<(T, bool)>,
    {
        let timeout = Duration::from_millis(self.config.lock_timeout_ms);

        let _guard = tokio::time::timeout(timeout, self.write_lock.lock())
            .await
            .map_err(|_| Error::LedgerLockTimeout(self.config.lock_timeout_ms))?;

        self.store.acquire(timeout).await?;
        let result = self.mutate_locked(op).await;
        if let Err(e) = self.store.release().await {
            warn!(error = %e, "Failed to release ledger lock");
        }
        result
    }

    async fn mutate_locked<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&mut LedgerState) -> Result<(T, bool)>,
    {
        let mut state = match self.store.load().await? {
            Some(state) => state,
            None => LedgerState::new(self.config.initial_balance_usd),
        };

        let (output, changed) = op(&mut state)?;
        if changed {
            state.updated_at = Utc::now();
            self.store.persist(&state).await?;
        }

        *self.snapshot.write().await = Arc::new(state);
        Ok(output)
    }
}

fn log_buy(r: &TradeRecord) {
    info!(
        token = %r.token,
        mode = %r.mode,
        usd = r.usd,
        price = r.price,
        tokens = r.tokens,
        "Ledger BUY"
    );
}

fn log_sell(token: &str, record: Option<&TradeRecord>) {
    match record {
        Some(r) => info!(
            token = %r.token,
            mode = %r.mode,
            usd = r.usd,
            price = r.price,
            pnl_usd = r.pnl_usd.unwrap_or_default(),
            reason = %r.reason.map(|x| x.to_string()).unwrap_or_default(),
            "Ledger SELL"
        ),
        None => debug!(token = %token, "Sell ignored, no open position"),
    }
}

fn validate_price(price_usd: f64) -> Result<()> {
    if price_usd.is_finite() && price_usd > 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidPrice(price_usd))
    }
}

fn validate_fraction(fraction: f64) -> Result<()> {
    if fraction.is_finite() && fraction > 0.0 && fraction <= 1.0 {
        Ok(())
    } else {
        Err(Error::InvalidFraction(fraction))
    }
}

/// One buy fill. `quote_price` is the market price before slippage.
struct Fill {
    exec_price: f64,
    quote_price: f64,
    tokens: f64,
    usd_amount: f64,
    tx_ref: Option<String>,
}

/// Debit the balance and open or average into a position
fn open_or_merge(state: &mut LedgerState, token: &str, mode: TradeMode, fill: Fill) -> Result<TradeRecord> {
    let Fill {
        exec_price,
        quote_price,
        tokens,
        usd_amount,
        tx_ref,
    } = fill;
    if usd_amount > state.balance_usd + BALANCE_EPSILON {
        return Err(Error::InsufficientBalance {
            available: state.balance_usd,
            required: usd_amount,
        });
    }

    let now = Utc::now();
    match state.positions.get_mut(token) {
        Some(position) => {
            let held = position.tokens_held + tokens;
            let prior_quote = position.exit_basis_usd();
            position.entry_price_usd =
                (position.tokens_held * position.entry_price_usd + tokens * exec_price) / held;
            position.entry_quote_usd =
                Some((position.tokens_held * prior_quote + tokens * quote_price) / held);
            position.tokens_held = held;
            position.usd_invested += usd_amount;
            position.highest_price_seen_usd = position.highest_price_seen_usd.max(quote_price);
        }
        None => {
            state.positions.insert(
                token.to_string(),
                Position {
                    id: uuid::Uuid::new_v4().to_string(),
                    token: token.to_string(),
                    mode,
                    entry_price_usd: exec_price,
                    entry_quote_usd: Some(quote_price),
                    tokens_held: tokens,
                    usd_invested: usd_amount,
                    opened_at: now,
                    status: PositionStatus::Open,
                    highest_price_seen_usd: quote_price,
                },
            );
        }
    }

    state.balance_usd -= usd_amount;

    let record = TradeRecord {
        id: uuid::Uuid::new_v4().to_string(),
        side: Side::Buy,
        token: token.to_string(),
        mode,
        usd: usd_amount,
        price: exec_price,
        tokens,
        pnl_usd: None,
        timestamp: now,
        reason: None,
        tx_ref,
    };
    state.trades.push(record.clone());
    Ok(record)
}

/// Credit proceeds for `fraction` of a position and update the stats.
/// `proceeds` overrides the price-derived amount for exchange fills.
fn close_fraction(
    state: &mut LedgerState,
    token: &str,
    fraction: f64,
    exec_price: f64,
    proceeds: Option<f64>,
    reason: ExitReason,
    tx_ref: Option<String>,
) -> Option<TradeRecord> {
    let position = state.positions.get_mut(token)?;

    let tokens_sold = position.tokens_held * fraction;
    let proceeds = proceeds.unwrap_or(tokens_sold * exec_price);
    let cost_basis = position.usd_invested * fraction;
    let pnl = proceeds - cost_basis;
    let mode = position.mode;

    let remaining = position.tokens_held - tokens_sold;
    if fraction >= 1.0 || remaining <= DUST_TOKENS {
        position.status = PositionStatus::Closed;
        state.positions.remove(token);
    } else {
        position.tokens_held = remaining;
        position.usd_invested -= cost_basis;
    }

    state.balance_usd += proceeds;
    if state.balance_usd > state.peak_balance_usd {
        state.peak_balance_usd = state.balance_usd;
    }
    if state.peak_balance_usd > 0.0 {
        let drawdown = (state.peak_balance_usd - state.balance_usd) / state.peak_balance_usd;
        state.stats.max_drawdown_fraction = state.stats.max_drawdown_fraction.max(drawdown);
    }
    if pnl > 0.0 {
        state.stats.wins += 1;
    } else {
        state.stats.losses += 1;
    }

    let record = TradeRecord {
        id: uuid::Uuid::new_v4().to_string(),
        side: Side::Sell,
        token: token.to_string(),
        mode,
        usd: proceeds,
        price: exec_price,
        tokens: tokens_sold,
        pnl_usd: Some(pnl),
        timestamp: Utc::now(),
        reason: Some(reason),
        tx_ref,
    };
    state.trades.push(record.clone());
    Some(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> LedgerConfig {
        LedgerConfig {
            path: None,
            initial_balance_usd: 1000.0,
            slippage_pct: 1.0,
            risk_percent: 5.0,
            min_trade_usd: 1.0,
            lock_timeout_ms: 2000,
            stale_lock_secs: 60,
        }
    }

    fn memory_ledger() -> PositionLedger {
        PositionLedger::new(Arc::new(MemoryStore::new()), config())
    }

    #[tokio::test]
    async fn test_paper_buy_sizing_and_slippage() {
        let ledger = memory_ledger();
        let record = ledger.paper_buy("tok", 1.0).await.unwrap().unwrap();

        assert!((record.usd - 50.0).abs() < 1e-9);
        assert!((record.price - 1.01).abs() < 1e-9);
        assert!((record.tokens - 49.50).abs() < 0.01);
        assert!((ledger.balance().await - 950.0).abs() < 1e-9);
        assert!(record.reason.is_none());
    }

    #[tokio::test]
    async fn test_invalid_price_mutates_nothing() {
        let ledger = memory_ledger();
        ledger.buy_open("tok", 1.0, 100.0).await.unwrap();
        let before = ledger.snapshot().await;

        for price in [0.0, -1.0, f64::NAN] {
            assert!(matches!(ledger.buy_open("tok", price, 10.0).await, Err(Error::InvalidPrice(_))));
            assert!(matches!(
                ledger.sell_close("tok", price, 1.0, ExitReason::Manual).await,
                Err(Error::InvalidPrice(_))
            ));
        }

        assert_eq!(*ledger.snapshot().await, *before);
    }

    #[tokio::test]
    async fn test_buy_below_minimum_is_noop() {
        let ledger = memory_ledger();
        assert!(ledger.buy_open("tok", 1.0, 0.5).await.unwrap().is_none());
        let state = ledger.snapshot().await;
        assert!(state.trades.is_empty());
        assert_eq!(state.balance_usd, 1000.0);
    }

    #[tokio::test]
    async fn test_insufficient_balance() {
        let ledger = memory_ledger();
        let err = ledger.buy_open("tok", 1.0, 1000.01).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
        assert_eq!(ledger.balance().await, 1000.0);
    }

    #[tokio::test]
    async fn test_buys_merge_at_weighted_average() {
        let ledger = memory_ledger();
        ledger.buy_open("tok", 1.0, 101.0).await.unwrap();
        ledger.buy_open("tok", 2.0, 202.0).await.unwrap();

        let position = ledger.position("tok").await.unwrap();
        // 100 tokens at 1.01 + 100 tokens at 2.02
        assert!((position.tokens_held - 200.0).abs() < 1e-9);
        assert!((position.entry_price_usd - 1.515).abs() < 1e-9);
        assert!((position.usd_invested - 303.0).abs() < 1e-9);
        assert_eq!(ledger.snapshot().await.trades.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_then_full_close() {
        let ledger = memory_ledger();
        ledger.buy_open("tok", 1.0, 101.0).await.unwrap();

        // 50 tokens at 2.0 * 0.99 = 99 proceeds against 50.5 cost
        let partial = ledger
            .sell_close("tok", 2.0, 0.5, ExitReason::TakeProfit)
            .await
            .unwrap()
            .unwrap();
        assert!((partial.usd - 99.0).abs() < 1e-9);
        assert!((partial.pnl_usd.unwrap() - 48.5).abs() < 1e-9);

        let position = ledger.position("tok").await.unwrap();
        assert!((position.tokens_held - 50.0).abs() < 1e-9);
        assert!((position.usd_invested - 50.5).abs() < 1e-9);

        let full = ledger
            .sell_close("tok", 0.5, 1.0, ExitReason::StopLoss)
            .await
            .unwrap()
            .unwrap();
        assert!(full.pnl_usd.unwrap() < 0.0);
        assert!(ledger.position("tok").await.is_none());

        let state = ledger.snapshot().await;
        assert_eq!(state.stats.wins, 1);
        assert_eq!(state.stats.losses, 1);
        assert!(state.reconciles(1e-9));
    }

    #[tokio::test]
    async fn test_sell_without_position_is_noop() {
        let ledger = memory_ledger();
        assert!(ledger.sell_close("nope", 1.0, 1.0, ExitReason::Manual).await.unwrap().is_none());
        assert!(matches!(
            ledger.sell_close("nope", 1.0, 1.5, ExitReason::Manual).await,
            Err(Error::InvalidFraction(_))
        ));
    }

    #[tokio::test]
    async fn test_drawdown_is_monotonic() {
        let ledger = memory_ledger();
        ledger.buy_open("a", 1.0, 500.0).await.unwrap();
        ledger.sell_close("a", 0.5, 1.0, ExitReason::StopLoss).await.unwrap();
        let first = ledger.snapshot().await.stats.max_drawdown_fraction;
        assert!(first > 0.0);

        ledger.buy_open("b", 1.0, 100.0).await.unwrap();
        ledger.sell_close("b", 3.0, 1.0, ExitReason::TakeProfit).await.unwrap();
        let state = ledger.snapshot().await;
        assert_eq!(state.stats.max_drawdown_fraction, first);
        assert!(state.peak_balance_usd >= 1000.0);
    }

    #[tokio::test]
    async fn test_record_price_raises_high_water_mark() {
        let ledger = memory_ledger();
        ledger.buy_open("tok", 1.0, 10.0).await.unwrap();

        assert!(ledger.record_price("tok", 1.5).await.unwrap());
        assert!(!ledger.record_price("tok", 1.2).await.unwrap());
        assert!(!ledger.record_price("other", 9.0).await.unwrap());
        assert_eq!(ledger.position("tok").await.unwrap().highest_price_seen_usd, 1.5);
    }

    #[tokio::test]
    async fn test_live_fills_are_booked_exactly() {
        let ledger = memory_ledger();
        let buy = BuyReceipt {
            tx_ref: "sig-buy".into(),
            executed_price_usd: 2.0,
            tokens_received: 25.0,
        };
        let record = ledger.record_live_buy("tok", &buy, 50.0).await.unwrap();
        assert_eq!(record.mode, TradeMode::Live);
        assert_eq!(record.price, 2.0);
        assert_eq!(ledger.position("tok").await.unwrap().mode, TradeMode::Live);

        let sell = SellReceipt {
            tx_ref: "sig-sell".into(),
            executed_price_usd: 3.0,
            usd_received: 74.0,
        };
        let record = ledger
            .record_live_sell("tok", &sell, 1.0, ExitReason::TakeProfit)
            .await
            .unwrap();
        assert_eq!(record.usd, 74.0);
        assert!((record.pnl_usd.unwrap() - 24.0).abs() < 1e-9);
        assert_eq!(record.tx_ref.as_deref(), Some("sig-sell"));
        assert!(ledger.snapshot().await.reconciles(1e-9));
    }

    #[tokio::test]
    async fn test_live_sell_without_position_is_an_error() {
        let ledger = memory_ledger();
        let sell = SellReceipt {
            tx_ref: "sig-late".into(),
            executed_price_usd: 1.0,
            usd_received: 100.0,
        };

        let err = ledger
            .record_live_sell("tok", &sell, 1.0, ExitReason::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PositionNotFound(ref t) if t == "tok"));
        assert_eq!(ledger.balance().await, 1000.0);
        assert!(ledger.snapshot().await.trades.is_empty());
    }

    #[tokio::test]
    async fn test_entry_quote_excludes_slippage() {
        let ledger = memory_ledger();
        ledger.buy_open("tok", 1.0, 101.0).await.unwrap();

        let position = ledger.position("tok").await.unwrap();
        assert!((position.entry_price_usd - 1.01).abs() < 1e-9);
        assert_eq!(position.entry_quote_usd, Some(1.0));
        assert_eq!(position.highest_price_seen_usd, 1.0);

        // 100 tokens quoted at 1.0 + 100 tokens quoted at 2.0
        ledger.buy_open("tok", 2.0, 202.0).await.unwrap();
        let position = ledger.position("tok").await.unwrap();
        assert!((position.exit_basis_usd() - 1.5).abs() < 1e-9);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_buys_lose_no_updates() {
        let ledger = Arc::new(memory_ledger());

        let handles: Vec<_> = (0..150)
            .map(|_| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.buy_open("tok", 1.0, 10.0).await })
            })
            .collect();

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(Some(_)) => succeeded += 1,
                Err(Error::InsufficientBalance { .. }) => {}
                other => panic!("unexpected result: {:?}", other),
            }
        }

        let state = ledger.snapshot().await;
        assert_eq!(succeeded, 100);
        assert_eq!(state.trades.len(), 100);
        assert!((state.balance_usd - (1000.0 - 10.0 * succeeded as f64)).abs() < 1e-9);
        assert!(state.reconciles(1e-9));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config();
        cfg.path = Some(dir.path().join("ledger.json").to_string_lossy().into_owned());

        let ledger = Arc::new(PositionLedger::open(cfg.clone()).await.unwrap());
        let handles: Vec<_> = ["a", "b", "c", "d"]
            .into_iter()
            .map(|token| {
                let ledger = ledger.clone();
                tokio::spawn(async move { ledger.paper_buy(token, 0.37).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        ledger.sell_close("a", 0.41, 0.3, ExitReason::TakeProfit).await.unwrap();
        ledger.sell_close("b", 0.12, 1.0, ExitReason::StopLoss).await.unwrap();
        ledger.record_price("c", 0.55).await.unwrap();

        let reloaded = PositionLedger::open(cfg).await.unwrap();
        let original = ledger.snapshot().await;
        let restored = reloaded.snapshot().await;

        assert!(restored.approx_eq(&original, 1e-9));
        assert_eq!(restored.positions.len(), 3);
        assert!(restored.reconciles(1e-9));
        assert!(!dir.path().join("ledger.json.lock").exists());
    }

    /// Store whose writes always fail
    #[derive(Default)]
    struct BrokenStore {
        acquired: AtomicUsize,
        released: AtomicUsize,
    }

    #[async_trait]
    impl LedgerStore for BrokenStore {
        async fn load(&self) -> Result<Option<LedgerState>> {
            Ok(None)
        }
        async fn persist(&self, _state: &LedgerState) -> Result<()> {
            Err(Error::LedgerPersistence("disk full".into()))
        }
        async fn acquire(&self, _timeout: Duration) -> Result<()> {
            self.acquired.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn release(&self) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn describe(&self) -> String {
            "broken".into()
        }
    }

    #[tokio::test]
    async fn test_lock_released_after_persist_failure() {
        let store = Arc::new(BrokenStore::default());
        let ledger = PositionLedger::new(store.clone(), config());

        for _ in 0..2 {
            let err = ledger.buy_open("tok", 1.0, 10.0).await.unwrap_err();
            assert!(matches!(err, Error::LedgerPersistence(_)));
        }

        assert_eq!(store.acquired.load(Ordering::SeqCst), 2);
        assert_eq!(store.released.load(Ordering::SeqCst), 2);
        assert_eq!(ledger.balance().await, 1000.0);
        assert!(ledger.snapshot().await.trades.is_empty());
    }
}
