//! Ledger data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Whether trades are simulated or sent through the exchange adapter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeMode {
    #[default]
    #[serde(alias = "paper")]
    Paper,
    #[serde(alias = "live")]
    Live,
}

impl fmt::Display for TradeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeMode::Paper => write!(f, "PAPER"),
            TradeMode::Live => write!(f, "LIVE"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Why a position was (partially) closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitReason {
    #[serde(rename = "TP")]
    TakeProfit,
    #[serde(rename = "SL")]
    StopLoss,
    #[serde(rename = "TRAIL")]
    TrailingStop,
    #[serde(rename = "MANUAL")]
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::TakeProfit => write!(f, "TP"),
            ExitReason::StopLoss => write!(f, "SL"),
            ExitReason::TrailingStop => write!(f, "TRAIL"),
            ExitReason::Manual => write!(f, "MANUAL"),
        }
    }
}

/// An open holding in a token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub token: String,
    pub mode: TradeMode,
    /// Weighted-average execution price
    pub entry_price_usd: f64,
    /// Weighted-average market quote at entry, before slippage
    #[serde(default)]
    pub entry_quote_usd: Option<f64>,
    pub tokens_held: f64,
    /// Remaining cost basis
    pub usd_invested: f64,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    /// High-water mark for the trailing stop
    pub highest_price_seen_usd: f64,
}

impl Position {
    /// Mark-to-market value at the given price
    pub fn value_at(&self, price_usd: f64) -> f64 {
        self.tokens_held * price_usd
    }

    /// Unrealized P&L percentage relative to entry
    pub fn pnl_pct_at(&self, price_usd: f64) -> f64 {
        if self.entry_price_usd <= 0.0 {
            return 0.0;
        }
        (price_usd - self.entry_price_usd) / self.entry_price_usd * 100.0
    }

    /// Price that TP/SL thresholds are measured from. Quotes are
    /// compared against quotes, so entry slippage does not shift them.
    pub fn exit_basis_usd(&self) -> f64 {
        self.entry_quote_usd
            .filter(|q| q.is_finite() && *q > 0.0)
            .unwrap_or(self.entry_price_usd)
    }
}

/// Immutable entry in the append-only trade history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub side: Side,
    pub token: String,
    pub mode: TradeMode,
    pub usd: f64,
    pub price: f64,
    pub tokens: f64,
    /// Realized P&L, sells only
    #[serde(default)]
    pub pnl_usd: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// Exit trigger, sells only
    #[serde(default)]
    pub reason: Option<ExitReason>,
    /// Exchange transaction reference for live fills
    #[serde(default)]
    pub tx_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub wins: u32,
    pub losses: u32,
    /// Largest (peak - balance) / peak ever observed
    pub max_drawdown_fraction: f64,
}

impl LedgerStats {
    pub fn win_rate(&self) -> f64 {
        let total = self.wins + self.losses;
        if total == 0 {
            return 0.0;
        }
        self.wins as f64 / total as f64 * 100.0
    }
}

/// The full persisted ledger aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub initial_balance_usd: f64,
    pub balance_usd: f64,
    pub peak_balance_usd: f64,
    pub positions: HashMap<String, Position>,
    pub trades: Vec<TradeRecord>,
    pub stats: LedgerStats,
    pub updated_at: DateTime<Utc>,
}

impl LedgerState {
    pub fn new(initial_balance_usd: f64) -> Self {
        Self {
            initial_balance_usd,
            balance_usd: initial_balance_usd,
            peak_balance_usd: initial_balance_usd,
            positions: HashMap::new(),
            trades: Vec::new(),
            stats: LedgerStats::default(),
            updated_at: Utc::now(),
        }
    }

    /// Balance implied by the trade history
    pub fn replayed_balance(&self) -> f64 {
        self.trades.iter().fold(self.initial_balance_usd, |balance, t| match t.side {
            Side::Buy => balance - t.usd,
            Side::Sell => balance + t.usd,
        })
    }

    /// Balance deltas agree with the trade history
    pub fn reconciles(&self, epsilon: f64) -> bool {
        (self.replayed_balance() - self.balance_usd).abs() <= epsilon
    }

    pub fn invested_usd(&self) -> f64 {
        self.positions.values().map(|p| p.usd_invested).sum()
    }

    pub fn realized_pnl_usd(&self) -> f64 {
        self.trades.iter().filter_map(|t| t.pnl_usd).sum()
    }

    /// Field-wise comparison tolerant of float round-off
    pub fn approx_eq(&self, other: &LedgerState, epsilon: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= epsilon;

        close(self.initial_balance_usd, other.initial_balance_usd)
            && close(self.balance_usd, other.balance_usd)
            && close(self.peak_balance_usd, other.peak_balance_usd)
            && self.stats.wins == other.stats.wins
            && self.stats.losses == other.stats.losses
            && close(self.stats.max_drawdown_fraction, other.stats.max_drawdown_fraction)
            && self.trades.len() == other.trades.len()
            && self.trades.iter().zip(&other.trades).all(|(a, b)| {
                a.id == b.id
                    && a.side == b.side
                    && a.token == b.token
                    && a.reason == b.reason
                    && close(a.usd, b.usd)
                    && close(a.price, b.price)
                    && close(a.tokens, b.tokens)
                    && match (a.pnl_usd, b.pnl_usd) {
                        (Some(x), Some(y)) => close(x, y),
                        (None, None) => true,
                        _ => false,
                    }
            })
            && self.positions.len() == other.positions.len()
            && self.positions.iter().all(|(token, a)| {
                other.positions.get(token).map_or(false, |b| {
                    a.id == b.id
                        && a.mode == b.mode
                        && a.status == b.status
                        && close(a.entry_price_usd, b.entry_price_usd)
                        && close(a.exit_basis_usd(), b.exit_basis_usd())
                        && close(a.tokens_held, b.tokens_held)
                        && close(a.usd_invested, b.usd_invested)
                        && close(a.highest_price_seen_usd, b.highest_price_seen_usd)
                })
            })
    }
}

/// Read-only view for status output
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSummary {
    pub balance_usd: f64,
    pub peak_balance_usd: f64,
    pub invested_usd: f64,
    pub realized_pnl_usd: f64,
    pub open_positions: usize,
    pub total_trades: usize,
    pub wins: u32,
    pub losses: u32,
    pub win_rate_pct: f64,
    pub max_drawdown_fraction: f64,
}

impl From<&LedgerState> for LedgerSummary {
    fn from(state: &LedgerState) -> Self {
        Self {
            balance_usd: state.balance_usd,
            peak_balance_usd: state.peak_balance_usd,
            invested_usd: state.invested_usd(),
            realized_pnl_usd: state.realized_pnl_usd(),
            open_positions: state.positions.len(),
            total_trades: state.trades.len(),
            wins: state.stats.wins,
            losses: state.stats.losses,
            win_rate_pct: state.stats.win_rate(),
            max_drawdown_fraction: state.stats.max_drawdown_fraction,
        }
    }
}

impl fmt::Display for LedgerSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "balance=${:.2} invested=${:.2} realized=${:+.2} open={} trades={} W/L={}/{} ({:.1}%) max_dd={:.2}%",
            self.balance_usd,
            self.invested_usd,
            self.realized_pnl_usd,
            self.open_positions,
            self.total_trades,
            self.wins,
            self.losses,
            self.win_rate_pct,
            self.max_drawdown_fraction * 100.0
        )
    }
}
