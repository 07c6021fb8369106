//! Capital Guard
//!
//! Process-wide governor that decides whether any trade may be attempted.
//! Enforces a per-trade size cap, a daily loss cap and a loss-streak kill
//! switch. Once the kill switch trips, trading stays off until an operator
//! calls [`CapitalGuard::enable_trading`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::GuardConfig;

/// Reasons the guard refuses a trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardRejection {
    /// Kill switch is tripped or trading was halted manually
    TradingDisabled { reason: String },
    /// Amount is zero, negative or not a number
    InvalidAmount { amount_usd: f64 },
    ExceedsMaxTradeSize { amount_usd: f64, max_usd: f64 },
    DailyLossLimitReached { loss_usd: f64, limit_usd: f64 },
    MaxLossStreakReached { streak: u32, limit: u32 },
}

impl GuardRejection {
    /// Get human-readable description
    pub fn description(&self) -> String {
        match self {
            GuardRejection::TradingDisabled { reason } => {
                format!("Trading disabled: {}", reason)
            }
            GuardRejection::InvalidAmount { amount_usd } => {
                format!("Invalid trade amount: ${:.2}", amount_usd)
            }
            GuardRejection::ExceedsMaxTradeSize { amount_usd, max_usd } => {
                format!("Trade size ${:.2} exceeds max ${:.2}", amount_usd, max_usd)
            }
            GuardRejection::DailyLossLimitReached { loss_usd, limit_usd } => {
                format!("Daily loss limit: ${:.2}/${:.2}", loss_usd, limit_usd)
            }
            GuardRejection::MaxLossStreakReached { streak, limit } => {
                format!("Loss streak: {}/{}", streak, limit)
            }
        }
    }
}

impl fmt::Display for GuardRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description())
    }
}

/// Operator notifications emitted by the guard
#[derive(Debug, Clone, PartialEq)]
pub enum GuardEvent {
    KillSwitchTripped { reason: String },
    TradingEnabled,
    DayReset { date: NaiveDate },
}

/// Snapshot of the guard's counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardState {
    pub trading_enabled: bool,
    pub daily_loss_usd: f64,
    pub loss_streak: u32,
    pub last_reset_date: NaiveDate,
    pub disabled_reason: Option<String>,
}

impl GuardState {
    fn new(today: NaiveDate) -> Self {
        Self {
            trading_enabled: true,
            daily_loss_usd: 0.0,
            loss_streak: 0,
            last_reset_date: today,
            disabled_reason: None,
        }
    }
}

/// Capital-preservation governor
pub struct CapitalGuard {
    config: GuardConfig,
    state: Mutex<GuardState>,
    events: broadcast::Sender<GuardEvent>,
}

impl CapitalGuard {
    pub fn new(config: GuardConfig) -> Self {
        Self::new_at(config, Utc::now())
    }

    pub fn new_at(config: GuardConfig, now: DateTime<Utc>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            state: Mutex::new(GuardState::new(now.date_naive())),
            events,
        }
    }

    /// Receive kill switch and reset notifications
    pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
        self.events.subscribe()
    }

    /// Mandatory checkpoint before every trade attempt
    pub fn can_trade(&self, amount_usd: f64) -> Result<(), GuardRejection> {
        self.can_trade_at(amount_usd, Utc::now())
    }

    pub fn can_trade_at(&self, amount_usd: f64, now: DateTime<Utc>) -> Result<(), GuardRejection> {
        let mut state = self.lock();
        self.roll_day(&mut state, now);

        let result = self.check(&state, amount_usd);
        if let Err(rejection) = &result {
            info!(amount_usd = amount_usd, reason = %rejection, "Guard rejected trade");
        }
        result
    }

    fn check(&self, state: &GuardState, amount_usd: f64) -> Result<(), GuardRejection> {
        if !state.trading_enabled {
            return Err(GuardRejection::TradingDisabled {
                reason: state
                    .disabled_reason
                    .clone()
                    .unwrap_or_else(|| "kill switch".to_string()),
            });
        }

        if !amount_usd.is_finite() || amount_usd <= 0.0 {
            return Err(GuardRejection::InvalidAmount { amount_usd });
        }

        if amount_usd > self.config.max_trade_usd {
            return Err(GuardRejection::ExceedsMaxTradeSize {
                amount_usd,
                max_usd: self.config.max_trade_usd,
            });
        }

        if state.daily_loss_usd >= self.config.max_daily_loss_usd {
            return Err(GuardRejection::DailyLossLimitReached {
                loss_usd: state.daily_loss_usd,
                limit_usd: self.config.max_daily_loss_usd,
            });
        }

        if state.loss_streak >= self.config.max_loss_streak {
            return Err(GuardRejection::MaxLossStreakReached {
                streak: state.loss_streak,
                limit: self.config.max_loss_streak,
            });
        }

        Ok(())
    }

    /// Record a realized loss. Returns true when this call tripped the kill switch.
    pub fn record_loss(&self, amount_usd: f64) -> bool {
        self.record_loss_at(amount_usd, Utc::now())
    }

    pub fn record_loss_at(&self, amount_usd: f64, now: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        self.roll_day(&mut state, now);

        state.daily_loss_usd += amount_usd.abs();
        state.loss_streak += 1;

        info!(
            loss_usd = amount_usd.abs(),
            daily_loss_usd = state.daily_loss_usd,
            loss_streak = state.loss_streak,
            "Loss recorded"
        );

        if !state.trading_enabled {
            return false;
        }

        let reason = if state.daily_loss_usd >= self.config.max_daily_loss_usd {
            format!(
                "daily loss ${:.2} reached limit ${:.2}",
                state.daily_loss_usd, self.config.max_daily_loss_usd
            )
        } else if state.loss_streak >= self.config.max_loss_streak {
            format!(
                "{} consecutive losses reached limit {}",
                state.loss_streak, self.config.max_loss_streak
            )
        } else {
            return false;
        };

        self.trip(&mut state, reason);
        true
    }

    /// A winning trade breaks the loss streak
    pub fn record_win(&self, amount_usd: f64) {
        self.record_win_at(amount_usd, Utc::now())
    }

    pub fn record_win_at(&self, amount_usd: f64, now: DateTime<Utc>) {
        let mut state = self.lock();
        self.roll_day(&mut state, now);
        state.loss_streak = 0;
        info!(profit_usd = amount_usd, "Win recorded, loss streak reset");
    }

    /// Halt trading until re-enabled
    pub fn disable_trading(&self, reason: &str) {
        let mut state = self.lock();
        if state.trading_enabled {
            self.trip(&mut state, reason.to_string());
        }
    }

    /// Re-arm trading after a kill switch trip. Clears the loss streak; the
    /// daily loss stays until the UTC day rolls over.
    pub fn enable_trading(&self) {
        let mut state = self.lock();
        state.trading_enabled = true;
        state.disabled_reason = None;
        state.loss_streak = 0;
        warn!(daily_loss_usd = state.daily_loss_usd, "Trading re-enabled by operator");
        let _ = self.events.send(GuardEvent::TradingEnabled);
    }

    pub fn is_trading_enabled(&self) -> bool {
        self.lock().trading_enabled
    }

    pub fn state(&self) -> GuardState {
        self.lock().clone()
    }

    fn trip(&self, state: &mut GuardState, reason: String) {
        state.trading_enabled = false;
        state.disabled_reason = Some(reason.clone());
        error!(
            reason = %reason,
            daily_loss_usd = state.daily_loss_usd,
            loss_streak = state.loss_streak,
            "KILL SWITCH: trading disabled"
        );
        let _ = self.events.send(GuardEvent::KillSwitchTripped { reason });
    }

    /// Lazy daily reset on first access of a new UTC day
    fn roll_day(&self, state: &mut GuardState, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today > state.last_reset_date {
            info!(
                date = %today,
                previous_loss_usd = state.daily_loss_usd,
                "New trading day, daily loss reset"
            );
            state.daily_loss_usd = 0.0;
            state.last_reset_date = today;
            let _ = self.events.send(GuardEvent::DayReset { date: today });
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
