//! Exit monitoring
//!
//! WARNING: TP/SL is best-effort, not guaranteed. Between polls a fast rug
//! can gap straight through the stop-loss.
//!
//! Every open position gets one monitor task. Tasks live in a
//! [`MonitorSupervisor`] so a single position can be cancelled and shutdown
//! can drain all of them.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::AutoSellConfig;
use crate::error::Result;
use crate::position::types::ExitReason;

/// Decide whether a position should be sold at `current_price`.
///
/// Take-profit wins over stop-loss, stop-loss over the trailing stop. The
/// trailing stop is the drawdown from the highest price seen since entry,
/// whether or not the position was ever in profit.
pub fn check_exit(
    entry_price: f64,
    highest_price: f64,
    current_price: f64,
    config: &AutoSellConfig,
) -> Option<ExitReason> {
    if entry_price <= 0.0 || current_price <= 0.0 {
        return None;
    }

    let pnl_pct = (current_price - entry_price) / entry_price * 100.0;
    if pnl_pct >= config.take_profit_pct {
        return Some(ExitReason::TakeProfit);
    }
    if pnl_pct <= -config.stop_loss_pct {
        return Some(ExitReason::StopLoss);
    }

    if config.trailing_stop_enabled {
        let peak = highest_price.max(current_price);
        let drawdown_pct = (peak - current_price) / peak * 100.0;
        if drawdown_pct >= config.trailing_stop_pct {
            return Some(ExitReason::TrailingStop);
        }
    }

    None
}

/// Owns the per-position monitor tasks
pub struct MonitorSupervisor {
    tracker: TaskTracker,
    root: CancellationToken,
    /// token -> (generation, cancel handle)
    monitors: Arc<DashMap<String, (u64, CancellationToken)>>,
    generation: AtomicU64,
}

impl Default for MonitorSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorSupervisor {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            root: CancellationToken::new(),
            monitors: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Start a polling loop for `token`. `tick` runs once per interval and
    /// returns `Ok(true)` when the position is done. Errors are logged and
    /// the loop carries on. Returns false if a monitor already runs or the
    /// supervisor is shutting down.
    pub fn spawn<F, Fut>(&self, token: &str, poll_interval: Duration, mut tick: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        if self.root.is_cancelled() {
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.root.child_token();
        match self.monitors.entry(token.to_string()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert((generation, cancel.clone()));
            }
        }

        let token = token.to_string();
        let monitors = self.monitors.clone();

        self.tracker.spawn(async move {
            let mut ticker = interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately
            ticker.tick().await;

            info!(token = %token, interval_ms = poll_interval.as_millis() as u64, "Monitor started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!(token = %token, "Monitor cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        match tick().await {
                            Ok(true) => {
                                debug!(token = %token, "Monitor finished");
                                break;
                            }
                            Ok(false) => {}
                            Err(e) => {
                                warn!(token = %token, error = %e, "Monitor iteration failed, retrying next tick");
                            }
                        }
                    }
                }
            }

            monitors.remove_if(&token, |_, (g, _)| *g == generation);
        });

        true
    }

    /// Stop the monitor for one token
    pub fn cancel(&self, token: &str) -> bool {
        match self.monitors.remove(token) {
            Some((_, (_, cancel))) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_monitoring(&self, token: &str) -> bool {
        self.monitors.contains_key(token)
    }

    pub fn active_count(&self) -> usize {
        self.monitors.len()
    }

    /// Cancel every monitor and wait for all of them to exit
    pub async fn shutdown(&self) {
        info!(active = self.monitors.len(), "Stopping monitors");
        self.root.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.monitors.clear();
    }
}
