//! CLI command implementations

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::dexscreener::DexScreenerClient;
use crate::market::{CandidateToken, MetricsProvider};
use crate::position::types::TradeMode;
use crate::position::PositionLedger;
use crate::risk::RiskScorer;
use crate::rpc::{ProviderPool, SolanaConnector};
use crate::safety::{CapitalGuard, GuardEvent};
use crate::trading::{ExecutionCoordinator, HttpExchangeAdapter};

const MARKET_DATA_TIMEOUT: Duration = Duration::from_secs(10);
const CHAIN: &str = "solana";

fn build_pool(config: &Config) -> Result<Arc<ProviderPool>> {
    let connector = SolanaConnector::new(Duration::from_millis(config.rpc.probe_timeout_ms));
    let pool = ProviderPool::new(&config.rpc, &connector).context("Failed to build RPC provider pool")?;
    Ok(Arc::new(pool))
}

fn market_client() -> Result<Arc<DexScreenerClient>> {
    Ok(Arc::new(DexScreenerClient::new(CHAIN, MARKET_DATA_TIMEOUT)?))
}

/// Parse one candidate event line. Blank lines and `#` comments are skipped.
pub fn parse_event_line(line: &str) -> Option<CandidateToken> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    match serde_json::from_str::<CandidateToken>(line) {
        Ok(candidate) => Some(candidate),
        Err(e) => {
            warn!(error = %e, "Ignoring malformed candidate event");
            None
        }
    }
}

/// Feed JSON-lines candidate events into the work queue until EOF
async fn feed_events<R>(reader: R, queue: async_channel::Sender<CandidateToken>) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut sent = 0;

    while let Some(line) = lines.next_line().await? {
        let Some(candidate) = parse_event_line(&line) else {
            continue;
        };
        debug!(token = %candidate.token, pair = %candidate.pair, "Candidate queued");
        if queue.send(candidate).await.is_err() {
            break;
        }
        sent += 1;
    }

    Ok(sent)
}

/// Start the sniper core
pub async fn start(config: &Config, live: bool, events: Option<&Path>) -> Result<()> {
    let mut exec_config = config.execution.clone();
    if live {
        exec_config.mode = TradeMode::Live;
    }

    if exec_config.mode == TradeMode::Live {
        if exec_config.adapter_url.is_none() {
            bail!("LIVE mode requires execution.adapter_url");
        }
        warn!("Running in LIVE mode - trades use real funds");
    } else {
        info!("Running in PAPER mode - fills are simulated");
    }

    info!("Initializing RPC provider pool...");
    let pool = build_pool(config)?;
    let background = CancellationToken::new();
    let health_monitor = pool.spawn_health_monitor(background.clone());

    info!("Loading ledger...");
    let ledger = Arc::new(PositionLedger::open(config.ledger.clone()).await?);
    let summary = ledger.summary().await;
    info!(summary = %summary, "Ledger ready");

    let guard = Arc::new(CapitalGuard::new(config.guard.clone()));
    let mut guard_events = guard.subscribe();
    let guard_watch = background.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = guard_watch.cancelled() => break,
                event = guard_events.recv() => match event {
                    Ok(GuardEvent::KillSwitchTripped { reason }) => {
                        warn!(reason = %reason, "New entries halted; open positions stay monitored");
                    }
                    Ok(GuardEvent::TradingEnabled) => info!("Trading re-enabled"),
                    Ok(GuardEvent::DayReset { date }) => info!(date = %date, "Daily loss counter reset"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Guard event listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    });

    let market = market_client()?;
    let scorer = Arc::new(RiskScorer::new(config.scoring.clone())?.with_pool(pool.clone()));

    let mode = exec_config.mode;
    let mut coordinator = ExecutionCoordinator::new(
        exec_config.clone(),
        config.auto_sell.clone(),
        config.ledger.risk_percent,
        ledger.clone(),
        guard.clone(),
        market.clone(),
    )
    .with_pool(pool.clone());

    if mode == TradeMode::Live {
        if let Some(url) = &exec_config.adapter_url {
            let adapter = HttpExchangeAdapter::new(
                url.clone(),
                exec_config.adapter_api_key.clone(),
                Duration::from_millis(exec_config.trade_timeout_ms),
            )?;
            coordinator = coordinator.with_adapter(Arc::new(adapter));
        }
    }
    let coordinator = Arc::new(coordinator);

    let resumed = coordinator.resume_monitors().await;
    if resumed > 0 {
        info!(resumed, "Resumed monitors for recovered positions");
    }

    let (queue_tx, queue_rx) = async_channel::bounded(exec_config.queue_capacity.max(1));

    let feeder = match events {
        Some(path) => {
            info!(path = %path.display(), "Reading candidate events from file");
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Cannot open events file {}", path.display()))?;
            tokio::spawn(feed_events(BufReader::new(file), queue_tx))
        }
        None => {
            info!("Reading candidate events from stdin (JSON lines)");
            tokio::spawn(feed_events(BufReader::new(tokio::io::stdin()), queue_tx))
        }
    };

    let workers = {
        let coordinator = coordinator.clone();
        let queue = queue_rx.clone();
        let market: Arc<dyn MetricsProvider> = market.clone();
        tokio::spawn(async move { coordinator.run_queue(queue, scorer, market).await })
    };

    info!(
        mode = %mode,
        workers = exec_config.workers,
        take_profit_pct = config.auto_sell.take_profit_pct,
        stop_loss_pct = config.auto_sell.stop_loss_pct,
        "Sniper core running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    feeder.abort();
    queue_rx.close();
    if let Err(e) = workers.await {
        error!(error = %e, "Worker pool panicked");
    }

    coordinator.shutdown().await;
    background.cancel();
    let _ = health_monitor.await;

    println!("\n=== SESSION SUMMARY ===\n");
    println!("{}", ledger.summary().await);
    Ok(())
}

/// Show balance, open positions and recent trades
pub async fn status(config: &Config) -> Result<()> {
    let ledger = PositionLedger::open(config.ledger.clone()).await?;
    let summary = ledger.summary().await;

    println!("\n=== SNIPER STATUS ===\n");
    println!("Ledger: {}", ledger.store_location());
    println!("Balance: ${:.2} (peak ${:.2})", summary.balance_usd, summary.peak_balance_usd);
    println!("Invested: ${:.2}", summary.invested_usd);
    println!("Realized P&L: ${:+.2}", summary.realized_pnl_usd);
    println!(
        "Trades: {} (W/L {}/{}, {:.1}% win rate)",
        summary.total_trades, summary.wins, summary.losses, summary.win_rate_pct
    );
    println!("Max drawdown: {:.2}%", summary.max_drawdown_fraction * 100.0);
    println!(
        "\nGuard limits: max trade ${:.2}, daily loss ${:.2}, loss streak {}",
        config.guard.max_trade_usd, config.guard.max_daily_loss_usd, config.guard.max_loss_streak
    );

    println!("\n=== OPEN POSITIONS ===\n");
    let positions = ledger.positions().await;
    if positions.is_empty() {
        println!("No open positions.");
    }
    for p in positions {
        println!(
            "{} [{}] entry ${:.6} high ${:.6} tokens {:.4} invested ${:.2} since {}",
            p.token,
            p.mode,
            p.entry_price_usd,
            p.highest_price_seen_usd,
            p.tokens_held,
            p.usd_invested,
            p.opened_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    println!("\n=== RECENT TRADES ===\n");
    let trades = ledger.trades(10).await;
    if trades.is_empty() {
        println!("No trades yet.");
    }
    for t in trades {
        let pnl = t.pnl_usd.map(|p| format!(" pnl ${:+.2}", p)).unwrap_or_default();
        let reason = t.reason.map(|r| format!(" ({})", r)).unwrap_or_default();
        println!(
            "{} {} {} ${:.2} @ ${:.6}{}{}",
            t.timestamp.format("%Y-%m-%d %H:%M:%S"),
            t.side,
            t.token,
            t.usd,
            t.price,
            pnl,
            reason
        );
    }

    Ok(())
}

/// Score a single token and print the signal
pub async fn score(config: &Config, token: &str) -> Result<()> {
    let market = market_client()?;

    let mut scorer = RiskScorer::new(config.scoring.clone())?;
    match build_pool(config) {
        Ok(pool) => scorer = scorer.with_pool(pool),
        Err(e) => warn!(error = %e, "Scoring without on-chain code lookup"),
    }

    let pair = market.get_token_pair(token).await.unwrap_or_else(|e| {
        warn!(token = %token, error = %e, "Pair lookup failed");
        None
    });
    let pair_address = pair.as_ref().map(|p| p.pair_address.clone()).unwrap_or_default();
    let metrics = pair.as_ref().map(crate::dexscreener::pair_to_metrics);

    let candidate = CandidateToken::new(token, pair_address);
    let signal = scorer.score(&candidate, metrics.as_ref()).await;

    println!("\n=== RISK SIGNAL ===\n");
    println!("{}", signal);
    println!("{}", serde_json::to_string_pretty(&signal)?);
    Ok(())
}

/// Check RPC endpoints, market data and ledger storage
pub async fn health(config: &Config) -> Result<()> {
    println!("\n=== SYSTEM HEALTH CHECK ===\n");

    let mut all_healthy = true;
    let pool = build_pool(config)?;

    print!("RPC pool... ");
    let started = Instant::now();
    match pool.current_block().await {
        Ok(block) => println!("OK (block {}, {}ms)", block, started.elapsed().as_millis()),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }
    let current = pool.current_index();
    for (i, endpoint) in pool.endpoints().await.iter().enumerate() {
        let marker = if i == current { "*" } else { " " };
        let last = endpoint
            .last_healthy
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "  {} {} (failures: {}, last healthy: {})",
            marker, endpoint.name, endpoint.consecutive_failures, last
        );
    }

    print!("Market data... ");
    let market = market_client()?;
    match market.get_token_pair("So11111111111111111111111111111111111111112").await {
        Ok(_) => println!("OK"),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    print!("Ledger... ");
    match PositionLedger::open(config.ledger.clone()).await {
        Ok(ledger) => println!("OK ({})", ledger.store_location()),
        Err(e) => {
            println!("FAILED: {}", e);
            all_healthy = false;
        }
    }

    print!("Exchange adapter... ");
    match &config.execution.adapter_url {
        Some(_) => println!("CONFIGURED"),
        None => println!("NOT CONFIGURED (paper only)"),
    }

    println!();
    if all_healthy {
        println!("All systems healthy");
        Ok(())
    } else {
        bail!("One or more health checks failed")
    }
}

/// Print the effective configuration with secrets masked
pub fn show_config(config: &Config) -> Result<()> {
    println!("{}", config.masked_display());
    Ok(())
}
