//! Token Sniper - risk-scored DEX token sniper core
//!
//! # WARNING
//! - LIVE mode trades with real money. Only use funds you can afford to lose.
//! - Most freshly launched tokens go to zero (rug pulls, abandonment).
//! - TP/SL is polled, not guaranteed: a fast rug can gap through the stop.
//! - Paper results do NOT equal live results.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;

// Use the library crate
use token_sniper::cli::commands;
use token_sniper::config::Config;

/// Token Sniper - risk-scored DEX token sniper
#[derive(Parser)]
#[command(name = "snipe")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sniper core
    Start {
        /// Trade with real funds through the exchange adapter
        #[arg(long)]
        live: bool,

        /// Candidate events as JSON lines (default: stdin)
        #[arg(long, value_name = "FILE")]
        events: Option<PathBuf>,
    },

    /// Show balance, open positions and recent trades
    Status,

    /// Score a token and print the risk signal
    Score {
        /// Token address
        token: String,
    },

    /// Check system health (RPC pool, market data, ledger)
    Health,

    /// Show current configuration (secrets masked)
    Config,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("token_sniper=info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    init_tracing(cli.json_logs);

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Start { live, events } => commands::start(&config, live, events.as_deref()).await,
        Commands::Status => commands::status(&config).await,
        Commands::Score { token } => commands::score(&config, &token).await,
        Commands::Health => commands::health(&config).await,
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
