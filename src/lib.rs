//! Token Sniper Core Library
//!
//! Decision core of a DEX token sniper: RPC failover, risk scoring, capital
//! protection, a crash-safe position ledger and trade execution with
//! TP/SL/trailing-stop monitors.

pub mod cli;
pub mod config;
pub mod dexscreener;
pub mod error;
pub mod market;
pub mod position;
pub mod risk;
pub mod rpc;
pub mod safety;
pub mod trading;

// Re-export commonly used types
pub use config::Config;
pub use error::{Error, Result};
