//! Trading module - exchange seam and execution coordination
//!
//! The coordinator owns the per-token trade lifecycle; LIVE fills go
//! through an [`ExchangeAdapter`].

pub mod adapter;
pub mod executor;

pub use adapter::{BuyReceipt, ExchangeAdapter, HttpExchangeAdapter, SellReceipt};
pub use executor::{ExecutionCoordinator, ExecutionOutcome, SkipReason, TokenState};
