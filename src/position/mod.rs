//! Position ledger and exit monitoring

pub mod ledger;
pub mod monitor;
pub mod store;
pub mod types;

pub use ledger::PositionLedger;
pub use monitor::{check_exit, MonitorSupervisor};
pub use store::{JsonFileStore, LedgerStore, MemoryStore};
pub use types::{ExitReason, LedgerState, LedgerSummary, Position, Side, TradeMode, TradeRecord};
