//! Capital protection

pub mod capital_guard;

pub use capital_guard::{CapitalGuard, GuardEvent, GuardRejection, GuardState};
