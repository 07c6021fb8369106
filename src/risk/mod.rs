//! Rug/fraud risk scoring

pub mod bytecode;
pub mod scorer;
pub mod types;

pub use bytecode::{CodeFindings, KeywordScanner};
pub use scorer::RiskScorer;
pub use types::{RiskFlag, RiskSignal, RiskTier, SignalMetrics, SubScores};
