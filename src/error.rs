//! Error types for the sniper core

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sniper core
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // RPC errors
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC timeout after {0}ms")]
    RpcTimeout(u64),

    #[error("All {0} RPC endpoints are down")]
    AllEndpointsDown(usize),

    // Ledger errors
    #[error("Invalid price: {0}")]
    InvalidPrice(f64),

    #[error("Invalid sell fraction: {0} (must be in (0, 1])")]
    InvalidFraction(f64),

    #[error("Insufficient balance: ${available:.2} available, ${required:.2} required")]
    InsufficientBalance { available: f64, required: f64 },

    #[error("Ledger lock not acquired within {0}ms")]
    LedgerLockTimeout(u64),

    #[error("Ledger persistence failed: {0}")]
    LedgerPersistence(String),

    #[error("Position not found: {0}")]
    PositionNotFound(String),

    // Exchange adapter errors
    #[error("Exchange {side} failed for {token}: {message}")]
    Exchange {
        side: &'static str,
        token: String,
        message: String,
        retryable: bool,
    },

    #[error("Trade timed out after {timeout_ms}ms for {token}")]
    TradeTimeout { token: String, timeout_ms: u64 },

    // Market data errors
    #[error("Price unavailable for {0}")]
    PriceUnavailable(String),

    #[error("HTTP error: {0}")]
    Http(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Rpc(_) | Error::RpcTimeout(_) | Error::Http(_) => true,
            Error::Exchange { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Check if this error points at an unhealthy endpoint
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_)
                | Error::RpcTimeout(_)
                | Error::AllEndpointsDown(_)
                | Error::TradeTimeout { .. }
        )
    }
}

// Conversion from solana_client errors
impl From<solana_client::client_error::ClientError> for Error {
    fn from(e: solana_client::client_error::ClientError) -> Self {
        Error::Rpc(e.to_string())
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}
