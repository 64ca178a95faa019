//! Settlement Error Taxonomy
//!
//! Typed errors for the settlement core. Validation errors abort before any
//! durable write; `LedgerApplicationFailed` is non-fatal and healed by
//! reconciliation; `ConcurrentModification` is a retry signal.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettlementError {
    /// Malformed arguments, never retried
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Creator fee outside the allowed [0.01, 0.05] fraction range
    #[error("creator fee {0} outside allowed range [0.01, 0.05]")]
    InvalidFeeRange(f64),

    /// Ledger commit exceeds available balance
    #[error("insufficient funds for {user_id}: available {available}, requested {requested}")]
    InsufficientFunds {
        user_id: String,
        available: f64,
        requested: f64,
    },

    /// Optimistic-concurrency conflict; caller re-reads and retries
    #[error("concurrent modification of balance for {user_id} (expected version {expected_version})")]
    ConcurrentModification {
        user_id: String,
        expected_version: i64,
    },

    #[error("market not found: {0}")]
    MarketNotFound(String),

    /// Resolution precondition failed (wrong market state, duplicate attempt)
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Per-recipient ledger failure during distribution; logged, not fatal
    #[error("ledger application failed for {user_id}: {reason}")]
    LedgerApplicationFailed { user_id: String, reason: String },

    /// Balance fix requested but there is nothing to correct
    #[error("nothing to fix for user {0}")]
    NothingToFix(String),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl From<rusqlite::Error> for SettlementError {
    fn from(err: rusqlite::Error) -> Self {
        SettlementError::Storage(anyhow::Error::new(err))
    }
}

impl From<serde_json::Error> for SettlementError {
    fn from(err: serde_json::Error) -> Self {
        SettlementError::Storage(anyhow::Error::new(err))
    }
}

pub type SettlementResult<T> = Result<T, SettlementError>;
