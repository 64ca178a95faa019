//! Balance Ledger
//!
//! Sole writer of user token balances. Every mutation is an atomic
//! read-modify-write guarded by a version counter, paired with an
//! append-only transaction record in the same SQLite transaction.

mod store;

pub use store::{BalanceLedger, BalanceSnapshot, BalanceUpdate, MAX_BALANCE_RETRIES};
