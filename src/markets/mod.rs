//! Market & Commitment Storage
//!
//! Markets, their options, user commitments, and persisted payout records.
//! Option aggregates are derived from the commitment set on read rather
//! than maintained as counters.

mod store;

pub use store::{MarketStore, NewCommitment, NewMarket, NewMarketOption, PayoutRecord};
