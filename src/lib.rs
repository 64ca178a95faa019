//! TokenPool Backend Library
//!
//! Exposes the settlement core for use by the server binary and
//! integration tests.

pub mod api;
pub mod errors;
pub mod ledger;
pub mod markets;
pub mod models;
pub mod payout;
pub mod reconcile;
pub mod resolution;
