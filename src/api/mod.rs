//! Admin/UI HTTP API
//!
//! Narrow settlement surface: resolve, rollback, preview, audit log,
//! balances, and reconciliation. Authentication is handled upstream.

mod routes;

pub use routes::{create_router, AppState};
