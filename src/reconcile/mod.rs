//! Balance Reconciliation
//!
//! Recomputes user balances from completed transaction history and active
//! stakes, reports drift against the stored ledger values, and can repair
//! it.

mod reconciler;

pub use reconciler::{
    validate_balance_integrity, BalanceAudit, BalanceFix, BalanceReconciler, CalculatedBalance,
    Inconsistency, ReconcileUserError, ReconciliationReport, INCONSISTENCY_THRESHOLD,
};
