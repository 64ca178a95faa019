use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::errors::{SettlementError, SettlementResult};
use crate::ledger::{BalanceLedger, BalanceSnapshot};
use crate::markets::MarketStore;
use crate::models::{TransactionType, UserBalance, BALANCE_EPSILON};

/// Per-field drift threshold; differences at or below this are rounding
/// noise, not inconsistencies
pub const INCONSISTENCY_THRESHOLD: f64 = 0.01;

/// Balance implied by transaction history and active stakes
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CalculatedBalance {
    pub available_tokens: f64,
    pub committed_tokens: f64,
    pub total_earned: f64,
    pub total_spent: f64,
}

impl CalculatedBalance {
    fn is_zero(&self) -> bool {
        self.available_tokens == 0.0
            && self.committed_tokens == 0.0
            && self.total_earned == 0.0
            && self.total_spent == 0.0
    }

    fn snapshot(&self) -> BalanceSnapshot {
        BalanceSnapshot {
            available_tokens: self.available_tokens,
            committed_tokens: self.committed_tokens,
            total_earned: self.total_earned,
            total_spent: self.total_spent,
        }
    }
}

/// One drifted field
#[derive(Debug, Clone, Serialize)]
pub struct Inconsistency {
    pub field: String,
    pub stored: f64,
    pub calculated: f64,
    pub difference: f64,
}

/// Audit result for one user
#[derive(Debug, Clone, Serialize)]
pub struct BalanceAudit {
    pub user_id: String,
    pub current_balance: Option<UserBalance>,
    pub calculated_balance: CalculatedBalance,
    pub inconsistencies: Vec<Inconsistency>,
}

/// Result of overwriting a drifted balance
#[derive(Debug, Clone, Serialize)]
pub struct BalanceFix {
    pub user_id: String,
    pub corrected: UserBalance,
    pub inconsistencies_repaired: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileUserError {
    pub user_id: String,
    pub error: String,
}

/// Batch reconciliation summary
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub total_users_checked: usize,
    pub users_with_inconsistencies: usize,
    pub users_fixed: usize,
    pub errors: Vec<ReconcileUserError>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Detects and repairs drift between stored balances and the balance
/// implied by transaction history
pub struct BalanceReconciler {
    ledger: Arc<BalanceLedger>,
    markets: Arc<MarketStore>,
}

impl BalanceReconciler {
    pub fn new(ledger: Arc<BalanceLedger>, markets: Arc<MarketStore>) -> Self {
        Self { ledger, markets }
    }

    /// Recompute a user's balance from completed transactions and active
    /// commitments and compare it against the stored row.
    pub async fn audit_user_balance(&self, user_id: &str) -> SettlementResult<BalanceAudit> {
        let stored = self.ledger.get_balance(user_id).await?;
        let calculated = self.calculate_balance(user_id).await?;

        let reference = stored
            .clone()
            .unwrap_or_else(|| UserBalance::empty(user_id));
        let mut inconsistencies = Vec::new();
        for (field, stored_value, calculated_value) in [
            (
                "available_tokens",
                reference.available_tokens,
                calculated.available_tokens,
            ),
            (
                "committed_tokens",
                reference.committed_tokens,
                calculated.committed_tokens,
            ),
            ("total_earned", reference.total_earned, calculated.total_earned),
            ("total_spent", reference.total_spent, calculated.total_spent),
        ] {
            let difference = (stored_value - calculated_value).abs();
            if difference > INCONSISTENCY_THRESHOLD {
                inconsistencies.push(Inconsistency {
                    field: field.to_string(),
                    stored: stored_value,
                    calculated: calculated_value,
                    difference,
                });
            }
        }

        if !inconsistencies.is_empty() {
            warn!(
                user_id,
                drifted_fields = inconsistencies.len(),
                "🔍 Balance drift detected"
            );
        }

        Ok(BalanceAudit {
            user_id: user_id.to_string(),
            current_balance: stored,
            calculated_balance: calculated,
            inconsistencies,
        })
    }

    /// Replay rule: completed purchases/wins/refunds add to earned, losses
    /// to spent; committed tokens come from currently-active stakes;
    /// available is the clamped remainder.
    async fn calculate_balance(&self, user_id: &str) -> SettlementResult<CalculatedBalance> {
        let transactions = self.ledger.completed_transactions(user_id).await?;

        let mut total_earned = 0.0;
        let mut total_spent = 0.0;
        for tx in &transactions {
            match tx.tx_type {
                TransactionType::Purchase | TransactionType::Win | TransactionType::Refund => {
                    total_earned += tx.amount;
                }
                TransactionType::Loss => {
                    total_spent += tx.amount;
                }
                TransactionType::Commit => {}
            }
        }

        let committed_tokens: f64 = self
            .markets
            .active_commitments_for_user(user_id)
            .await?
            .iter()
            .map(|c| c.tokens_committed)
            .sum();

        Ok(CalculatedBalance {
            available_tokens: (total_earned - total_spent - committed_tokens).max(0.0),
            committed_tokens,
            total_earned,
            total_spent,
        })
    }

    /// Overwrite the stored balance with the recomputed one, bumping the
    /// version. Fails with `NothingToFix` when there is neither a stored
    /// row nor any recomputed value.
    pub async fn fix_user_balance(&self, user_id: &str) -> SettlementResult<BalanceFix> {
        let audit = self.audit_user_balance(user_id).await?;
        if audit.current_balance.is_none() && audit.calculated_balance.is_zero() {
            return Err(SettlementError::NothingToFix(user_id.to_string()));
        }

        let corrected = self
            .ledger
            .overwrite_balance(user_id, audit.calculated_balance.snapshot())
            .await?;
        info!(
            user_id,
            repaired = audit.inconsistencies.len(),
            version = corrected.version,
            "🔧 Balance fixed"
        );
        Ok(BalanceFix {
            user_id: user_id.to_string(),
            corrected,
            inconsistencies_repaired: audit.inconsistencies.len(),
        })
    }

    /// Audit every user the ledger knows about, fixing drifted balances.
    pub async fn reconcile_all_users(&self) -> SettlementResult<ReconciliationReport> {
        let ids = self.ledger.all_user_ids().await?;
        Ok(self.reconcile_multiple_users(&ids).await)
    }

    /// Batch audit-and-fix. A single user's failure is collected into the
    /// report, never aborting the batch.
    pub async fn reconcile_multiple_users(&self, user_ids: &[String]) -> ReconciliationReport {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut users_with_inconsistencies = 0;
        let mut users_fixed = 0;
        let mut errors = Vec::new();

        for user_id in user_ids {
            match self.audit_user_balance(user_id).await {
                Ok(audit) if audit.inconsistencies.is_empty() => {}
                Ok(_) => {
                    users_with_inconsistencies += 1;
                    match self.fix_user_balance(user_id).await {
                        Ok(_) => users_fixed += 1,
                        Err(err) => errors.push(ReconcileUserError {
                            user_id: user_id.clone(),
                            error: err.to_string(),
                        }),
                    }
                }
                Err(err) => errors.push(ReconcileUserError {
                    user_id: user_id.clone(),
                    error: err.to_string(),
                }),
            }
        }

        let report = ReconciliationReport {
            total_users_checked: user_ids.len(),
            users_with_inconsistencies,
            users_fixed,
            errors,
            started_at,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            checked = report.total_users_checked,
            drifted = report.users_with_inconsistencies,
            fixed = report.users_fixed,
            failed = report.errors.len(),
            duration_ms = report.duration_ms,
            "🧮 Reconciliation batch finished"
        );
        report
    }
}

/// Cheap structural check of the balance invariants, independent of any
/// transaction replay. Returns a list of violation descriptions.
pub fn validate_balance_integrity(balance: &UserBalance) -> Vec<String> {
    let mut violations = Vec::new();

    for (field, value) in [
        ("available_tokens", balance.available_tokens),
        ("committed_tokens", balance.committed_tokens),
        ("total_earned", balance.total_earned),
        ("total_spent", balance.total_spent),
    ] {
        if value < 0.0 || !value.is_finite() {
            violations.push(format!("{} is negative or non-finite: {}", field, value));
        }
    }

    let net_earned = balance.total_earned - balance.total_spent;
    if balance.available_tokens + balance.committed_tokens > net_earned + BALANCE_EPSILON {
        violations.push(format!(
            "available + committed ({}) exceeds net earned ({})",
            balance.available_tokens + balance.committed_tokens,
            net_earned
        ));
    }

    if balance.version < 1 {
        violations.push(format!("version must be positive, got {}", balance.version));
    }

    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::BalanceUpdate;
    use crate::markets::{NewCommitment, NewMarket, NewMarketOption};
    use tempfile::TempDir;

    struct Fixture {
        reconciler: BalanceReconciler,
        ledger: Arc<BalanceLedger>,
        markets: Arc<MarketStore>,
        _dir: TempDir,
    }

    fn create_fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("reconcile.db");
        let db = db.to_str().unwrap();
        let ledger = Arc::new(BalanceLedger::new(db).unwrap());
        let markets = Arc::new(MarketStore::new(db).unwrap());
        let reconciler = BalanceReconciler::new(Arc::clone(&ledger), Arc::clone(&markets));
        Fixture {
            reconciler,
            ledger,
            markets,
            _dir: dir,
        }
    }

    async fn purchase(fx: &Fixture, user: &str, amount: f64) {
        fx.ledger
            .update_balance_atomic(BalanceUpdate {
                user_id: user.to_string(),
                amount,
                tx_type: TransactionType::Purchase,
                related_id: None,
                metadata: None,
            })
            .await
            .unwrap();
    }

    async fn commit_stake(fx: &Fixture, user: &str, market_id: &str, amount: f64) {
        fx.ledger
            .update_balance_atomic(BalanceUpdate {
                user_id: user.to_string(),
                amount,
                tx_type: TransactionType::Commit,
                related_id: Some(market_id.to_string()),
                metadata: None,
            })
            .await
            .unwrap();
        fx.markets
            .insert_commitment(&NewCommitment {
                user_id: user.to_string(),
                market_id: market_id.to_string(),
                option_id: "yes".to_string(),
                tokens_committed: amount,
                odds: 2.0,
            })
            .await
            .unwrap();
    }

    async fn create_market(fx: &Fixture) -> String {
        fx.markets
            .create_market(&NewMarket {
                title: "test".to_string(),
                creator_id: "creator".to_string(),
                options: vec![
                    NewMarketOption {
                        option_id: "yes".to_string(),
                        label: "Yes".to_string(),
                    },
                    NewMarketOption {
                        option_id: "no".to_string(),
                        label: "No".to_string(),
                    },
                ],
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_clean_balance_audits_clean() {
        let fx = create_fixture();
        let market = create_market(&fx).await;
        purchase(&fx, "alice", 500.0).await;
        commit_stake(&fx, "alice", &market, 100.0).await;

        let audit = fx.reconciler.audit_user_balance("alice").await.unwrap();
        assert!(audit.inconsistencies.is_empty());
        assert_eq!(audit.calculated_balance.available_tokens, 400.0);
        assert_eq!(audit.calculated_balance.committed_tokens, 100.0);
    }

    #[tokio::test]
    async fn test_drift_detected_exactly() {
        let fx = create_fixture();
        let market = create_market(&fx).await;
        purchase(&fx, "alice", 500.0).await;
        commit_stake(&fx, "alice", &market, 100.0).await;

        // Corrupt the stored available balance to 380
        fx.ledger
            .overwrite_balance(
                "alice",
                BalanceSnapshot {
                    available_tokens: 380.0,
                    committed_tokens: 100.0,
                    total_earned: 500.0,
                    total_spent: 0.0,
                },
            )
            .await
            .unwrap();

        let audit = fx.reconciler.audit_user_balance("alice").await.unwrap();
        assert_eq!(audit.inconsistencies.len(), 1);
        let inc = &audit.inconsistencies[0];
        assert_eq!(inc.field, "available_tokens");
        assert_eq!(inc.stored, 380.0);
        assert_eq!(inc.calculated, 400.0);
        assert_eq!(inc.difference, 20.0);
    }

    #[tokio::test]
    async fn test_fix_overwrites_with_calculated() {
        let fx = create_fixture();
        let market = create_market(&fx).await;
        purchase(&fx, "alice", 500.0).await;
        commit_stake(&fx, "alice", &market, 100.0).await;
        fx.ledger
            .overwrite_balance(
                "alice",
                BalanceSnapshot {
                    available_tokens: 380.0,
                    committed_tokens: 100.0,
                    total_earned: 500.0,
                    total_spent: 0.0,
                },
            )
            .await
            .unwrap();

        let before = fx.ledger.get_balance("alice").await.unwrap().unwrap();
        let fix = fx.reconciler.fix_user_balance("alice").await.unwrap();
        assert_eq!(fix.inconsistencies_repaired, 1);
        assert_eq!(fix.corrected.available_tokens, 400.0);
        assert_eq!(fix.corrected.version, before.version + 1);

        let audit = fx.reconciler.audit_user_balance("alice").await.unwrap();
        assert!(audit.inconsistencies.is_empty());
    }

    #[tokio::test]
    async fn test_nothing_to_fix() {
        let fx = create_fixture();
        let err = fx.reconciler.fix_user_balance("ghost").await.unwrap_err();
        assert!(matches!(err, SettlementError::NothingToFix(_)));
    }

    #[tokio::test]
    async fn test_settled_loss_realigns_committed() {
        let fx = create_fixture();
        let market = create_market(&fx).await;
        purchase(&fx, "alice", 500.0).await;
        commit_stake(&fx, "alice", &market, 100.0).await;

        // Settle the market against alice: commitment leaves active and a
        // loss transaction lands, but the stored committed_tokens is stale
        // until reconciliation.
        let commitment_id = fx
            .markets
            .active_commitments_for_user("alice")
            .await
            .unwrap()[0]
            .id
            .clone();
        fx.markets
            .apply_resolution(&market, "res-1", "no", "{}", &[], &[commitment_id])
            .await
            .unwrap();
        fx.ledger
            .update_balance_atomic(BalanceUpdate {
                user_id: "alice".to_string(),
                amount: 100.0,
                tx_type: TransactionType::Loss,
                related_id: Some("res-1".to_string()),
                metadata: None,
            })
            .await
            .unwrap();

        let audit = fx.reconciler.audit_user_balance("alice").await.unwrap();
        assert_eq!(audit.inconsistencies.len(), 1);
        assert_eq!(audit.inconsistencies[0].field, "committed_tokens");

        let fix = fx.reconciler.fix_user_balance("alice").await.unwrap();
        assert_eq!(fix.corrected.committed_tokens, 0.0);
        assert_eq!(fix.corrected.available_tokens, 400.0);
        assert_eq!(fix.corrected.total_spent, 100.0);
    }

    #[tokio::test]
    async fn test_batch_report() {
        let fx = create_fixture();
        let market = create_market(&fx).await;
        purchase(&fx, "alice", 500.0).await;
        commit_stake(&fx, "alice", &market, 100.0).await;
        purchase(&fx, "bob", 200.0).await;
        fx.ledger
            .overwrite_balance(
                "alice",
                BalanceSnapshot {
                    available_tokens: 380.0,
                    committed_tokens: 100.0,
                    total_earned: 500.0,
                    total_spent: 0.0,
                },
            )
            .await
            .unwrap();

        let report = fx.reconciler.reconcile_all_users().await.unwrap();
        assert_eq!(report.total_users_checked, 2);
        assert_eq!(report.users_with_inconsistencies, 1);
        assert_eq!(report.users_fixed, 1);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_integrity_violations() {
        let mut balance = UserBalance::empty("u1");
        balance.version = 1;
        assert!(validate_balance_integrity(&balance).is_empty());

        balance.available_tokens = -1.0;
        let violations = validate_balance_integrity(&balance);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("available_tokens"));

        let mut balance = UserBalance::empty("u1");
        balance.version = 1;
        balance.available_tokens = 100.0;
        balance.committed_tokens = 50.0;
        balance.total_earned = 120.0;
        let violations = validate_balance_integrity(&balance);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("exceeds net earned"));

        let mut balance = UserBalance::empty("u1");
        balance.version = 0;
        assert_eq!(validate_balance_integrity(&balance).len(), 1);
    }
}
