use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{SettlementError, SettlementResult};
use crate::models::{TokenTransaction, TransactionStatus, TransactionType, UserBalance};

/// Bounded retry count for optimistic-concurrency conflicts
pub const MAX_BALANCE_RETRIES: usize = 3;

/// One requested balance mutation
#[derive(Debug, Clone)]
pub struct BalanceUpdate {
    pub user_id: String,
    pub amount: f64,
    pub tx_type: TransactionType,
    pub related_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Raw balance fields, used by the reconciler to overwrite a drifted row
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceSnapshot {
    pub available_tokens: f64,
    pub committed_tokens: f64,
    pub total_earned: f64,
    pub total_spent: f64,
}

impl BalanceSnapshot {
    pub fn is_zero(&self) -> bool {
        self.available_tokens == 0.0
            && self.committed_tokens == 0.0
            && self.total_earned == 0.0
            && self.total_spent == 0.0
    }
}

/// SQLite-backed balance ledger
pub struct BalanceLedger {
    conn: Arc<Mutex<Connection>>,
}

impl BalanceLedger {
    /// Open the ledger database and initialize its schema
    pub fn new(db_path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path).context("open ledger db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        // Other stores hold their own connections to this file; wait out
        // their write locks instead of surfacing SQLITE_BUSY.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS user_balances (
                user_id TEXT PRIMARY KEY,
                available_tokens REAL NOT NULL DEFAULT 0.0,
                committed_tokens REAL NOT NULL DEFAULT 0.0,
                total_earned REAL NOT NULL DEFAULT 0.0,
                total_spent REAL NOT NULL DEFAULT 0.0,
                version INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS token_transactions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                tx_type TEXT NOT NULL,
                amount REAL NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                related_id TEXT,
                metadata TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tx_user ON token_transactions(user_id, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tx_related ON token_transactions(related_id)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Current stored balance, or `None` if the user has no ledger row yet
    pub async fn get_balance(&self, user_id: &str) -> SettlementResult<Option<UserBalance>> {
        let conn = self.conn.lock().await;
        let balance = conn
            .query_row(
                "SELECT user_id, available_tokens, committed_tokens, total_earned, total_spent,
                        version, updated_at
                 FROM user_balances WHERE user_id = ?1",
                [user_id],
                map_balance_row,
            )
            .optional()?;
        Ok(balance)
    }

    /// Apply one mutation with an explicit version expectation.
    ///
    /// `expected_version = None` means "no row exists yet" (insert path).
    /// A mismatch between the expectation and the stored row fails with
    /// `ConcurrentModification` without touching anything.
    pub async fn update_balance_with_version(
        &self,
        update: &BalanceUpdate,
        expected_version: Option<i64>,
    ) -> SettlementResult<UserBalance> {
        if !update.amount.is_finite() || update.amount < 0.0 {
            return Err(SettlementError::InvalidInput(format!(
                "transaction amount must be a non-negative number, got {}",
                update.amount
            )));
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(anyhow::Error::new)?;

        let current: Option<UserBalance> = tx
            .query_row(
                "SELECT user_id, available_tokens, committed_tokens, total_earned, total_spent,
                        version, updated_at
                 FROM user_balances WHERE user_id = ?1",
                [&update.user_id],
                map_balance_row,
            )
            .optional()?;

        // The expectation is checked against what the transaction sees, so a
        // writer that raced ahead of our read loses nothing and we retry.
        let stored_version = current.as_ref().map(|b| b.version);
        if stored_version != expected_version {
            return Err(SettlementError::ConcurrentModification {
                user_id: update.user_id.clone(),
                expected_version: expected_version.unwrap_or(0),
            });
        }

        let new_balance = apply_mutation(current.as_ref(), update)?;
        let now = new_balance.updated_at.to_rfc3339();

        match expected_version {
            None => {
                tx.execute(
                    "INSERT INTO user_balances
                     (user_id, available_tokens, committed_tokens, total_earned, total_spent,
                      version, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        new_balance.user_id,
                        new_balance.available_tokens,
                        new_balance.committed_tokens,
                        new_balance.total_earned,
                        new_balance.total_spent,
                        new_balance.version,
                        now,
                    ],
                )?;
            }
            Some(version) => {
                let affected = tx.execute(
                    "UPDATE user_balances
                     SET available_tokens = ?1, committed_tokens = ?2, total_earned = ?3,
                         total_spent = ?4, version = version + 1, updated_at = ?5
                     WHERE user_id = ?6 AND version = ?7",
                    params![
                        new_balance.available_tokens,
                        new_balance.committed_tokens,
                        new_balance.total_earned,
                        new_balance.total_spent,
                        now,
                        new_balance.user_id,
                        version,
                    ],
                )?;
                if affected == 0 {
                    return Err(SettlementError::ConcurrentModification {
                        user_id: update.user_id.clone(),
                        expected_version: version,
                    });
                }
            }
        }

        let record = TokenTransaction {
            id: Uuid::new_v4().to_string(),
            user_id: update.user_id.clone(),
            tx_type: update.tx_type,
            amount: update.amount,
            status: TransactionStatus::Completed,
            created_at: new_balance.updated_at,
            related_id: update.related_id.clone(),
            metadata: update
                .metadata
                .as_ref()
                .map(|m| m.to_string()),
        };
        insert_transaction(&tx, &record)?;

        tx.commit().map_err(anyhow::Error::new)?;

        debug!(
            user_id = %new_balance.user_id,
            tx_type = update.tx_type.as_str(),
            amount = update.amount,
            version = new_balance.version,
            "💰 Balance updated"
        );
        Ok(new_balance)
    }

    /// Apply one mutation, re-reading and retrying a bounded number of times
    /// on version conflicts.
    pub async fn update_balance_atomic(
        &self,
        update: BalanceUpdate,
    ) -> SettlementResult<UserBalance> {
        let mut last_err = None;
        for attempt in 0..MAX_BALANCE_RETRIES {
            let expected = self
                .get_balance(&update.user_id)
                .await?
                .map(|b| b.version);
            match self.update_balance_with_version(&update, expected).await {
                Err(SettlementError::ConcurrentModification {
                    user_id,
                    expected_version,
                }) => {
                    warn!(
                        user_id = %user_id,
                        expected_version,
                        attempt = attempt + 1,
                        "Version conflict, retrying balance update"
                    );
                    last_err = Some(SettlementError::ConcurrentModification {
                        user_id,
                        expected_version,
                    });
                }
                other => return other,
            }
        }
        Err(last_err.expect("retry loop ran at least once"))
    }

    /// Apply the inverse of a previously recorded transaction. Writes a
    /// compensating `rolled_back` record linking the original.
    pub async fn rollback_transaction(&self, tx_id: &str) -> SettlementResult<UserBalance> {
        let original = self
            .get_transaction(tx_id)
            .await?
            .ok_or_else(|| SettlementError::InvalidInput(format!("transaction {} not found", tx_id)))?;
        if original.status != TransactionStatus::Completed {
            return Err(SettlementError::InvalidState(format!(
                "transaction {} is {}, only completed transactions can be rolled back",
                tx_id,
                original.status.as_str()
            )));
        }

        let mut last_err = None;
        for _ in 0..MAX_BALANCE_RETRIES {
            match self.try_rollback(&original).await {
                Err(SettlementError::ConcurrentModification {
                    user_id,
                    expected_version,
                }) => {
                    last_err = Some(SettlementError::ConcurrentModification {
                        user_id,
                        expected_version,
                    });
                }
                other => return other,
            }
        }
        Err(last_err.expect("retry loop ran at least once"))
    }

    async fn try_rollback(&self, original: &TokenTransaction) -> SettlementResult<UserBalance> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(anyhow::Error::new)?;

        let current: Option<UserBalance> = tx
            .query_row(
                "SELECT user_id, available_tokens, committed_tokens, total_earned, total_spent,
                        version, updated_at
                 FROM user_balances WHERE user_id = ?1",
                [&original.user_id],
                map_balance_row,
            )
            .optional()?;
        let current = current.ok_or_else(|| {
            SettlementError::InvalidState(format!(
                "no balance row for {} to roll back against",
                original.user_id
            ))
        })?;

        let new_balance = apply_inverse(&current, original);
        let now = new_balance.updated_at.to_rfc3339();

        let affected = tx.execute(
            "UPDATE user_balances
             SET available_tokens = ?1, committed_tokens = ?2, total_earned = ?3,
                 total_spent = ?4, version = version + 1, updated_at = ?5
             WHERE user_id = ?6 AND version = ?7",
            params![
                new_balance.available_tokens,
                new_balance.committed_tokens,
                new_balance.total_earned,
                new_balance.total_spent,
                now,
                new_balance.user_id,
                current.version,
            ],
        )?;
        if affected == 0 {
            return Err(SettlementError::ConcurrentModification {
                user_id: original.user_id.clone(),
                expected_version: current.version,
            });
        }

        let compensating = TokenTransaction {
            id: Uuid::new_v4().to_string(),
            user_id: original.user_id.clone(),
            tx_type: original.tx_type,
            amount: original.amount,
            status: TransactionStatus::RolledBack,
            created_at: new_balance.updated_at,
            related_id: original.related_id.clone(),
            metadata: Some(
                serde_json::json!({ "rollback_of": original.id }).to_string(),
            ),
        };
        insert_transaction(&tx, &compensating)?;

        tx.commit().map_err(anyhow::Error::new)?;

        warn!(
            user_id = %original.user_id,
            tx_id = %original.id,
            tx_type = original.tx_type.as_str(),
            amount = original.amount,
            "↩️ Transaction rolled back"
        );
        Ok(new_balance)
    }

    /// Overwrite a stored balance with externally recomputed fields,
    /// bumping the version. Used by the reconciler's fix path.
    pub async fn overwrite_balance(
        &self,
        user_id: &str,
        snapshot: BalanceSnapshot,
    ) -> SettlementResult<UserBalance> {
        let conn = self.conn.lock().await;
        let now = Utc::now();

        let existing_version: Option<i64> = conn
            .query_row(
                "SELECT version FROM user_balances WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )
            .optional()?;

        let version = match existing_version {
            Some(v) => {
                conn.execute(
                    "UPDATE user_balances
                     SET available_tokens = ?1, committed_tokens = ?2, total_earned = ?3,
                         total_spent = ?4, version = version + 1, updated_at = ?5
                     WHERE user_id = ?6",
                    params![
                        snapshot.available_tokens,
                        snapshot.committed_tokens,
                        snapshot.total_earned,
                        snapshot.total_spent,
                        now.to_rfc3339(),
                        user_id,
                    ],
                )?;
                v + 1
            }
            None => {
                conn.execute(
                    "INSERT INTO user_balances
                     (user_id, available_tokens, committed_tokens, total_earned, total_spent,
                      version, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6)",
                    params![
                        user_id,
                        snapshot.available_tokens,
                        snapshot.committed_tokens,
                        snapshot.total_earned,
                        snapshot.total_spent,
                        now.to_rfc3339(),
                    ],
                )?;
                1
            }
        };

        Ok(UserBalance {
            user_id: user_id.to_string(),
            available_tokens: snapshot.available_tokens,
            committed_tokens: snapshot.committed_tokens,
            total_earned: snapshot.total_earned,
            total_spent: snapshot.total_spent,
            version,
            updated_at: now,
        })
    }

    pub async fn get_transaction(&self, tx_id: &str) -> SettlementResult<Option<TokenTransaction>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT id, user_id, tx_type, amount, status, created_at, related_id, metadata
                 FROM token_transactions WHERE id = ?1",
                [tx_id],
                map_tx_row,
            )
            .optional()?;
        Ok(record)
    }

    /// All completed transactions for a user, oldest first. This is the
    /// replay input for reconciliation.
    pub async fn completed_transactions(
        &self,
        user_id: &str,
    ) -> SettlementResult<Vec<TokenTransaction>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, tx_type, amount, status, created_at, related_id, metadata
             FROM token_transactions
             WHERE user_id = ?1 AND status = 'completed'
             ORDER BY created_at ASC, id ASC",
        )?;
        let records = stmt
            .query_map([user_id], map_tx_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// All transactions for a user regardless of status, oldest first
    pub async fn transactions_for_user(
        &self,
        user_id: &str,
    ) -> SettlementResult<Vec<TokenTransaction>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, tx_type, amount, status, created_at, related_id, metadata
             FROM token_transactions
             WHERE user_id = ?1
             ORDER BY created_at ASC, id ASC",
        )?;
        let records = stmt
            .query_map([user_id], map_tx_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Every user known to the ledger, via either a balance row or a
    /// transaction record
    pub async fn all_user_ids(&self) -> SettlementResult<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT user_id FROM user_balances
             UNION
             SELECT DISTINCT user_id FROM token_transactions
             ORDER BY user_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(ids)
    }
}

/// Pure mutation semantics by transaction type. Fields clamp at zero as a
/// defensive floor.
fn apply_mutation(
    current: Option<&UserBalance>,
    update: &BalanceUpdate,
) -> SettlementResult<UserBalance> {
    let base = current
        .cloned()
        .unwrap_or_else(|| UserBalance::empty(&update.user_id));
    let amount = update.amount;

    let mut next = base.clone();
    match update.tx_type {
        TransactionType::Purchase | TransactionType::Win => {
            next.available_tokens += amount;
            next.total_earned += amount;
        }
        TransactionType::Refund => {
            next.available_tokens += amount;
        }
        TransactionType::Loss => {
            next.total_spent += amount;
        }
        TransactionType::Commit => {
            if base.available_tokens < amount {
                return Err(SettlementError::InsufficientFunds {
                    user_id: update.user_id.to_string(),
                    available: base.available_tokens,
                    requested: amount,
                });
            }
            next.available_tokens -= amount;
            next.committed_tokens += amount;
        }
    }

    next.available_tokens = next.available_tokens.max(0.0);
    next.committed_tokens = next.committed_tokens.max(0.0);
    next.total_earned = next.total_earned.max(0.0);
    next.total_spent = next.total_spent.max(0.0);
    next.version = base.version + 1;
    next.updated_at = Utc::now();
    Ok(next)
}

/// Inverse of `apply_mutation` for a recorded transaction
fn apply_inverse(current: &UserBalance, original: &TokenTransaction) -> UserBalance {
    let amount = original.amount;
    let mut next = current.clone();
    match original.tx_type {
        TransactionType::Purchase | TransactionType::Win => {
            next.available_tokens -= amount;
            next.total_earned -= amount;
        }
        TransactionType::Refund => {
            next.available_tokens -= amount;
        }
        TransactionType::Loss => {
            next.total_spent -= amount;
        }
        TransactionType::Commit => {
            next.available_tokens += amount;
            next.committed_tokens -= amount;
        }
    }

    next.available_tokens = next.available_tokens.max(0.0);
    next.committed_tokens = next.committed_tokens.max(0.0);
    next.total_earned = next.total_earned.max(0.0);
    next.total_spent = next.total_spent.max(0.0);
    next.version = current.version + 1;
    next.updated_at = Utc::now();
    next
}

fn insert_transaction(tx: &rusqlite::Transaction<'_>, record: &TokenTransaction) -> SettlementResult<()> {
    tx.execute(
        "INSERT INTO token_transactions
         (id, user_id, tx_type, amount, status, created_at, related_id, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record.id,
            record.user_id,
            record.tx_type.as_str(),
            record.amount,
            record.status.as_str(),
            record.created_at.to_rfc3339(),
            record.related_id,
            record.metadata,
        ],
    )?;
    Ok(())
}

fn map_balance_row(row: &Row<'_>) -> rusqlite::Result<UserBalance> {
    Ok(UserBalance {
        user_id: row.get(0)?,
        available_tokens: row.get(1)?,
        committed_tokens: row.get(2)?,
        total_earned: row.get(3)?,
        total_spent: row.get(4)?,
        version: row.get(5)?,
        updated_at: parse_ts(row.get::<_, String>(6)?),
    })
}

fn map_tx_row(row: &Row<'_>) -> rusqlite::Result<TokenTransaction> {
    let tx_type: String = row.get(2)?;
    let status: String = row.get(4)?;
    Ok(TokenTransaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        tx_type: TransactionType::parse(&tx_type).unwrap_or(TransactionType::Purchase),
        amount: row.get(3)?,
        status: TransactionStatus::parse(&status).unwrap_or(TransactionStatus::Completed),
        created_at: parse_ts(row.get::<_, String>(5)?),
        related_id: row.get(6)?,
        metadata: row.get(7)?,
    })
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
