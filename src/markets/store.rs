use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::{SettlementError, SettlementResult};
use crate::models::{
    CommitmentStatus, Market, MarketOption, MarketStatus, PredictionCommitment,
};

/// Market creation payload
#[derive(Debug, Clone)]
pub struct NewMarket {
    pub title: String,
    pub creator_id: String,
    pub options: Vec<NewMarketOption>,
}

#[derive(Debug, Clone)]
pub struct NewMarketOption {
    pub option_id: String,
    pub label: String,
}

/// Commitment creation payload; `potential_winning` is derived from odds
#[derive(Debug, Clone)]
pub struct NewCommitment {
    pub user_id: String,
    pub market_id: String,
    pub option_id: String,
    pub tokens_committed: f64,
    pub odds: f64,
}

/// Persisted payout record, the durable source of truth for a resolution
#[derive(Debug, Clone)]
pub struct PayoutRecord {
    pub resolution_id: String,
    pub market_id: String,
    pub winning_option_id: String,
    pub result_json: String,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed market and commitment store
pub struct MarketStore {
    conn: Arc<Mutex<Connection>>,
}

impl MarketStore {
    pub fn new(db_path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path).context("open market db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS markets (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                creator_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS market_options (
                market_id TEXT NOT NULL,
                option_id TEXT NOT NULL,
                label TEXT NOT NULL,
                ord INTEGER NOT NULL,
                PRIMARY KEY (market_id, option_id),
                FOREIGN KEY (market_id) REFERENCES markets(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS commitments (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                market_id TEXT NOT NULL,
                option_id TEXT NOT NULL,
                tokens_committed REAL NOT NULL,
                odds REAL NOT NULL,
                potential_winning REAL NOT NULL,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                FOREIGN KEY (market_id) REFERENCES markets(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_commitments_market ON commitments(market_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_commitments_user ON commitments(user_id, status)",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS payout_records (
                resolution_id TEXT PRIMARY KEY,
                market_id TEXT NOT NULL,
                winning_option_id TEXT NOT NULL,
                result_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (market_id) REFERENCES markets(id)
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_payout_market ON payout_records(market_id)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn create_market(&self, market: &NewMarket) -> SettlementResult<Market> {
        if market.options.len() < 2 {
            return Err(SettlementError::InvalidInput(
                "a market needs at least two options".to_string(),
            ));
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(anyhow::Error::new)?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        tx.execute(
            "INSERT INTO markets (id, title, creator_id, status, created_at)
             VALUES (?1, ?2, ?3, 'active', ?4)",
            params![id, market.title, market.creator_id, now.to_rfc3339()],
        )?;
        for (ord, option) in market.options.iter().enumerate() {
            tx.execute(
                "INSERT INTO market_options (market_id, option_id, label, ord)
                 VALUES (?1, ?2, ?3, ?4)",
                params![id, option.option_id, option.label, ord as i64],
            )?;
        }
        tx.commit().map_err(anyhow::Error::new)?;

        Ok(Market {
            id,
            title: market.title.clone(),
            creator_id: market.creator_id.clone(),
            status: MarketStatus::Active,
            options: market
                .options
                .iter()
                .map(|o| MarketOption {
                    option_id: o.option_id.clone(),
                    label: o.label.clone(),
                    total_tokens: 0.0,
                    participant_count: 0,
                })
                .collect(),
            total_tokens_staked: 0.0,
            total_participants: 0,
            created_at: now,
        })
    }

    /// Load a market with option aggregates recomputed from the commitment
    /// set. Refunded commitments do not count toward the pool.
    pub async fn get_market(&self, market_id: &str) -> SettlementResult<Option<Market>> {
        let conn = self.conn.lock().await;

        let header: Option<(String, String, String, String, String)> = conn
            .query_row(
                "SELECT id, title, creator_id, status, created_at FROM markets WHERE id = ?1",
                [market_id],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, title, creator_id, status, created_at)) = header else {
            return Ok(None);
        };

        let mut stmt = conn.prepare(
            "SELECT option_id, label FROM market_options WHERE market_id = ?1 ORDER BY ord",
        )?;
        let mut options = stmt
            .query_map([market_id], |row| {
                Ok(MarketOption {
                    option_id: row.get(0)?,
                    label: row.get(1)?,
                    total_tokens: 0.0,
                    participant_count: 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut agg_stmt = conn.prepare(
            "SELECT option_id, SUM(tokens_committed), COUNT(DISTINCT user_id)
             FROM commitments
             WHERE market_id = ?1 AND status != 'refunded'
             GROUP BY option_id",
        )?;
        let aggregates: HashMap<String, (f64, i64)> = agg_stmt
            .query_map([market_id], |row| {
                Ok((row.get::<_, String>(0)?, (row.get(1)?, row.get(2)?)))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;

        let mut total_tokens_staked = 0.0;
        for option in &mut options {
            if let Some((tokens, participants)) = aggregates.get(&option.option_id) {
                option.total_tokens = *tokens;
                option.participant_count = *participants;
                total_tokens_staked += *tokens;
            }
        }

        let total_participants: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT user_id) FROM commitments
             WHERE market_id = ?1 AND status != 'refunded'",
            [market_id],
            |row| row.get(0),
        )?;

        Ok(Some(Market {
            id,
            title,
            creator_id,
            status: MarketStatus::parse(&status).unwrap_or(MarketStatus::Active),
            options,
            total_tokens_staked,
            total_participants,
            created_at: parse_ts(created_at),
        }))
    }

    /// Record a stake. The caller is responsible for the matching ledger
    /// commit; this only persists the commitment row.
    pub async fn insert_commitment(
        &self,
        commitment: &NewCommitment,
    ) -> SettlementResult<PredictionCommitment> {
        if !commitment.tokens_committed.is_finite() || commitment.tokens_committed <= 0.0 {
            return Err(SettlementError::InvalidInput(format!(
                "tokens committed must be positive, got {}",
                commitment.tokens_committed
            )));
        }

        let conn = self.conn.lock().await;

        let market_status: Option<String> = conn
            .query_row(
                "SELECT status FROM markets WHERE id = ?1",
                [&commitment.market_id],
                |row| row.get(0),
            )
            .optional()?;
        let market_status = market_status
            .ok_or_else(|| SettlementError::MarketNotFound(commitment.market_id.clone()))?;
        if MarketStatus::parse(&market_status) != Some(MarketStatus::Active) {
            return Err(SettlementError::InvalidState(format!(
                "market {} is {}, stakes are only accepted while active",
                commitment.market_id, market_status
            )));
        }

        let option_exists: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM market_options WHERE market_id = ?1 AND option_id = ?2",
                params![commitment.market_id, commitment.option_id],
                |row| row.get(0),
            )
            .optional()?;
        if option_exists.is_none() {
            return Err(SettlementError::InvalidInput(format!(
                "option {} does not exist on market {}",
                commitment.option_id, commitment.market_id
            )));
        }

        let record = PredictionCommitment {
            id: Uuid::new_v4().to_string(),
            user_id: commitment.user_id.clone(),
            market_id: commitment.market_id.clone(),
            option_id: commitment.option_id.clone(),
            tokens_committed: commitment.tokens_committed,
            odds: commitment.odds,
            potential_winning: commitment.tokens_committed * commitment.odds,
            status: CommitmentStatus::Active,
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO commitments
             (id, user_id, market_id, option_id, tokens_committed, odds, potential_winning,
              status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.user_id,
                record.market_id,
                record.option_id,
                record.tokens_committed,
                record.odds,
                record.potential_winning,
                record.status.as_str(),
                record.created_at.to_rfc3339(),
            ],
        )?;
        Ok(record)
    }

    pub async fn commitments_for_market(
        &self,
        market_id: &str,
    ) -> SettlementResult<Vec<PredictionCommitment>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, market_id, option_id, tokens_committed, odds,
                    potential_winning, status, created_at
             FROM commitments WHERE market_id = ?1 ORDER BY created_at ASC, id ASC",
        )?;
        let commitments = stmt
            .query_map([market_id], map_commitment_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(commitments)
    }

    /// Currently-active stakes for a user; the reconciler's committed-token
    /// source of truth
    pub async fn active_commitments_for_user(
        &self,
        user_id: &str,
    ) -> SettlementResult<Vec<PredictionCommitment>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, market_id, option_id, tokens_committed, odds,
                    potential_winning, status, created_at
             FROM commitments
             WHERE user_id = ?1 AND status = 'active'
             ORDER BY created_at ASC, id ASC",
        )?;
        let commitments = stmt
            .query_map([user_id], map_commitment_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(commitments)
    }

    /// The single durable write of a resolution: payout record, commitment
    /// status flips, and the market status transition commit together or
    /// not at all. The conditional market update is the guard that stops a
    /// second resolution attempt from ever reaching this point twice.
    pub async fn apply_resolution(
        &self,
        market_id: &str,
        resolution_id: &str,
        winning_option_id: &str,
        result_json: &str,
        winner_commitment_ids: &[String],
        loser_commitment_ids: &[String],
    ) -> SettlementResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(anyhow::Error::new)?;

        let affected = tx.execute(
            "UPDATE markets SET status = 'resolved'
             WHERE id = ?1 AND status IN ('active', 'pending_resolution')",
            [market_id],
        )?;
        if affected == 0 {
            return Err(SettlementError::InvalidState(format!(
                "market {} is no longer resolvable",
                market_id
            )));
        }

        for id in winner_commitment_ids {
            tx.execute(
                "UPDATE commitments SET status = 'won' WHERE id = ?1 AND status = 'active'",
                [id],
            )?;
        }
        for id in loser_commitment_ids {
            tx.execute(
                "UPDATE commitments SET status = 'lost' WHERE id = ?1 AND status = 'active'",
                [id],
            )?;
        }

        tx.execute(
            "INSERT INTO payout_records
             (resolution_id, market_id, winning_option_id, result_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                resolution_id,
                market_id,
                winning_option_id,
                result_json,
                Utc::now().to_rfc3339(),
            ],
        )?;

        tx.commit().map_err(anyhow::Error::new)?;
        Ok(())
    }

    /// Inverse of `apply_resolution`: commitment statuses return to active,
    /// the payout record is removed, and the market goes back to
    /// pending_resolution, all in one transaction.
    pub async fn revert_resolution(
        &self,
        market_id: &str,
        resolution_id: &str,
    ) -> SettlementResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(anyhow::Error::new)?;

        let removed = tx.execute(
            "DELETE FROM payout_records WHERE resolution_id = ?1 AND market_id = ?2",
            params![resolution_id, market_id],
        )?;
        if removed == 0 {
            return Err(SettlementError::InvalidState(format!(
                "no payout record {} for market {}",
                resolution_id, market_id
            )));
        }

        tx.execute(
            "UPDATE commitments SET status = 'active'
             WHERE market_id = ?1 AND status IN ('won', 'lost')",
            [market_id],
        )?;
        tx.execute(
            "UPDATE markets SET status = 'pending_resolution' WHERE id = ?1",
            [market_id],
        )?;

        tx.commit().map_err(anyhow::Error::new)?;
        Ok(())
    }

    pub async fn get_payout_record(
        &self,
        resolution_id: &str,
    ) -> SettlementResult<Option<PayoutRecord>> {
        let conn = self.conn.lock().await;
        let record = conn
            .query_row(
                "SELECT resolution_id, market_id, winning_option_id, result_json, created_at
                 FROM payout_records WHERE resolution_id = ?1",
                [resolution_id],
                map_payout_row,
            )
            .optional()?;
        Ok(record)
    }
}

fn map_commitment_row(row: &Row<'_>) -> rusqlite::Result<PredictionCommitment> {
    let status: String = row.get(7)?;
    Ok(PredictionCommitment {
        id: row.get(0)?,
        user_id: row.get(1)?,
        market_id: row.get(2)?,
        option_id: row.get(3)?,
        tokens_committed: row.get(4)?,
        odds: row.get(5)?,
        potential_winning: row.get(6)?,
        status: CommitmentStatus::parse(&status).unwrap_or(CommitmentStatus::Active),
        created_at: parse_ts(row.get::<_, String>(8)?),
    })
}

fn map_payout_row(row: &Row<'_>) -> rusqlite::Result<PayoutRecord> {
    Ok(PayoutRecord {
        resolution_id: row.get(0)?,
        market_id: row.get(1)?,
        winning_option_id: row.get(2)?,
        result_json: row.get(3)?,
        created_at: parse_ts(row.get::<_, String>(4)?),
    })
}

fn parse_ts(raw: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
