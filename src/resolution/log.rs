//! Resolution Audit Log
//!
//! Append-only record of every resolution step, including failures. The
//! query surface is how external dashboards learn of settlement activity.

use anyhow::Context;
use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, Connection, Row};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::SettlementResult;
use crate::models::{ResolutionAction, ResolutionLogEntry};

/// Filter for audit log queries; all fields are optional and combine as AND
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub market_id: Option<String>,
    pub admin_id: Option<String>,
    pub action: Option<ResolutionAction>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

pub struct ResolutionLogStore {
    conn: Arc<Mutex<Connection>>,
}

impl ResolutionLogStore {
    pub fn new(db_path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path).context("open resolution log db")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS resolution_log (
                id TEXT PRIMARY KEY,
                market_id TEXT NOT NULL,
                admin_id TEXT NOT NULL,
                action TEXT NOT NULL,
                created_at TEXT NOT NULL,
                details TEXT,
                error TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_resolution_log_market
             ON resolution_log(market_id, created_at)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_resolution_log_action
             ON resolution_log(action, created_at)",
            [],
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append one audit entry; entries are never mutated afterwards
    pub async fn append(
        &self,
        market_id: &str,
        admin_id: &str,
        action: ResolutionAction,
        details: Option<serde_json::Value>,
        error: Option<&str>,
    ) -> SettlementResult<ResolutionLogEntry> {
        let entry = ResolutionLogEntry {
            id: Uuid::new_v4().to_string(),
            market_id: market_id.to_string(),
            admin_id: admin_id.to_string(),
            action,
            created_at: Utc::now(),
            details: details.map(|d| d.to_string()),
            error: error.map(|e| e.to_string()),
        };

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO resolution_log (id, market_id, admin_id, action, created_at, details, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                entry.id,
                entry.market_id,
                entry.admin_id,
                entry.action.as_str(),
                entry.created_at.to_rfc3339(),
                entry.details,
                entry.error,
            ],
        )?;
        Ok(entry)
    }

    /// Query the log with optional filters, newest entries last
    pub async fn query(&self, filter: &LogQuery) -> SettlementResult<Vec<ResolutionLogEntry>> {
        let mut sql = String::from(
            "SELECT id, market_id, admin_id, action, created_at, details, error
             FROM resolution_log WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();

        if let Some(market_id) = &filter.market_id {
            sql.push_str(&format!(" AND market_id = ?{}", args.len() + 1));
            args.push(market_id.clone());
        }
        if let Some(admin_id) = &filter.admin_id {
            sql.push_str(&format!(" AND admin_id = ?{}", args.len() + 1));
            args.push(admin_id.clone());
        }
        if let Some(action) = &filter.action {
            sql.push_str(&format!(" AND action = ?{}", args.len() + 1));
            args.push(action.as_str().to_string());
        }
        if let Some(since) = &filter.since {
            sql.push_str(&format!(" AND created_at >= ?{}", args.len() + 1));
            args.push(since.to_rfc3339());
        }
        if let Some(until) = &filter.until {
            sql.push_str(&format!(" AND created_at <= ?{}", args.len() + 1));
            args.push(until.to_rfc3339());
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {}", limit.min(1000)));
        }

        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_from_iter(args.iter()), map_log_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Convenience accessor for a single market's full trail
    pub async fn entries_for_market(
        &self,
        market_id: &str,
    ) -> SettlementResult<Vec<ResolutionLogEntry>> {
        self.query(&LogQuery {
            market_id: Some(market_id.to_string()),
            ..Default::default()
        })
        .await
    }
}

fn map_log_row(row: &Row<'_>) -> rusqlite::Result<ResolutionLogEntry> {
    let action: String = row.get(3)?;
    Ok(ResolutionLogEntry {
        id: row.get(0)?,
        market_id: row.get(1)?,
        admin_id: row.get(2)?,
        action: ResolutionAction::parse(&action).unwrap_or(ResolutionAction::ResolutionFailed),
        created_at: DateTime::parse_from_rfc3339(&row.get::<_, String>(4)?)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        details: row.get(5)?,
        error: row.get(6)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn create_test_log() -> (ResolutionLogStore, NamedTempFile) {
        let temp_file = NamedTempFile::new().unwrap();
        let log = ResolutionLogStore::new(temp_file.path().to_str().unwrap()).unwrap();
        (log, temp_file)
    }

    #[tokio::test]
    async fn test_append_and_query_by_market() {
        let (log, _temp) = create_test_log();
        log.append("m1", "admin", ResolutionAction::ResolutionStarted, None, None)
            .await
            .unwrap();
        log.append("m1", "admin", ResolutionAction::EvidenceValidated, None, None)
            .await
            .unwrap();
        log.append("m2", "admin", ResolutionAction::ResolutionStarted, None, None)
            .await
            .unwrap();

        let entries = log.entries_for_market("m1").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, ResolutionAction::ResolutionStarted);
        assert_eq!(entries[1].action, ResolutionAction::EvidenceValidated);
    }

    #[tokio::test]
    async fn test_query_by_action_and_admin() {
        let (log, _temp) = create_test_log();
        log.append("m1", "alice", ResolutionAction::ResolutionFailed, None, Some("boom"))
            .await
            .unwrap();
        log.append("m1", "bob", ResolutionAction::ResolutionFailed, None, Some("bust"))
            .await
            .unwrap();

        let entries = log
            .query(&LogQuery {
                admin_id: Some("alice".to_string()),
                action: Some(ResolutionAction::ResolutionFailed),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_details_round_trip() {
        let (log, _temp) = create_test_log();
        log.append(
            "m1",
            "admin",
            ResolutionAction::PayoutsCalculated,
            Some(serde_json::json!({ "winner_pool": 930.0 })),
            None,
        )
        .await
        .unwrap();

        let entries = log.entries_for_market("m1").await.unwrap();
        let details: serde_json::Value =
            serde_json::from_str(entries[0].details.as_ref().unwrap()).unwrap();
        assert_eq!(details["winner_pool"], 930.0);
    }
}
