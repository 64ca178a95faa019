use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rounding tolerance for fractional token amounts
pub const BALANCE_EPSILON: f64 = 0.01;

/// Token transaction types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Purchase,
    Commit,
    Win,
    Loss,
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &str {
        match self {
            TransactionType::Purchase => "purchase",
            TransactionType::Commit => "commit",
            TransactionType::Win => "win",
            TransactionType::Loss => "loss",
            TransactionType::Refund => "refund",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "purchase" => Some(TransactionType::Purchase),
            "commit" => Some(TransactionType::Commit),
            "win" => Some(TransactionType::Win),
            "loss" => Some(TransactionType::Loss),
            "refund" => Some(TransactionType::Refund),
            _ => None,
        }
    }
}

/// Token transaction lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    RolledBack,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Completed => "completed",
            TransactionStatus::Failed => "failed",
            TransactionStatus::RolledBack => "rolled_back",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "completed" => Some(TransactionStatus::Completed),
            "failed" => Some(TransactionStatus::Failed),
            "rolled_back" => Some(TransactionStatus::RolledBack),
            _ => None,
        }
    }
}

/// Prediction commitment status; transitions exactly once at resolution
/// or refund time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitmentStatus {
    Active,
    Won,
    Lost,
    Refunded,
}

impl CommitmentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            CommitmentStatus::Active => "active",
            CommitmentStatus::Won => "won",
            CommitmentStatus::Lost => "lost",
            CommitmentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(CommitmentStatus::Active),
            "won" => Some(CommitmentStatus::Won),
            "lost" => Some(CommitmentStatus::Lost),
            "refunded" => Some(CommitmentStatus::Refunded),
            _ => None,
        }
    }
}

/// Market lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Active,
    PendingResolution,
    Resolved,
}

impl MarketStatus {
    pub fn as_str(&self) -> &str {
        match self {
            MarketStatus::Active => "active",
            MarketStatus::PendingResolution => "pending_resolution",
            MarketStatus::Resolved => "resolved",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(MarketStatus::Active),
            "pending_resolution" => Some(MarketStatus::PendingResolution),
            "resolved" => Some(MarketStatus::Resolved),
            _ => None,
        }
    }

    /// A market can only enter resolution from these states
    pub fn is_resolvable(&self) -> bool {
        matches!(self, MarketStatus::Active | MarketStatus::PendingResolution)
    }
}

/// Audit log actions for the resolution state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionAction {
    ResolutionStarted,
    EvidenceValidated,
    PayoutsCalculated,
    TokensDistributed,
    ResolutionCompleted,
    ResolutionFailed,
    RollbackInitiated,
    RollbackCompleted,
}

impl ResolutionAction {
    pub fn as_str(&self) -> &str {
        match self {
            ResolutionAction::ResolutionStarted => "resolution_started",
            ResolutionAction::EvidenceValidated => "evidence_validated",
            ResolutionAction::PayoutsCalculated => "payouts_calculated",
            ResolutionAction::TokensDistributed => "tokens_distributed",
            ResolutionAction::ResolutionCompleted => "resolution_completed",
            ResolutionAction::ResolutionFailed => "resolution_failed",
            ResolutionAction::RollbackInitiated => "rollback_initiated",
            ResolutionAction::RollbackCompleted => "rollback_completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "resolution_started" => Some(ResolutionAction::ResolutionStarted),
            "evidence_validated" => Some(ResolutionAction::EvidenceValidated),
            "payouts_calculated" => Some(ResolutionAction::PayoutsCalculated),
            "tokens_distributed" => Some(ResolutionAction::TokensDistributed),
            "resolution_completed" => Some(ResolutionAction::ResolutionCompleted),
            "resolution_failed" => Some(ResolutionAction::ResolutionFailed),
            "rollback_initiated" => Some(ResolutionAction::RollbackInitiated),
            "rollback_completed" => Some(ResolutionAction::RollbackCompleted),
            _ => None,
        }
    }
}

/// Per-user token balance. Mutated exclusively by the balance ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBalance {
    pub user_id: String,
    pub available_tokens: f64,
    pub committed_tokens: f64,
    pub total_earned: f64,
    pub total_spent: f64,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

impl UserBalance {
    /// Zeroed balance for a user with no ledger row yet (version 0 means
    /// "not persisted"; the first write stores version 1)
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            available_tokens: 0.0,
            committed_tokens: 0.0,
            total_earned: 0.0,
            total_spent: 0.0,
            version: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Immutable record of one balance mutation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenTransaction {
    pub id: String,
    pub user_id: String,
    pub tx_type: TransactionType,
    /// Always a positive magnitude; direction is implied by `tx_type`
    pub amount: f64,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    /// Links to a market / resolution where applicable
    pub related_id: Option<String>,
    /// Free-form JSON context
    pub metadata: Option<String>,
}

/// Legacy binary position for two-option markets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Position {
    Yes,
    No,
}

impl Position {
    pub fn as_str(&self) -> &str {
        match self {
            Position::Yes => "yes",
            Position::No => "no",
        }
    }
}

/// One user's stake on one market option
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionCommitment {
    pub id: String,
    pub user_id: String,
    pub market_id: String,
    pub option_id: String,
    pub tokens_committed: f64,
    pub odds: f64,
    pub potential_winning: f64,
    pub status: CommitmentStatus,
    pub created_at: DateTime<Utc>,
}

impl PredictionCommitment {
    /// Derived legacy position (never stored); `None` for markets with more
    /// than two options
    pub fn position(&self, market: &Market) -> Option<Position> {
        position_from_option(&self.option_id, market)
    }
}

/// Derive the legacy binary position from an option id. Two-option markets
/// map their first option to `yes` and their second to `no`; anything else
/// has no legacy position.
pub fn position_from_option(option_id: &str, market: &Market) -> Option<Position> {
    if market.options.len() != 2 {
        return None;
    }
    if market.options[0].option_id == option_id {
        Some(Position::Yes)
    } else if market.options[1].option_id == option_id {
        Some(Position::No)
    } else {
        None
    }
}

/// One market option with its aggregates derived from the commitment set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketOption {
    pub option_id: String,
    pub label: String,
    /// Sum of tokens committed to this option (derived on read)
    pub total_tokens: f64,
    /// Distinct users staked on this option (derived on read)
    pub participant_count: i64,
}

/// Market fields relevant to settlement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub id: String,
    pub title: String,
    pub creator_id: String,
    pub status: MarketStatus,
    pub options: Vec<MarketOption>,
    /// Sum of option totals (derived on read)
    pub total_tokens_staked: f64,
    /// Distinct users counted once per market (derived on read)
    pub total_participants: i64,
    pub created_at: DateTime<Utc>,
}

/// Append-only resolution audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionLogEntry {
    pub id: String,
    pub market_id: String,
    pub admin_id: String,
    pub action: ResolutionAction,
    pub created_at: DateTime<Utc>,
    pub details: Option<String>,
    pub error: Option<String>,
}

/// Evidence item submitted with a resolution request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    /// "url" items get URL syntax validation; everything else is free text
    #[serde(rename = "type")]
    pub evidence_type: String,
    pub content: String,
    pub description: Option<String>,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub port: u16,
    /// Concurrency bound for the per-winner payout fan-out
    pub payout_fanout: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./tokenpool.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let payout_fanout = std::env::var("PAYOUT_FANOUT")
            .unwrap_or_else(|_| "8".to_string())
            .parse()
            .unwrap_or(8);

        Ok(Self {
            database_path,
            port,
            payout_fanout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_option_market() -> Market {
        Market {
            id: "m1".to_string(),
            title: "Test market".to_string(),
            creator_id: "creator".to_string(),
            status: MarketStatus::Active,
            options: vec![
                MarketOption {
                    option_id: "opt-yes".to_string(),
                    label: "Yes".to_string(),
                    total_tokens: 0.0,
                    participant_count: 0,
                },
                MarketOption {
                    option_id: "opt-no".to_string(),
                    label: "No".to_string(),
                    total_tokens: 0.0,
                    participant_count: 0,
                },
            ],
            total_tokens_staked: 0.0,
            total_participants: 0,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_position_derivation_two_options() {
        let market = two_option_market();
        assert_eq!(position_from_option("opt-yes", &market), Some(Position::Yes));
        assert_eq!(position_from_option("opt-no", &market), Some(Position::No));
        assert_eq!(position_from_option("opt-other", &market), None);
    }

    #[test]
    fn test_position_derivation_multi_option() {
        let mut market = two_option_market();
        market.options.push(MarketOption {
            option_id: "opt-3".to_string(),
            label: "Third".to_string(),
            total_tokens: 0.0,
            participant_count: 0,
        });
        assert_eq!(position_from_option("opt-yes", &market), None);
    }

    #[test]
    fn test_enum_round_trips() {
        for t in ["purchase", "commit", "win", "loss", "refund"] {
            assert_eq!(TransactionType::parse(t).unwrap().as_str(), t);
        }
        for a in [
            "resolution_started",
            "evidence_validated",
            "payouts_calculated",
            "tokens_distributed",
            "resolution_completed",
            "resolution_failed",
            "rollback_initiated",
            "rollback_completed",
        ] {
            assert_eq!(ResolutionAction::parse(a).unwrap().as_str(), a);
        }
        assert!(MarketStatus::parse("cancelled").is_none());
    }

    #[test]
    fn test_resolvable_states() {
        assert!(MarketStatus::Active.is_resolvable());
        assert!(MarketStatus::PendingResolution.is_resolvable());
        assert!(!MarketStatus::Resolved.is_resolvable());
    }
}
