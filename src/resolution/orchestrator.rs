use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{SettlementError, SettlementResult};
use crate::ledger::{BalanceLedger, BalanceUpdate};
use crate::markets::MarketStore;
use crate::models::{
    CommitmentStatus, EvidenceItem, Market, PredictionCommitment, ResolutionAction,
    TransactionType,
};
use crate::payout::{
    calculate_payout_preview, calculate_payouts, PayoutCalculationResult, PayoutPreview,
    WinningStake,
};
use crate::resolution::evidence::validate_evidence;
use crate::resolution::log::ResolutionLogStore;

/// Admin request to resolve a market
#[derive(Debug, Clone, Deserialize)]
pub struct ResolveRequest {
    pub market_id: String,
    pub winning_option_id: String,
    pub evidence: Vec<EvidenceItem>,
    pub admin_id: String,
    /// Fraction in [0.01, 0.05]; callers holding a percentage convert first
    pub creator_fee_percentage: f64,
}

/// Result surfaced to the admin layer once steps 1-5 have committed
#[derive(Debug, Clone, Serialize)]
pub struct ResolutionOutcome {
    pub success: bool,
    pub resolution_id: String,
    pub market_id: String,
    pub winning_option_id: String,
    pub payout: PayoutCalculationResult,
    /// Recipients whose ledger credit failed; healed by reconciliation
    pub failed_credits: Vec<String>,
}

struct CreditTask {
    user_id: String,
    amount: f64,
    tx_type: TransactionType,
    metadata: serde_json::Value,
}

/// Drives a single market through the resolution state machine
pub struct ResolutionOrchestrator {
    markets: Arc<MarketStore>,
    ledger: Arc<BalanceLedger>,
    log: Arc<ResolutionLogStore>,
    fanout: usize,
}

impl ResolutionOrchestrator {
    pub fn new(
        markets: Arc<MarketStore>,
        ledger: Arc<BalanceLedger>,
        log: Arc<ResolutionLogStore>,
        fanout: usize,
    ) -> Self {
        Self {
            markets,
            ledger,
            log,
            fanout: fanout.max(1),
        }
    }

    /// Resolve a market: validate, compute payouts, settle durably, then
    /// distribute tokens best-effort.
    ///
    /// Steps up to the settlement write abort cleanly on failure (logged as
    /// `resolution_failed`, no token movement). Once the payout record and
    /// commitment statuses have committed, individual ledger failures no
    /// longer fail the resolution.
    pub async fn resolve_market(
        &self,
        request: &ResolveRequest,
    ) -> SettlementResult<ResolutionOutcome> {
        let resolution_id = Uuid::new_v4().to_string();
        info!(
            market_id = %request.market_id,
            admin_id = %request.admin_id,
            resolution_id = %resolution_id,
            "🏁 Resolution started"
        );
        self.log
            .append(
                &request.market_id,
                &request.admin_id,
                ResolutionAction::ResolutionStarted,
                Some(serde_json::json!({
                    "resolution_id": resolution_id,
                    "winning_option_id": request.winning_option_id,
                })),
                None,
            )
            .await?;

        match self.run_settlement(request, &resolution_id).await {
            Ok(outcome) => {
                self.log
                    .append(
                        &request.market_id,
                        &request.admin_id,
                        ResolutionAction::ResolutionCompleted,
                        Some(serde_json::json!({
                            "resolution_id": resolution_id,
                            "winner_count": outcome.payout.winner_count,
                            "winner_pool": outcome.payout.winner_pool,
                        })),
                        None,
                    )
                    .await?;
                info!(
                    market_id = %request.market_id,
                    resolution_id = %resolution_id,
                    winners = outcome.payout.winner_count,
                    "✅ Resolution completed"
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!(
                    market_id = %request.market_id,
                    resolution_id = %resolution_id,
                    error = %err,
                    "❌ Resolution failed"
                );
                self.log
                    .append(
                        &request.market_id,
                        &request.admin_id,
                        ResolutionAction::ResolutionFailed,
                        Some(serde_json::json!({ "resolution_id": resolution_id })),
                        Some(&err.to_string()),
                    )
                    .await?;
                Err(err)
            }
        }
    }

    async fn run_settlement(
        &self,
        request: &ResolveRequest,
        resolution_id: &str,
    ) -> SettlementResult<ResolutionOutcome> {
        // Step 1: load and check preconditions
        let market = self
            .markets
            .get_market(&request.market_id)
            .await?
            .ok_or_else(|| SettlementError::MarketNotFound(request.market_id.clone()))?;
        if !market.status.is_resolvable() {
            return Err(SettlementError::InvalidState(format!(
                "market {} is {}, not resolvable",
                market.id,
                market.status.as_str()
            )));
        }

        // Step 2: evidence, before any token movement
        validate_evidence(&request.evidence)?;
        self.log
            .append(
                &request.market_id,
                &request.admin_id,
                ResolutionAction::EvidenceValidated,
                Some(serde_json::json!({
                    "resolution_id": resolution_id,
                    "evidence_count": request.evidence.len(),
                })),
                None,
            )
            .await?;

        // Step 3: partition commitments into winners and losers
        let winning_option_id = resolve_option_id(&market, &request.winning_option_id)?;
        let commitments = self.markets.commitments_for_market(&market.id).await?;
        let (winners, losers) = partition_commitments(&commitments, &winning_option_id);

        // Step 4: pure payout computation
        let stakes: Vec<WinningStake> = winners
            .iter()
            .map(|c| WinningStake {
                user_id: c.user_id.clone(),
                tokens_committed: c.tokens_committed,
            })
            .collect();
        let payout = calculate_payouts(
            market.total_tokens_staked,
            &stakes,
            request.creator_fee_percentage,
        )?;
        self.log
            .append(
                &request.market_id,
                &request.admin_id,
                ResolutionAction::PayoutsCalculated,
                Some(serde_json::to_value(&payout)?),
                None,
            )
            .await?;

        // Step 5: one durable write for payout record + status flips
        let winner_ids: Vec<String> = winners.iter().map(|c| c.id.clone()).collect();
        let loser_ids: Vec<String> = losers.iter().map(|c| c.id.clone()).collect();
        self.markets
            .apply_resolution(
                &market.id,
                resolution_id,
                &winning_option_id,
                &serde_json::to_string(&payout)?,
                &winner_ids,
                &loser_ids,
            )
            .await?;

        // Step 6: best-effort fan-out; failures are collected, never fatal
        let failed_credits = self
            .distribute_tokens(&market, resolution_id, &payout, &losers, request)
            .await?;

        Ok(ResolutionOutcome {
            success: true,
            resolution_id: resolution_id.to_string(),
            market_id: market.id,
            winning_option_id,
            payout,
            failed_credits,
        })
    }

    /// Credit winners and the creator, and record consumed stakes, as
    /// independent bounded-concurrency ledger calls. Ordering between
    /// recipients is irrelevant; a winner's credit and stake record may
    /// race each other and resolve through the ledger's version retry.
    async fn distribute_tokens(
        &self,
        market: &Market,
        resolution_id: &str,
        payout: &PayoutCalculationResult,
        losers: &[&PredictionCommitment],
        request: &ResolveRequest,
    ) -> SettlementResult<Vec<String>> {
        let mut tasks: Vec<CreditTask> = Vec::new();
        for line in &payout.payouts {
            tasks.push(CreditTask {
                user_id: line.user_id.clone(),
                amount: line.payout_amount,
                tx_type: TransactionType::Win,
                metadata: serde_json::json!({
                    "market_id": market.id,
                    "market_title": market.title,
                    "tokens_staked": line.tokens_staked,
                    "profit": line.profit,
                }),
            });
            // The payout already contains the stake, so the stake itself is
            // consumed. Without this record a history replay would count the
            // win on top of a stake that was never spent.
            tasks.push(CreditTask {
                user_id: line.user_id.clone(),
                amount: line.tokens_staked,
                tx_type: TransactionType::Loss,
                metadata: serde_json::json!({
                    "market_id": market.id,
                    "market_title": market.title,
                    "tokens_staked": line.tokens_staked,
                }),
            });
        }
        tasks.push(CreditTask {
            user_id: market.creator_id.clone(),
            amount: payout.creator_fee,
            tx_type: TransactionType::Win,
            metadata: serde_json::json!({
                "market_id": market.id,
                "market_title": market.title,
                "creator_fee_percentage": request.creator_fee_percentage,
                "role": "creator_fee",
            }),
        });
        for loser in losers {
            tasks.push(CreditTask {
                user_id: loser.user_id.clone(),
                amount: loser.tokens_committed,
                tx_type: TransactionType::Loss,
                metadata: serde_json::json!({
                    "market_id": market.id,
                    "market_title": market.title,
                    "tokens_staked": loser.tokens_committed,
                }),
            });
        }

        let resolution_id = resolution_id.to_string();
        let results: Vec<Result<String, SettlementError>> = stream::iter(tasks)
            .map(|task| {
                let ledger = Arc::clone(&self.ledger);
                let related_id = resolution_id.clone();
                async move {
                    ledger
                        .update_balance_atomic(BalanceUpdate {
                            user_id: task.user_id.clone(),
                            amount: task.amount,
                            tx_type: task.tx_type,
                            related_id: Some(related_id),
                            metadata: Some(task.metadata),
                        })
                        .await
                        .map(|_| task.user_id.clone())
                        .map_err(|err| SettlementError::LedgerApplicationFailed {
                            user_id: task.user_id,
                            reason: err.to_string(),
                        })
                }
            })
            .buffer_unordered(self.fanout)
            .collect()
            .await;

        let mut credited = 0usize;
        let mut failures = Vec::new();
        for result in results {
            match result {
                Ok(_) => credited += 1,
                Err(err) => {
                    warn!(error = %err, "⚠️ Ledger application failed during distribution");
                    failures.push(err.to_string());
                }
            }
        }

        self.log
            .append(
                &market.id,
                &request.admin_id,
                ResolutionAction::TokensDistributed,
                Some(serde_json::json!({
                    "resolution_id": resolution_id,
                    "credited": credited,
                    "failed": failures,
                })),
                if failures.is_empty() {
                    None
                } else {
                    Some("some ledger applications failed; see details")
                },
            )
            .await?;
        Ok(failures)
    }

    /// Undo a committed resolution: commitment statuses return to active,
    /// the payout record is removed, and the market becomes resolvable
    /// again. Ledger credits already applied are left to reconciliation.
    pub async fn rollback_resolution(
        &self,
        market_id: &str,
        resolution_id: &str,
        admin_id: &str,
    ) -> SettlementResult<()> {
        let record = self
            .markets
            .get_payout_record(resolution_id)
            .await?
            .ok_or_else(|| {
                SettlementError::InvalidState(format!(
                    "no payout record for resolution {}",
                    resolution_id
                ))
            })?;
        if record.market_id != market_id {
            return Err(SettlementError::InvalidInput(format!(
                "resolution {} belongs to market {}, not {}",
                resolution_id, record.market_id, market_id
            )));
        }

        self.log
            .append(
                market_id,
                admin_id,
                ResolutionAction::RollbackInitiated,
                Some(serde_json::json!({ "resolution_id": resolution_id })),
                None,
            )
            .await?;

        match self.markets.revert_resolution(market_id, resolution_id).await {
            Ok(()) => {
                self.log
                    .append(
                        market_id,
                        admin_id,
                        ResolutionAction::RollbackCompleted,
                        Some(serde_json::json!({ "resolution_id": resolution_id })),
                        None,
                    )
                    .await?;
                info!(market_id, resolution_id, "↩️ Resolution rolled back");
                Ok(())
            }
            Err(err) => {
                self.log
                    .append(
                        market_id,
                        admin_id,
                        ResolutionAction::ResolutionFailed,
                        Some(serde_json::json!({ "resolution_id": resolution_id })),
                        Some(&err.to_string()),
                    )
                    .await?;
                Err(err)
            }
        }
    }

    /// Read-only payout preview; persists nothing and writes no audit
    /// entries.
    pub async fn payout_preview(
        &self,
        market_id: &str,
        winning_option_id: &str,
        creator_fee_percentage: f64,
    ) -> SettlementResult<PayoutPreview> {
        let market = self
            .markets
            .get_market(market_id)
            .await?
            .ok_or_else(|| SettlementError::MarketNotFound(market_id.to_string()))?;
        let winning_option_id = resolve_option_id(&market, winning_option_id)?;
        let commitments = self.markets.commitments_for_market(market_id).await?;
        let (winners, _) = partition_commitments(&commitments, &winning_option_id);

        let stakes: Vec<WinningStake> = winners
            .iter()
            .map(|c| WinningStake {
                user_id: c.user_id.clone(),
                tokens_committed: c.tokens_committed,
            })
            .collect();
        calculate_payout_preview(market.total_tokens_staked, &stakes, creator_fee_percentage)
    }
}

/// Map the requested winning option onto a concrete option id. Two-option
/// markets also accept the legacy "yes"/"no" aliases.
fn resolve_option_id(market: &Market, requested: &str) -> SettlementResult<String> {
    if market.options.iter().any(|o| o.option_id == requested) {
        return Ok(requested.to_string());
    }
    if market.options.len() == 2 {
        match requested {
            "yes" => return Ok(market.options[0].option_id.clone()),
            "no" => return Ok(market.options[1].option_id.clone()),
            _ => {}
        }
    }
    Err(SettlementError::InvalidInput(format!(
        "option {} does not exist on market {}",
        requested, market.id
    )))
}

/// Split active commitments into winners and losers for an option
fn partition_commitments<'a>(
    commitments: &'a [PredictionCommitment],
    winning_option_id: &str,
) -> (Vec<&'a PredictionCommitment>, Vec<&'a PredictionCommitment>) {
    let mut winners = Vec::new();
    let mut losers = Vec::new();
    for c in commitments {
        if c.status != CommitmentStatus::Active {
            continue;
        }
        if c.option_id == winning_option_id {
            winners.push(c);
        } else {
            losers.push(c);
        }
    }
    (winners, losers)
}
