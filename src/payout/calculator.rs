use serde::{Deserialize, Serialize};

use crate::errors::{SettlementError, SettlementResult};

/// Fixed platform cut, taken regardless of the creator fee
pub const HOUSE_FEE_RATE: f64 = 0.05;
/// Creator fee bounds, as fractions of the pool
pub const MIN_CREATOR_FEE: f64 = 0.01;
pub const MAX_CREATOR_FEE: f64 = 0.05;

/// One winning stake, as handed over by the resolution orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinningStake {
    pub user_id: String,
    pub tokens_committed: f64,
}

/// Per-winner payout line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerPayout {
    pub user_id: String,
    pub tokens_staked: f64,
    /// Floored to a whole token; remainders stay with the house
    pub payout_amount: f64,
    pub profit: f64,
    /// Fraction of the total winning stake
    pub win_share: f64,
}

/// Fee percentages (as fractions) and amounts for a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub house_fee_percentage: f64,
    pub creator_fee_percentage: f64,
    pub total_fee_percentage: f64,
    pub winner_pool_percentage: f64,
    pub house_fee: f64,
    pub creator_fee: f64,
    pub total_fees: f64,
}

/// Full result of one payout computation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutCalculationResult {
    pub total_pool: f64,
    pub house_fee: f64,
    pub creator_fee: f64,
    pub total_fees: f64,
    pub winner_pool: f64,
    pub winner_count: usize,
    pub payouts: Vec<WinnerPayout>,
    pub fee_breakdown: FeeBreakdown,
}

/// Payout result plus summary statistics for preview UIs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutPreview {
    #[serde(flatten)]
    pub result: PayoutCalculationResult,
    pub largest_payout: f64,
    pub smallest_payout: f64,
    pub average_payout: f64,
    pub total_profit: f64,
}

/// One share of a proportional split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProportionalShare {
    pub user_id: String,
    pub share: f64,
    pub amount: f64,
}

fn validate_inputs(
    total_pool: f64,
    winning_commitments: &[WinningStake],
    creator_fee_percentage: f64,
) -> SettlementResult<()> {
    if !total_pool.is_finite() || total_pool < 0.0 {
        return Err(SettlementError::InvalidInput(format!(
            "total pool must be a non-negative number, got {}",
            total_pool
        )));
    }
    if !creator_fee_percentage.is_finite()
        || creator_fee_percentage < MIN_CREATOR_FEE
        || creator_fee_percentage > MAX_CREATOR_FEE
    {
        return Err(SettlementError::InvalidFeeRange(creator_fee_percentage));
    }

    let mut total_committed = 0.0;
    for stake in winning_commitments {
        if !stake.tokens_committed.is_finite() || stake.tokens_committed < 0.0 {
            return Err(SettlementError::InvalidInput(format!(
                "tokens committed for {} must be non-negative, got {}",
                stake.user_id, stake.tokens_committed
            )));
        }
        total_committed += stake.tokens_committed;
    }
    if total_committed > total_pool {
        return Err(SettlementError::InvalidInput(format!(
            "winning stakes ({}) exceed total pool ({})",
            total_committed, total_pool
        )));
    }
    Ok(())
}

/// Split a pool among winners after deducting house and creator fees.
///
/// Fees and per-winner amounts are floored to whole tokens; flooring
/// remainders are not redistributed and stay with the house.
pub fn calculate_payouts(
    total_pool: f64,
    winning_commitments: &[WinningStake],
    creator_fee_percentage: f64,
) -> SettlementResult<PayoutCalculationResult> {
    validate_inputs(total_pool, winning_commitments, creator_fee_percentage)?;

    let house_fee = (total_pool * HOUSE_FEE_RATE).floor();
    let creator_fee = (total_pool * creator_fee_percentage).floor();
    let total_fees = house_fee + creator_fee;
    // Fee caps sum to at most 10%, so this never goes negative
    let winner_pool = total_pool - total_fees;

    let total_winning_tokens: f64 = winning_commitments
        .iter()
        .map(|c| c.tokens_committed)
        .sum();

    let payouts = if total_winning_tokens > 0.0 {
        winning_commitments
            .iter()
            .map(|c| {
                let win_share = c.tokens_committed / total_winning_tokens;
                let payout_amount = (winner_pool * win_share).floor();
                WinnerPayout {
                    user_id: c.user_id.clone(),
                    tokens_staked: c.tokens_committed,
                    payout_amount,
                    profit: payout_amount - c.tokens_committed,
                    win_share,
                }
            })
            .collect()
    } else {
        // No winners: the pool is still reported, just undistributed
        Vec::new()
    };

    let total_fee_percentage = HOUSE_FEE_RATE + creator_fee_percentage;
    Ok(PayoutCalculationResult {
        total_pool,
        house_fee,
        creator_fee,
        total_fees,
        winner_pool,
        winner_count: payouts.len(),
        payouts,
        fee_breakdown: FeeBreakdown {
            house_fee_percentage: HOUSE_FEE_RATE,
            creator_fee_percentage,
            total_fee_percentage,
            winner_pool_percentage: 1.0 - total_fee_percentage,
            house_fee,
            creator_fee,
            total_fees,
        },
    })
}

/// Payout computation plus summary stats for preview UIs. Returns zeros for
/// every statistic when there are no winners.
pub fn calculate_payout_preview(
    total_pool: f64,
    winning_commitments: &[WinningStake],
    creator_fee_percentage: f64,
) -> SettlementResult<PayoutPreview> {
    let result = calculate_payouts(total_pool, winning_commitments, creator_fee_percentage)?;

    let (largest, smallest, average, total_profit) = if result.payouts.is_empty() {
        (0.0, 0.0, 0.0, 0.0)
    } else {
        let mut largest = f64::MIN;
        let mut smallest = f64::MAX;
        let mut sum = 0.0;
        let mut profit = 0.0;
        for p in &result.payouts {
            largest = largest.max(p.payout_amount);
            smallest = smallest.min(p.payout_amount);
            sum += p.payout_amount;
            profit += p.profit;
        }
        let average = (sum / result.payouts.len() as f64).floor();
        (largest, smallest, average, profit)
    };

    Ok(PayoutPreview {
        result,
        largest_payout: largest,
        smallest_payout: smallest,
        average_payout: average,
        total_profit,
    })
}

/// Lower-level proportional split without the fee context. Every share and
/// amount is zero when nothing has been committed.
pub fn calculate_proportional_distribution(
    pool: f64,
    commitments: &[WinningStake],
) -> Vec<ProportionalShare> {
    let total: f64 = commitments.iter().map(|c| c.tokens_committed).sum();

    commitments
        .iter()
        .map(|c| {
            let share = if total > 0.0 {
                c.tokens_committed / total
            } else {
                0.0
            };
            ProportionalShare {
                user_id: c.user_id.clone(),
                share,
                amount: pool * share,
            }
        })
        .collect()
}

/// Standalone fee view for preview UIs, validated the same way as a full
/// payout run.
pub fn get_fee_breakdown(
    total_pool: f64,
    creator_fee_percentage: f64,
) -> SettlementResult<FeeBreakdown> {
    validate_inputs(total_pool, &[], creator_fee_percentage)?;

    let house_fee = (total_pool * HOUSE_FEE_RATE).floor();
    let creator_fee = (total_pool * creator_fee_percentage).floor();
    let total_fee_percentage = HOUSE_FEE_RATE + creator_fee_percentage;

    Ok(FeeBreakdown {
        house_fee_percentage: HOUSE_FEE_RATE,
        creator_fee_percentage,
        total_fee_percentage,
        winner_pool_percentage: 1.0 - total_fee_percentage,
        house_fee,
        creator_fee,
        total_fees: house_fee + creator_fee,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stake(user_id: &str, tokens: f64) -> WinningStake {
        WinningStake {
            user_id: user_id.to_string(),
            tokens_committed: tokens,
        }
    }

    #[test]
    fn test_documented_example() {
        let result =
            calculate_payouts(1000.0, &[stake("user1", 300.0), stake("user2", 200.0)], 0.02)
                .unwrap();

        assert_eq!(result.house_fee, 50.0);
        assert_eq!(result.creator_fee, 20.0);
        assert_eq!(result.winner_pool, 930.0);
        assert_eq!(result.winner_count, 2);
        assert_eq!(result.payouts[0].payout_amount, 558.0);
        assert_eq!(result.payouts[0].profit, 258.0);
        assert_eq!(result.payouts[1].payout_amount, 372.0);
        assert_eq!(result.payouts[1].profit, 172.0);
    }

    #[test]
    fn test_flooring_remainder_stays_with_house() {
        let result =
            calculate_payouts(100.0, &[stake("u1", 33.0), stake("u2", 67.0)], 0.02).unwrap();

        assert_eq!(result.winner_pool, 93.0);
        assert_eq!(result.payouts[0].payout_amount, 30.0);
        assert_eq!(result.payouts[1].payout_amount, 62.0);
        // 30 + 62 = 92 != 93: the floored remainder is not redistributed
        let distributed: f64 = result.payouts.iter().map(|p| p.payout_amount).sum();
        assert!(distributed <= result.winner_pool);
        assert_eq!(distributed, 92.0);
    }

    #[test]
    fn test_pool_conservation() {
        for pool in [0.0, 1.0, 777.0, 10_000.0, 123_456.0] {
            let result = calculate_payouts(pool, &[stake("u", pool / 2.0)], 0.03).unwrap();
            assert_eq!(
                result.house_fee + result.creator_fee + result.winner_pool,
                result.total_pool
            );
        }
    }

    #[test]
    fn test_win_shares_sum_to_one() {
        let result = calculate_payouts(
            1000.0,
            &[stake("a", 100.0), stake("b", 250.0), stake("c", 17.0)],
            0.05,
        )
        .unwrap();
        let share_sum: f64 = result.payouts.iter().map(|p| p.win_share).sum();
        assert!((share_sum - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_fee_range_boundaries() {
        assert!(calculate_payouts(100.0, &[stake("u", 10.0)], 0.01).is_ok());
        assert!(calculate_payouts(100.0, &[stake("u", 10.0)], 0.05).is_ok());
        assert!(matches!(
            calculate_payouts(100.0, &[stake("u", 10.0)], 0.009999),
            Err(SettlementError::InvalidFeeRange(_))
        ));
        assert!(matches!(
            calculate_payouts(100.0, &[stake("u", 10.0)], 0.05001),
            Err(SettlementError::InvalidFeeRange(_))
        ));
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            calculate_payouts(-1.0, &[], 0.02),
            Err(SettlementError::InvalidInput(_))
        ));
        assert!(matches!(
            calculate_payouts(100.0, &[stake("u", -5.0)], 0.02),
            Err(SettlementError::InvalidInput(_))
        ));
        // Stakes exceeding the pool
        assert!(matches!(
            calculate_payouts(100.0, &[stake("u", 101.0)], 0.02),
            Err(SettlementError::InvalidInput(_))
        ));
        assert!(matches!(
            calculate_payouts(f64::NAN, &[], 0.02),
            Err(SettlementError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_zero_winners_pool_still_reported() {
        let result = calculate_payouts(1000.0, &[], 0.02).unwrap();
        assert_eq!(result.winner_pool, 930.0);
        assert_eq!(result.winner_count, 0);
        assert!(result.payouts.is_empty());
    }

    #[test]
    fn test_zero_stake_winners_get_nothing() {
        // Well-formed but all-zero stakes behave like no winners
        let result = calculate_payouts(1000.0, &[stake("u1", 0.0), stake("u2", 0.0)], 0.02).unwrap();
        assert!(result.payouts.is_empty());
        assert_eq!(result.winner_pool, 930.0);
    }

    #[test]
    fn test_idempotence() {
        let stakes = [stake("a", 300.0), stake("b", 200.0)];
        let first = calculate_payouts(1000.0, &stakes, 0.02).unwrap();
        let second = calculate_payouts(1000.0, &stakes, 0.02).unwrap();
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_preview_statistics() {
        let preview = calculate_payout_preview(
            1000.0,
            &[stake("user1", 300.0), stake("user2", 200.0)],
            0.02,
        )
        .unwrap();

        assert_eq!(preview.largest_payout, 558.0);
        assert_eq!(preview.smallest_payout, 372.0);
        assert_eq!(preview.average_payout, 465.0);
        assert_eq!(preview.total_profit, 258.0 + 172.0);
    }

    #[test]
    fn test_preview_no_winners_zeros() {
        let preview = calculate_payout_preview(1000.0, &[], 0.02).unwrap();
        assert_eq!(preview.largest_payout, 0.0);
        assert_eq!(preview.smallest_payout, 0.0);
        assert_eq!(preview.average_payout, 0.0);
        assert_eq!(preview.total_profit, 0.0);
    }

    #[test]
    fn test_proportional_distribution() {
        let shares =
            calculate_proportional_distribution(90.0, &[stake("a", 1.0), stake("b", 2.0)]);
        assert!((shares[0].share - 1.0 / 3.0).abs() < 1e-9);
        assert!((shares[0].amount - 30.0).abs() < 1e-9);
        assert!((shares[1].amount - 60.0).abs() < 1e-9);
    }

    #[test]
    fn test_proportional_distribution_zero_total() {
        let shares = calculate_proportional_distribution(90.0, &[stake("a", 0.0)]);
        assert_eq!(shares[0].share, 0.0);
        assert_eq!(shares[0].amount, 0.0);
    }

    #[test]
    fn test_fee_breakdown_standalone() {
        let fees = get_fee_breakdown(1000.0, 0.02).unwrap();
        assert_eq!(fees.house_fee, 50.0);
        assert_eq!(fees.creator_fee, 20.0);
        assert_eq!(fees.total_fees, 70.0);
        assert!((fees.winner_pool_percentage - 0.93).abs() < 1e-9);
        assert!(matches!(
            get_fee_breakdown(1000.0, 0.2),
            Err(SettlementError::InvalidFeeRange(_))
        ));
    }
}
