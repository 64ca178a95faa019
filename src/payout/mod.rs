//! Payout Calculation
//!
//! Pure pool-splitting math: house fee, creator fee, proportional winner
//! distribution. No I/O, no mutable state.

mod calculator;

pub use calculator::{
    calculate_payout_preview, calculate_payouts, calculate_proportional_distribution,
    get_fee_breakdown, FeeBreakdown, PayoutCalculationResult, PayoutPreview, ProportionalShare,
    WinnerPayout, WinningStake, HOUSE_FEE_RATE, MAX_CREATOR_FEE, MIN_CREATOR_FEE,
};
