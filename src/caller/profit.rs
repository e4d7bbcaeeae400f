//! Close-decision state machine over the per-pair profit lock.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{CloseReason, PairProfit, ProfitLadder};

/// Inputs for one close evaluation of one position.
#[derive(Debug, Clone, Copy)]
pub struct CloseCheck {
    /// Current profit ratio of the position
    pub ratio: Decimal,
    pub now: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,

    /// Loss ratio limit; zero means "use the static stop price"
    pub max_margin_loss_ratio: Decimal,

    /// Price has crossed the position's stop-loss price
    pub stop_loss_hit: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDecision {
    /// Nothing to do
    Hold,
    /// In profit below the next trigger
    Watch,
    /// Lock armed or ratcheted; the deadline should be extended
    Ratchet,
    Finish(CloseReason),
}

/// Evaluate one position. Mutates `profit` when the lock arms, ratchets or
/// fires. Checks run in a fixed order: timeout, profit give-back, ratchet,
/// watch, loss limit, stop price.
pub fn close_decision(profit: &mut PairProfit, ladder: &ProfitLadder, check: &CloseCheck) -> CloseDecision {
    if let Some(deadline) = check.deadline {
        if check.now > deadline {
            return CloseDecision::Finish(CloseReason::Timeout);
        }
    }

    let ratio = check.ratio;

    if profit.is_lock && ratio <= profit.close {
        profit.reset();
        return CloseDecision::Finish(CloseReason::ProfitBack);
    }

    if ratio > Decimal::ZERO {
        if ratio >= profit.effective_floor(ladder) {
            profit.ratchet(ratio, ladder);
            return CloseDecision::Ratchet;
        }
        return CloseDecision::Watch;
    }

    let limit = check.max_margin_loss_ratio;
    if ratio < Decimal::ZERO && limit > Decimal::ZERO && ratio.abs() > limit {
        return CloseDecision::Finish(CloseReason::LossMax);
    }

    if limit.is_zero() && check.stop_loss_hit {
        return CloseDecision::Finish(CloseReason::StopLoss);
    }

    CloseDecision::Hold
}
