//! Profit-lock state per pair and the ratchet ladder it climbs.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::order::PositionSide;

/// Unrealized P/L as a fraction of margin:
/// `±(current − avg) × quantity × leverage / (avg × quantity)`.
pub fn profit_ratio(
    position_side: PositionSide,
    avg_price: Decimal,
    current_price: Decimal,
    leverage: u32,
    quantity: Decimal,
) -> Decimal {
    let cost = avg_price * quantity;
    if cost.is_zero() {
        return Decimal::ZERO;
    }
    position_side.sign() * (current_price - avg_price) * quantity * Decimal::from(leverage.max(1)) / cost
}

/// One rung of the ladder: once profit reaches `threshold`, the next ratchet
/// happens at `next_trigger_ratio` and the exit sits `drawdown_ratio` below
/// the current profit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfitLevel {
    pub threshold: Decimal,
    pub next_trigger_ratio: Decimal,
    pub drawdown_ratio: Decimal,
}

/// Ascending profit ladder. Rungs are sorted by threshold however they were
/// configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<ProfitLevel>", into = "Vec<ProfitLevel>")]
pub struct ProfitLadder(Vec<ProfitLevel>);

impl From<Vec<ProfitLevel>> for ProfitLadder {
    fn from(levels: Vec<ProfitLevel>) -> Self {
        Self::new(levels)
    }
}

impl From<ProfitLadder> for Vec<ProfitLevel> {
    fn from(ladder: ProfitLadder) -> Self {
        ladder.0
    }
}

impl ProfitLadder {
    pub fn new(mut levels: Vec<ProfitLevel>) -> Self {
        levels.sort_by(|a, b| a.threshold.cmp(&b.threshold));
        Self(levels)
    }

    pub fn levels(&self) -> &[ProfitLevel] {
        &self.0
    }

    /// Threshold that arms the lock when no floor has been set yet.
    pub fn first_threshold(&self) -> Decimal {
        self.0.first().map(|l| l.threshold).unwrap_or(dec!(0.05))
    }

    /// Highest rung whose threshold is at or below `ratio`, falling back to
    /// the first rung.
    pub fn lookup(&self, ratio: Decimal) -> ProfitLevel {
        self.0
            .iter()
            .rev()
            .find(|l| l.threshold <= ratio)
            .or_else(|| self.0.first())
            .copied()
            .unwrap_or(ProfitLevel {
                threshold: dec!(0.05),
                next_trigger_ratio: dec!(0.1),
                drawdown_ratio: dec!(0.03),
            })
    }
}

impl Default for ProfitLadder {
    fn default() -> Self {
        let rung = |threshold, next_trigger_ratio, drawdown_ratio| ProfitLevel {
            threshold,
            next_trigger_ratio,
            drawdown_ratio,
        };
        Self::new(vec![
            rung(dec!(0.05), dec!(0.10), dec!(0.03)),
            rung(dec!(0.10), dec!(0.20), dec!(0.05)),
            rung(dec!(0.20), dec!(0.40), dec!(0.08)),
            rung(dec!(0.40), dec!(0.80), dec!(0.12)),
            rung(dec!(0.80), dec!(1.60), dec!(0.20)),
            rung(dec!(1.60), dec!(3.20), dec!(0.30)),
        ])
    }
}

/// Per-pair profit-lock record, tied to the currently open position.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PairProfit {
    /// A profit floor has been armed
    pub is_lock: bool,

    /// Exit threshold: close when profit falls to or below this
    pub close: Decimal,

    /// Drawdown tolerance of the current rung
    pub decrease: Decimal,

    /// Next ratchet trigger
    pub floor: Decimal,

    /// High-water mark
    pub max_profit: Decimal,
}

impl PairProfit {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Floor to compare against; an unset floor means the ladder's first rung.
    pub fn effective_floor(&self, ladder: &ProfitLadder) -> Decimal {
        if self.floor.is_zero() {
            ladder.first_threshold()
        } else {
            self.floor
        }
    }

    /// Arm or climb the lock at `ratio`. `close` never retreats once locked.
    pub fn ratchet(&mut self, ratio: Decimal, ladder: &ProfitLadder) {
        let level = ladder.lookup(ratio);
        self.floor = level.next_trigger_ratio;
        self.decrease = level.drawdown_ratio;
        self.max_profit = self.max_profit.max(ratio);

        let close = ratio - self.decrease;
        self.close = if self.is_lock { self.close.max(close) } else { close };
        self.is_lock = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profit_ratio_round_trip() {
        let avg = dec!(100);
        assert_eq!(profit_ratio(PositionSide::Long, avg, avg, 10, dec!(3)), Decimal::ZERO);

        // avg × (1 + r / leverage) yields r for a long
        let r = dec!(0.5);
        let price = avg * (Decimal::ONE + r / dec!(10));
        assert_eq!(profit_ratio(PositionSide::Long, avg, price, 10, dec!(3)), r);

        // 10% adverse move at 10x is a full margin loss
        assert_eq!(profit_ratio(PositionSide::Long, avg, dec!(90), 10, dec!(1)), dec!(-1));
        assert_eq!(profit_ratio(PositionSide::Short, avg, dec!(90), 10, dec!(1)), dec!(1));
    }

    #[test]
    fn test_zero_cost_ratio() {
        assert_eq!(profit_ratio(PositionSide::Long, Decimal::ZERO, dec!(5), 10, dec!(1)), Decimal::ZERO);
        assert_eq!(profit_ratio(PositionSide::Long, dec!(5), dec!(6), 10, Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_ladder_lookup() {
        let ladder = ProfitLadder::default();
        assert_eq!(ladder.lookup(dec!(0.01)).threshold, dec!(0.05));
        assert_eq!(ladder.lookup(dec!(0.10)).threshold, dec!(0.10));
        assert_eq!(ladder.lookup(dec!(0.35)).threshold, dec!(0.20));
        assert_eq!(ladder.lookup(dec!(9)).threshold, dec!(1.60));
    }

    #[test]
    fn test_ratchet_never_retreats() {
        let ladder = ProfitLadder::default();
        let mut profit = PairProfit::default();
        assert_eq!(profit.effective_floor(&ladder), dec!(0.05));

        profit.ratchet(dec!(0.25), &ladder);
        assert!(profit.is_lock);
        assert_eq!(profit.floor, dec!(0.40));
        assert_eq!(profit.close, dec!(0.17));

        // A later, smaller ratchet must not pull the exit down
        profit.ratchet(dec!(0.12), &ladder);
        assert_eq!(profit.close, dec!(0.17));
        assert_eq!(profit.max_profit, dec!(0.25));

        profit.reset();
        assert_eq!(profit, PairProfit::default());
    }

    #[test]
    fn test_configured_ladder_is_sorted() {
        let raw = r#"[
            { "threshold": "0.20", "next_trigger_ratio": "0.40", "drawdown_ratio": "0.08" },
            { "threshold": "0.05", "next_trigger_ratio": "0.10", "drawdown_ratio": "0.03" }
        ]"#;
        let ladder: ProfitLadder = serde_json::from_str(raw).unwrap();

        assert_eq!(ladder.first_threshold(), dec!(0.05));
        assert_eq!(ladder.lookup(dec!(0.30)).threshold, dec!(0.20));
        assert_eq!(ladder.lookup(dec!(0.07)).threshold, dec!(0.05));

        let rendered = serde_json::to_value(&ladder).unwrap();
        assert_eq!(rendered.as_array().map(|a| a.len()), Some(2));
    }
}
