//! Aggregation of per-strategy signals into a long/short ratio.

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use crate::models::{SideType, StrategySignal};

/// Ratio reported when the signals do not agree on a side.
pub const NO_CONSENSUS: f64 = -1.0;

/// Weighted buy share of the usable signals, in `[0, 1]`, or
/// [`NO_CONSENSUS`] when there are no signals, no score, or an exact tie.
///
/// Each signal weighs `count(signals on its side) × score / Σ score`.
pub fn long_short_ratio(signals: &[StrategySignal]) -> f64 {
    let usable: Vec<&StrategySignal> = signals.iter().filter(|s| s.usable).collect();
    let total_score: f64 = usable.iter().map(|s| s.score).sum();
    if usable.is_empty() || total_score <= 0.0 {
        return NO_CONSENSUS;
    }

    let buys = usable.iter().filter(|s| s.side == SideType::Buy).count() as f64;
    let sells = usable.len() as f64 - buys;

    let (mut buy, mut sell) = (0.0, 0.0);
    for signal in &usable {
        match signal.side {
            SideType::Buy => buy += buys * signal.score / total_score,
            SideType::Sell => sell += sells * signal.score / total_score,
        }
    }

    if buy + sell <= 0.0 || buy == sell {
        return NO_CONSENSUS;
    }
    buy / (buy + sell)
}

/// What the signals say for one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalSummary {
    pub ratio: f64,
    pub side: SideType,

    /// Strategy name -> signals agreeing with `side`
    pub matched_strategies: BTreeMap<String, u32>,

    /// Mean ATR of the signals agreeing with `side`
    pub mean_atr: Decimal,
}

/// Summarize usable signals, or `None` without consensus.
pub fn summarize(signals: &[StrategySignal]) -> Option<SignalSummary> {
    let ratio = long_short_ratio(signals);
    if ratio < 0.0 {
        return None;
    }

    let side = if ratio > 0.5 { SideType::Buy } else { SideType::Sell };

    let mut matched_strategies = BTreeMap::new();
    let mut atr_sum = Decimal::ZERO;
    let mut atr_count = 0u32;
    for signal in signals.iter().filter(|s| s.usable && s.side == side) {
        *matched_strategies.entry(signal.name.clone()).or_insert(0) += 1;
        if signal.last_atr > Decimal::ZERO {
            atr_sum += signal.last_atr;
            atr_count += 1;
        }
    }

    let mean_atr = if atr_count > 0 {
        atr_sum / Decimal::from(atr_count)
    } else {
        Decimal::ZERO
    };

    Some(SignalSummary {
        ratio,
        side,
        matched_strategies,
        mean_atr,
    })
}

/// Whether a new ratio is decisive enough to reverse a position opened at
/// `old_ratio`: its distance from 0.5 must be at least as large.
pub fn should_reverse(new_ratio: f64, old_ratio: f64) -> bool {
    (new_ratio - 0.5).abs() >= (old_ratio - 0.5).abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sig(name: &str, side: SideType, score: f64) -> StrategySignal {
        StrategySignal::new(name, side, score, dec!(2))
    }

    #[test]
    fn test_weighted_ratio() {
        let signals = vec![
            sig("sma", SideType::Buy, 1.0),
            sig("donchian", SideType::Buy, 1.0),
            sig("rsi", SideType::Sell, 1.0),
        ];
        // buy = 2 × (1/3 + 1/3), sell = 1 × 1/3
        let ratio = long_short_ratio(&signals);
        assert!((ratio - 0.8).abs() < 1e-9);

        let summary = summarize(&signals).unwrap();
        assert_eq!(summary.side, SideType::Buy);
        assert_eq!(summary.matched_strategies.len(), 2);
        assert_eq!(summary.mean_atr, dec!(2));
    }

    #[test]
    fn test_no_consensus() {
        assert_eq!(long_short_ratio(&[]), NO_CONSENSUS);

        let tie = vec![sig("a", SideType::Buy, 1.0), sig("b", SideType::Sell, 1.0)];
        assert_eq!(long_short_ratio(&tie), NO_CONSENSUS);
        assert!(summarize(&tie).is_none());

        let zero = vec![sig("a", SideType::Buy, 0.0)];
        assert_eq!(long_short_ratio(&zero), NO_CONSENSUS);
    }

    #[test]
    fn test_unusable_signals_ignored() {
        let mut muted = sig("b", SideType::Buy, 5.0);
        muted.usable = false;
        let signals = vec![sig("a", SideType::Sell, 1.0), muted];

        assert_eq!(long_short_ratio(&signals), 0.0);
        assert_eq!(summarize(&signals).unwrap().side, SideType::Sell);
    }

    #[test]
    fn test_reverse_threshold() {
        assert!(should_reverse(0.2, 0.7));
        assert!(should_reverse(0.8, 0.2));
        assert!(!should_reverse(0.4, 0.8));
    }
}
