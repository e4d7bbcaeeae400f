//! Reference signal sources.
//!
//! Each [`Matcher`] looks at the sample window and votes BUY or SELL (or
//! abstains). [`MatcherSet`] runs them all and stamps every vote with the
//! window's ATR so the caller can place its stop.

use rust_decimal::Decimal;
use tracing::debug;

use crate::broker::StrategyAggregator;
use crate::config::StrategySetting;
use crate::models::{Candle, SideType, StrategySignal};

/// One signal source.
pub trait Matcher: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self) -> f64;

    /// Vote for the latest candle, `None` to abstain.
    fn evaluate(&self, samples: &[Candle]) -> Option<SideType>;
}

/// Mean close of the last `period` candles.
pub fn sma(samples: &[Candle], period: usize) -> Option<Decimal> {
    if period == 0 || samples.len() < period {
        return None;
    }
    let sum: Decimal = samples[samples.len() - period..].iter().map(|c| c.close).sum();
    Some(sum / Decimal::from(period))
}

/// Average true range over the last `period` candles.
pub fn atr(samples: &[Candle], period: usize) -> Decimal {
    if samples.is_empty() || period == 0 {
        return Decimal::ZERO;
    }
    let start = samples.len().saturating_sub(period);
    let ranges: Vec<Decimal> = (start..samples.len())
        .map(|i| {
            let prev = i.checked_sub(1).map(|p| samples[p].close);
            samples[i].true_range(prev)
        })
        .collect();
    ranges.iter().sum::<Decimal>() / Decimal::from(ranges.len())
}

/// Fast SMA above the slow SMA votes BUY, below votes SELL.
pub struct SmaCross {
    fast: usize,
    slow: usize,
    score: f64,
}

impl SmaCross {
    pub fn new(fast: usize, slow: usize, score: f64) -> Self {
        Self { fast, slow, score }
    }
}

impl Matcher for SmaCross {
    fn name(&self) -> &str {
        "sma_cross"
    }

    fn score(&self) -> f64 {
        self.score
    }

    fn evaluate(&self, samples: &[Candle]) -> Option<SideType> {
        let fast = sma(samples, self.fast)?;
        let slow = sma(samples, self.slow)?;
        match fast.cmp(&slow) {
            std::cmp::Ordering::Greater => Some(SideType::Buy),
            std::cmp::Ordering::Less => Some(SideType::Sell),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// Close beyond the prior `period` candles' high/low channel.
pub struct DonchianBreakout {
    period: usize,
    score: f64,
}

impl DonchianBreakout {
    pub fn new(period: usize, score: f64) -> Self {
        Self { period, score }
    }
}

impl Matcher for DonchianBreakout {
    fn name(&self) -> &str {
        "donchian_breakout"
    }

    fn score(&self) -> f64 {
        self.score
    }

    fn evaluate(&self, samples: &[Candle]) -> Option<SideType> {
        let (last, prior) = samples.split_last()?;
        if self.period == 0 || prior.len() < self.period {
            return None;
        }
        let channel = &prior[prior.len() - self.period..];
        let upper = channel.iter().map(|c| c.high).max()?;
        let lower = channel.iter().map(|c| c.low).min()?;

        if last.close > upper {
            Some(SideType::Buy)
        } else if last.close < lower {
            Some(SideType::Sell)
        } else {
            None
        }
    }
}

/// Runs every matcher over the sample window.
pub struct MatcherSet {
    matchers: Vec<Box<dyn Matcher>>,
    atr_period: usize,
}

impl MatcherSet {
    pub fn new(matchers: Vec<Box<dyn Matcher>>, atr_period: usize) -> Self {
        Self { matchers, atr_period }
    }

    pub fn from_setting(setting: &StrategySetting) -> Self {
        Self::new(
            vec![
                Box::new(SmaCross::new(setting.sma_fast, setting.sma_slow, setting.sma_score)),
                Box::new(DonchianBreakout::new(setting.donchian_period, setting.donchian_score)),
            ],
            setting.atr_period,
        )
    }
}

impl StrategyAggregator for MatcherSet {
    fn call_matchers(&self, pair: &str, samples: &[Candle]) -> Vec<StrategySignal> {
        let last_atr = atr(samples, self.atr_period);
        let signals: Vec<StrategySignal> = self
            .matchers
            .iter()
            .filter_map(|m| {
                m.evaluate(samples).map(|side| {
                    let mut signal = StrategySignal::new(m.name(), side, m.score(), last_atr);
                    signal.tendency = match side {
                        SideType::Buy => "up".to_string(),
                        SideType::Sell => "down".to_string(),
                    };
                    signal
                })
            })
            .collect();

        debug!(pair = %pair, samples = samples.len(), signals = signals.len(), atr = %last_atr, "Matchers evaluated");
        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn series(closes: &[Decimal]) -> Vec<Candle> {
        let start = Utc::now();
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                pair: "BTCUSDT".to_string(),
                timeframe: "1m".to_string(),
                time: start + Duration::minutes(i as i64),
                open: *close,
                high: *close + dec!(1),
                low: *close - dec!(1),
                close: *close,
                volume: dec!(1),
                complete: true,
            })
            .collect()
    }

    #[test]
    fn test_sma_cross_votes() {
        let matcher = SmaCross::new(2, 4, 1.0);
        let rising = series(&[dec!(100), dec!(101), dec!(102), dec!(103)]);
        assert_eq!(matcher.evaluate(&rising), Some(SideType::Buy));

        let falling = series(&[dec!(103), dec!(102), dec!(101), dec!(100)]);
        assert_eq!(matcher.evaluate(&falling), Some(SideType::Sell));

        // not enough samples for the slow average
        assert_eq!(matcher.evaluate(&rising[..3]), None);
    }

    #[test]
    fn test_donchian_breakout() {
        let matcher = DonchianBreakout::new(3, 1.0);
        let inside = series(&[dec!(100), dec!(101), dec!(100), dec!(100.5)]);
        assert_eq!(matcher.evaluate(&inside), None);

        // close 103 above the prior highs (max 102)
        let breakout = series(&[dec!(100), dec!(101), dec!(100), dec!(103)]);
        assert_eq!(matcher.evaluate(&breakout), Some(SideType::Buy));

        let breakdown = series(&[dec!(100), dec!(101), dec!(100), dec!(98)]);
        assert_eq!(matcher.evaluate(&breakdown), Some(SideType::Sell));
    }

    #[test]
    fn test_atr_includes_gaps() {
        // ranges of 2, then a gap from 100 to 110 (high 111)
        let samples = series(&[dec!(100), dec!(110)]);
        assert_eq!(atr(&samples, 2), dec!(6.5));
        assert_eq!(atr(&[], 14), Decimal::ZERO);
    }

    #[test]
    fn test_set_stamps_atr() {
        let set = MatcherSet::from_setting(&StrategySetting {
            sma_fast: 2,
            sma_slow: 3,
            donchian_period: 2,
            atr_period: 3,
            ..Default::default()
        });
        let samples = series(&[dec!(100), dec!(101), dec!(104)]);
        let signals = set.call_matchers("BTCUSDT", &samples);

        assert_eq!(signals.len(), 2);
        assert!(signals.iter().all(|s| s.side == SideType::Buy && s.tendency == "up"));
        assert!(signals.iter().all(|s| s.last_atr > Decimal::ZERO));
    }
}
