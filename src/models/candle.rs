//! Market candle model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// OHLCV candle for one pair and timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub pair: String,

    #[serde(default = "default_timeframe")]
    pub timeframe: String,

    /// Candle open time
    pub time: DateTime<Utc>,

    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,

    #[serde(default)]
    pub volume: Decimal,

    /// False while the candle is still forming
    #[serde(default = "default_true")]
    pub complete: bool,
}

fn default_timeframe() -> String {
    "1m".to_string()
}

fn default_true() -> bool {
    true
}

impl Candle {
    /// Bar range used for true-range calculations.
    pub fn true_range(&self, prev_close: Option<Decimal>) -> Decimal {
        let range = self.high - self.low;
        match prev_close {
            Some(prev) => range
                .max((self.high - prev).abs())
                .max((self.low - prev).abs()),
            None => range,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_true_range_uses_gap() {
        let candle = Candle {
            pair: "BTCUSDT".to_string(),
            timeframe: "1m".to_string(),
            time: Utc::now(),
            open: dec!(105),
            high: dec!(106),
            low: dec!(104),
            close: dec!(105),
            volume: dec!(10),
            complete: true,
        };

        assert_eq!(candle.true_range(None), dec!(2));
        assert_eq!(candle.true_range(Some(dec!(100))), dec!(6));
    }

    #[test]
    fn test_deserialize_defaults() {
        let json = r#"{"pair":"ETHUSDT","time":"2024-01-01T00:00:00Z","open":"1","high":"2","low":"0.5","close":"1.5"}"#;
        let candle: Candle = serde_json::from_str(json).unwrap();
        assert_eq!(candle.timeframe, "1m");
        assert!(candle.complete);
        assert_eq!(candle.volume, Decimal::ZERO);
    }
}
