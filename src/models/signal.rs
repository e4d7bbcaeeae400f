//! Per-strategy signal produced on every candle tick.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::SideType;

/// Output of one signal source for one candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySignal {
    /// Strategy name
    pub name: String,

    pub side: SideType,

    /// Whether the signal may be acted on this tick
    pub usable: bool,

    /// Strategy weight
    pub score: f64,

    /// Free-form tendency label ("up", "down", "range", ...)
    #[serde(default)]
    pub tendency: String,

    /// Latest ATR seen by the strategy, in price units
    #[serde(default)]
    pub last_atr: Decimal,
}

impl StrategySignal {
    pub fn new(name: &str, side: SideType, score: f64, last_atr: Decimal) -> Self {
        Self {
            name: name.to_string(),
            side,
            usable: true,
            score,
            tendency: String::new(),
            last_atr,
        }
    }
}
