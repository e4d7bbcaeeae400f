//! Snapshot of a followed account's position (watchdog mode input).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::PositionSide;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuiderPosition {
    pub symbol: String,
    pub position_side: PositionSide,

    /// Absolute position size in base units
    pub amount: Decimal,

    pub entry_price: Decimal,

    #[serde(default = "default_leverage")]
    pub leverage: u32,

    /// Free margin on the followed account
    #[serde(default)]
    pub available_margin: Decimal,
}

fn default_leverage() -> u32 {
    1
}
