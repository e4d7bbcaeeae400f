//! Order model: exchange orders plus the extra context threaded through creation.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SideType {
    Buy,
    Sell,
}

impl SideType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideType::Buy => "BUY",
            SideType::Sell => "SELL",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            SideType::Buy => SideType::Sell,
            SideType::Sell => SideType::Buy,
        }
    }

    /// Position side this order side opens in hedge mode.
    pub fn opening_position_side(&self) -> PositionSide {
        match self {
            SideType::Buy => PositionSide::Long,
            SideType::Sell => PositionSide::Short,
        }
    }
}

impl fmt::Display for SideType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hedge-mode leg of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "LONG",
            PositionSide::Short => "SHORT",
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// Order side that opens or adds to this leg.
    pub fn entry_side(&self) -> SideType {
        match self {
            PositionSide::Long => SideType::Buy,
            PositionSide::Short => SideType::Sell,
        }
    }

    /// Order side that reduces or closes this leg.
    pub fn exit_side(&self) -> SideType {
        self.entry_side().opposite()
    }

    /// +1 for long, -1 for short.
    pub fn sign(&self) -> Decimal {
        match self {
            PositionSide::Long => Decimal::ONE,
            PositionSide::Short => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    StopLimit,
    StopMarket,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
            OrderType::StopLimit => "STOP_LIMIT",
            OrderType::StopMarket => "STOP_MARKET",
        }
    }

    pub fn is_stop(&self) -> bool {
        matches!(self, OrderType::StopLimit | OrderType::StopMarket)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, OrderStatus::New | OrderStatus::PartiallyFilled)
    }
}

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Timeout,
    ProfitBack,
    LossMax,
    StopLoss,
    Reverse,
    GridClose,
    GuiderClosed,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Timeout => "TIMEOUT",
            CloseReason::ProfitBack => "PROFIT_BACK",
            CloseReason::LossMax => "LOSS_MAX",
            CloseReason::StopLoss => "STOP_LOSS",
            CloseReason::Reverse => "REVERSE",
            CloseReason::GridClose => "GRID_CLOSE",
            CloseReason::GuiderClosed => "GUIDER_CLOSED",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context carried with an order so fill handling can rebuild the decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderExtra {
    /// Groups an entry order with its dependent stop orders
    pub order_flag: String,

    pub leverage: u32,

    /// Weighted long/short ratio at decision time (-1 when not signal driven)
    pub long_short_ratio: f64,

    /// Strategy name -> number of matching signals
    #[serde(default)]
    pub matched_strategies: BTreeMap<String, u32>,

    #[serde(default)]
    pub stop_loss_price: Option<Decimal>,

    #[serde(default)]
    pub close_reason: Option<CloseReason>,
}

impl OrderExtra {
    /// Fresh extra for a new position with a newly generated flag.
    pub fn new_entry(leverage: u32, long_short_ratio: f64) -> Self {
        Self {
            order_flag: new_order_flag(),
            leverage,
            long_short_ratio,
            ..Default::default()
        }
    }
}

/// Generate a new opaque order flag.
pub fn new_order_flag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Exchange order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub pair: String,
    pub side: SideType,
    pub position_side: PositionSide,
    pub order_type: OrderType,
    pub status: OrderStatus,

    /// Limit price (fill price for market orders once filled)
    pub price: Decimal,

    #[serde(default)]
    pub stop_price: Option<Decimal>,

    pub quantity: Decimal,

    #[serde(default)]
    pub executed_quantity: Decimal,

    pub leverage: u32,
    pub order_flag: String,

    #[serde(default)]
    pub long_short_ratio: f64,

    #[serde(default)]
    pub matched_strategies: BTreeMap<String, u32>,

    #[serde(default)]
    pub stop_loss_price: Option<Decimal>,

    #[serde(default)]
    pub close_reason: Option<CloseReason>,

    /// Quote margin held by the exchange for this order
    #[serde(default)]
    pub locked_margin: Decimal,

    #[serde(default)]
    pub fee: Decimal,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Build a NEW order from its parameters and extra context.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pair: &str,
        side: SideType,
        position_side: PositionSide,
        order_type: OrderType,
        quantity: Decimal,
        price: Decimal,
        stop_price: Option<Decimal>,
        extra: OrderExtra,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pair: pair.to_string(),
            side,
            position_side,
            order_type,
            status: OrderStatus::New,
            price,
            stop_price,
            quantity,
            executed_quantity: Decimal::ZERO,
            leverage: extra.leverage.max(1),
            order_flag: extra.order_flag,
            long_short_ratio: extra.long_short_ratio,
            matched_strategies: extra.matched_strategies,
            stop_loss_price: extra.stop_loss_price,
            close_reason: extra.close_reason,
            locked_margin: Decimal::ZERO,
            fee: Decimal::ZERO,
            created_at,
            updated_at: created_at,
        }
    }

    /// True when the order opens or adds to its position side.
    pub fn is_entry(&self) -> bool {
        self.side == self.position_side.entry_side()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_entry_detection() {
        let extra = OrderExtra::new_entry(10, 0.7);
        let now = Utc::now();
        let entry = Order::new(
            "BTCUSDT",
            SideType::Buy,
            PositionSide::Long,
            OrderType::Limit,
            dec!(1),
            dec!(100),
            None,
            extra.clone(),
            now,
        );
        let exit = Order::new(
            "BTCUSDT",
            SideType::Sell,
            PositionSide::Long,
            OrderType::StopMarket,
            dec!(1),
            dec!(95),
            Some(dec!(95)),
            extra,
            now,
        );

        assert!(entry.is_entry());
        assert!(!exit.is_entry());
        assert_eq!(entry.order_flag, exit.order_flag);
        assert!(exit.order_type.is_stop());
    }

    #[test]
    fn test_side_mapping() {
        assert_eq!(PositionSide::Short.entry_side(), SideType::Sell);
        assert_eq!(PositionSide::Short.exit_side(), SideType::Buy);
        assert_eq!(SideType::Buy.opening_position_side(), PositionSide::Long);
        assert_eq!(CloseReason::ProfitBack.to_string(), "PROFIT_BACK");
    }
}
