//! Position model: an open exchange position on one leg of a pair.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::{Order, PositionSide, SideType};
use super::profit::profit_ratio;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MarginType {
    #[default]
    Isolated,
    Crossed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// Open position on one leg (LONG or SHORT) of a pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub pair: String,

    /// Side of the order that opened the position
    pub side: SideType,
    pub position_side: PositionSide,

    pub avg_price: Decimal,
    pub quantity: Decimal,
    pub leverage: u32,

    /// Quote margin backing the position
    #[serde(default)]
    pub margin: Decimal,

    #[serde(default)]
    pub stop_loss_price: Option<Decimal>,

    /// Flag shared with the entry order and its dependent stop orders
    pub order_flag: String,

    #[serde(default)]
    pub margin_type: MarginType,

    /// Number of add-ons since the position opened
    #[serde(default)]
    pub more_count: u32,

    #[serde(default)]
    pub long_short_ratio: f64,

    #[serde(default)]
    pub matched_strategies: BTreeMap<String, u32>,

    pub status: PositionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// Open a position from a filled entry order.
    pub fn from_fill(order: &Order, fill_price: Decimal, margin: Decimal, at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pair: order.pair.clone(),
            side: order.side,
            position_side: order.position_side,
            avg_price: fill_price,
            quantity: order.quantity,
            leverage: order.leverage.max(1),
            margin,
            stop_loss_price: order.stop_loss_price,
            order_flag: order.order_flag.clone(),
            margin_type: MarginType::Isolated,
            more_count: 0,
            long_short_ratio: order.long_short_ratio,
            matched_strategies: order.matched_strategies.clone(),
            status: PositionStatus::Open,
            created_at: at,
            updated_at: at,
        }
    }

    /// Add to the position (averaging in).
    pub fn add(&mut self, quantity: Decimal, price: Decimal, margin: Decimal, at: DateTime<Utc>) {
        let total_cost = self.avg_price * self.quantity + price * quantity;
        let new_quantity = self.quantity + quantity;

        if !new_quantity.is_zero() {
            self.avg_price = total_cost / new_quantity;
        }

        self.quantity = new_quantity;
        self.margin += margin;
        self.more_count += 1;
        self.updated_at = at;
    }

    /// Reduce the position at `price`. The average price is kept.
    ///
    /// Returns `(closed quantity, released margin, realized pnl)`.
    pub fn reduce(&mut self, quantity: Decimal, price: Decimal, at: DateTime<Utc>) -> (Decimal, Decimal, Decimal) {
        let closed = quantity.min(self.quantity);
        if closed <= Decimal::ZERO || self.quantity.is_zero() {
            return (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO);
        }

        let released = self.margin * closed / self.quantity;
        let realized = self.position_side.sign() * (price - self.avg_price) * closed;

        self.quantity -= closed;
        self.margin -= released;
        self.updated_at = at;

        if self.is_closed() {
            self.status = PositionStatus::Closed;
            self.quantity = Decimal::ZERO;
        }

        (closed, released, realized)
    }

    /// Unrealized P&L in quote at `current_price`.
    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        self.position_side.sign() * (current_price - self.avg_price) * self.quantity
    }

    /// Unrealized P&L as a fraction of margin.
    pub fn profit_ratio(&self, current_price: Decimal) -> Decimal {
        profit_ratio(
            self.position_side,
            self.avg_price,
            current_price,
            self.leverage,
            self.quantity,
        )
    }

    /// Margin implied by entry price, quantity and leverage.
    pub fn initial_margin(&self) -> Decimal {
        self.avg_price * self.quantity / Decimal::from(self.leverage.max(1))
    }

    pub fn is_closed(&self) -> bool {
        self.status == PositionStatus::Closed || self.quantity < Decimal::new(1, 9)
    }

    /// True when `price` has crossed the static stop-loss price.
    pub fn stop_loss_hit(&self, price: Decimal) -> bool {
        match (self.stop_loss_price, self.position_side) {
            (Some(stop), PositionSide::Long) => price <= stop,
            (Some(stop), PositionSide::Short) => price >= stop,
            (None, _) => false,
        }
    }
}
