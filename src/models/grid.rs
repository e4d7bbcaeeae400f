//! Price ladder used by grid mode.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::order::{PositionSide, SideType};

/// One grid level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionGridItem {
    pub price: Decimal,
    pub side: SideType,
    pub position_side: PositionSide,

    /// Set once a position has been opened or added at this level
    pub locked: bool,
}

/// Ladder of levels around a base price, ascending by price.
/// Levels below the base buy LONG, levels above sell SHORT.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionGrid {
    pub pair: String,
    pub base_price: Decimal,
    pub step_ratio: Decimal,
    pub upper: Decimal,
    pub lower: Decimal,
    pub items: Vec<PositionGridItem>,
    pub created_at: DateTime<Utc>,
}

impl PositionGrid {
    pub fn build(pair: &str, base_price: Decimal, step_ratio: Decimal, levels: u32, at: DateTime<Utc>) -> Self {
        let mut items = Vec::with_capacity(levels as usize * 2);

        for k in (1..=levels).rev() {
            let offset = step_ratio * Decimal::from(k);
            items.push(PositionGridItem {
                price: base_price * (Decimal::ONE - offset),
                side: SideType::Buy,
                position_side: PositionSide::Long,
                locked: false,
            });
        }
        for k in 1..=levels {
            let offset = step_ratio * Decimal::from(k);
            items.push(PositionGridItem {
                price: base_price * (Decimal::ONE + offset),
                side: SideType::Sell,
                position_side: PositionSide::Short,
                locked: false,
            });
        }

        let edge = step_ratio * Decimal::from(levels + 1);
        Self {
            pair: pair.to_string(),
            base_price,
            step_ratio,
            upper: base_price * (Decimal::ONE + edge),
            lower: base_price * (Decimal::ONE - edge),
            items,
            created_at: at,
        }
    }

    /// True while `price` stays inside the grid boundary.
    pub fn contains(&self, price: Decimal) -> bool {
        price >= self.lower && price <= self.upper
    }

    /// Nearest unlocked level that `price` has reached.
    pub fn crossed_level(&self, price: Decimal) -> Option<usize> {
        let long = self
            .items
            .iter()
            .enumerate()
            .filter(|(_, item)| !item.locked && item.position_side == PositionSide::Long && price <= item.price)
            .max_by(|a, b| a.1.price.cmp(&b.1.price))
            .map(|(idx, _)| idx);
        if long.is_some() {
            return long;
        }

        self.items
            .iter()
            .enumerate()
            .filter(|(_, item)| !item.locked && item.position_side == PositionSide::Short && price >= item.price)
            .min_by(|a, b| a.1.price.cmp(&b.1.price))
            .map(|(idx, _)| idx)
    }

    pub fn lock(&mut self, idx: usize) {
        if let Some(item) = self.items.get_mut(idx) {
            item.locked = true;
        }
    }

    pub fn locked_count(&self) -> usize {
        self.items.iter().filter(|i| i.locked).count()
    }
}
