//! Order sizing and stop placement.

use rust_decimal::{Decimal, RoundingStrategy};

use crate::config::PairOption;
use crate::models::PositionSide;

/// Truncate a quantity to `precision` decimal places.
pub fn round_down(quantity: Decimal, precision: u32) -> Decimal {
    quantity
        .round_dp_with_strategy(precision, RoundingStrategy::ToZero)
        .normalize()
}

/// Entry size: `free_quote × max_margin_ratio × leverage / price`, rounded
/// down to the pair's precision.
pub fn entry_quantity(free_quote: Decimal, option: &PairOption, price: Decimal) -> Decimal {
    if price <= Decimal::ZERO || free_quote <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let notional = free_quote * option.max_margin_ratio * option.leverage_decimal();
    round_down(notional / price, option.quantity_precision)
}

/// Add-on size when scaling into a profitable position.
pub fn scale_in_quantity(position_quantity: Decimal, option: &PairOption) -> Decimal {
    if option.profitable_scale <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    round_down(position_quantity * option.profitable_scale, option.quantity_precision)
}

/// Quantity per grid level: the entry budget spread across the levels.
pub fn grid_step_quantity(free_quote: Decimal, option: &PairOption, price: Decimal, levels: u32) -> Decimal {
    if levels == 0 {
        return Decimal::ZERO;
    }
    let budget = entry_quantity(free_quote, option, price);
    round_down(budget / Decimal::from(levels), option.quantity_precision)
}

/// Largest quantity whose margin fits in `free_quote × max_margin_ratio`.
pub fn cap_by_margin(quantity: Decimal, free_quote: Decimal, option: &PairOption, price: Decimal) -> Decimal {
    round_down(quantity.min(entry_quantity(free_quote, option, price)), option.quantity_precision)
}

/// Stop one ATR away from the entry, on the losing side.
pub fn stop_loss_price(position_side: PositionSide, price: Decimal, atr: Decimal) -> Option<Decimal> {
    if atr <= Decimal::ZERO {
        return None;
    }
    let stop = price - position_side.sign() * atr;
    (stop > Decimal::ZERO).then_some(stop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_entry_quantity() {
        let option = PairOption::new("BTCUSDT");
        // 1000 × 0.1 × 10 / 300 = 3.3333..
        assert_eq!(entry_quantity(dec!(1000), &option, dec!(300)), dec!(3.333));
        assert_eq!(entry_quantity(dec!(1000), &option, Decimal::ZERO), Decimal::ZERO);
        assert_eq!(entry_quantity(dec!(0.001), &option, dec!(50000)), Decimal::ZERO);
    }

    #[test]
    fn test_scale_and_grid() {
        let option = PairOption::new("BTCUSDT");
        assert_eq!(scale_in_quantity(dec!(1.5), &option), dec!(0.75));
        assert_eq!(grid_step_quantity(dec!(1000), &option, dec!(100), 4), dec!(2.5));
        assert_eq!(cap_by_margin(dec!(50), dec!(1000), &option, dec!(100)), dec!(10));
    }

    #[test]
    fn test_stop_loss_price() {
        assert_eq!(stop_loss_price(PositionSide::Long, dec!(100), dec!(2)), Some(dec!(98)));
        assert_eq!(stop_loss_price(PositionSide::Short, dec!(100), dec!(2)), Some(dec!(102)));
        assert_eq!(stop_loss_price(PositionSide::Long, dec!(100), Decimal::ZERO), None);
    }
}
