//! Dual mode: LONG and SHORT legs held together.
//!
//! The larger leg is the main leg. Both legs share one order flag, one hold
//! window and one profit lock driven by their combined profit ratio. When the
//! main leg runs into a loss the sub leg is topped up as a hedge.

use std::sync::Arc;

use anyhow::Result;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::core::{position_extra, CallerCore};
use super::profit::{CloseCheck, CloseDecision};
use super::signal::summarize;
use super::sizing::{cap_by_margin, entry_quantity, round_down};
use crate::config::{DualSetting, PairOption};
use crate::models::{Candle, OrderExtra, Position, PositionSide};

/// Split open legs into `(main, sub)`: main is the larger quantity, LONG on
/// a tie.
pub fn judge_position(positions: &[Position]) -> (Option<&Position>, Option<&Position>) {
    let long = positions.iter().find(|p| p.position_side == PositionSide::Long);
    let short = positions.iter().find(|p| p.position_side == PositionSide::Short);

    match (long, short) {
        (Some(long), Some(short)) if short.quantity > long.quantity => (Some(short), Some(long)),
        (Some(long), Some(short)) => (Some(long), Some(short)),
        (Some(only), None) | (None, Some(only)) => (Some(only), None),
        (None, None) => (None, None),
    }
}

/// Combined unrealized P&L of all legs over their combined margin.
pub fn combined_profit_ratio(positions: &[Position], price: Decimal) -> Decimal {
    let margin: Decimal = positions
        .iter()
        .map(|p| if p.margin > Decimal::ZERO { p.margin } else { p.initial_margin() })
        .sum();
    if margin.is_zero() {
        return Decimal::ZERO;
    }
    positions.iter().map(|p| p.unrealized_pnl(price)).sum::<Decimal>() / margin
}

/// Sub-leg top-up when the main leg's loss passes the hedge trigger:
/// a share of the quantity gap, bounded by the entry margin budget.
pub fn hedge_quantity(
    main: &Position,
    sub: Option<&Position>,
    price: Decimal,
    free_quote: Decimal,
    option: &PairOption,
    setting: &DualSetting,
) -> Decimal {
    if main.profit_ratio(price) > -setting.hedge_trigger_ratio {
        return Decimal::ZERO;
    }
    if sub.is_some_and(|s| s.more_count >= option.max_add_position) {
        return Decimal::ZERO;
    }

    let gap = main.quantity - sub.map_or(Decimal::ZERO, |s| s.quantity);
    if gap <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let quantity = round_down(gap * setting.hedge_scale, option.quantity_precision);
    cap_by_margin(quantity, free_quote, option, price)
}

pub struct DualCaller {
    pub(super) core: Arc<CallerCore>,
}

impl DualCaller {
    pub fn new(core: Arc<CallerCore>) -> Self {
        Self { core }
    }

    pub async fn on_candle(&self, candle: &Candle) -> Result<()> {
        self.event_call_close(&candle.pair).await?;
        if candle.complete {
            self.event_call_open(&candle.pair).await?;
        }
        Ok(())
    }

    /// Open both legs when flat: the signalled side at full size, the other
    /// at `hedge_scale` of it.
    pub async fn event_call_open(&self, pair: &str) -> Result<()> {
        let core = &self.core;
        let _guard = core.lock_pair(pair).await;

        let Some(option) = core.option(pair) else {
            return Ok(());
        };
        if !core.is_enabled(pair) {
            return Ok(());
        }

        let broker = core.broker();
        if !broker.get_positions_for_pair(pair).await?.is_empty() {
            return Ok(());
        }
        let unfilled = broker.get_position_orders_for_pair_unfilled(pair).await?;
        if unfilled.iter().any(|o| o.is_entry()) {
            return Ok(());
        }

        let signals = core.signals(pair).await;
        let Some(summary) = summarize(&signals) else {
            debug!(pair = %pair, "No consensus for dual entry");
            return Ok(());
        };

        let price = core.last_price(pair).await?;
        let (_, free_quote) = broker.pair_asset(pair).await?;
        let main_quantity = entry_quantity(free_quote, option, price);
        if main_quantity.is_zero() {
            return Ok(());
        }
        let dual = &core.setting().dual;
        let sub_quantity = round_down(main_quantity * dual.hedge_scale, option.quantity_precision);

        let main_side = summary.side.opening_position_side();
        let mut extra = OrderExtra::new_entry(option.leverage, summary.ratio);
        extra.matched_strategies = summary.matched_strategies;

        let Some(main_order) = core.add_market_locked(pair, main_side, main_quantity, extra.clone()).await? else {
            return Ok(());
        };
        core.on_market_entry(&main_order).await;
        core.reset_profit(pair);

        if sub_quantity > Decimal::ZERO {
            core.add_market_locked(pair, main_side.opposite(), sub_quantity, extra).await?;
        }

        info!(
            pair = %pair,
            flag = %main_order.order_flag,
            main = %main_side,
            main_quantity = %main_quantity,
            sub_quantity = %sub_quantity,
            ratio = summary.ratio,
            "Opened dual legs"
        );
        Ok(())
    }

    /// Profit lock over the combined legs, then hedge the losing main leg.
    pub async fn event_call_close(&self, pair: &str) -> Result<()> {
        let core = &self.core;
        let _guard = core.lock_pair(pair).await;

        let Some(option) = core.option(pair) else {
            return Ok(());
        };
        let broker = core.broker();
        let positions = broker.get_positions_for_pair(pair).await?;
        core.release_closed_locks(pair, &positions);
        let (Some(main), sub) = judge_position(&positions) else {
            return Ok(());
        };
        let price = core.last_price(pair).await?;

        let ratio = combined_profit_ratio(&positions, price);
        let check = CloseCheck {
            ratio,
            now: core.now(),
            deadline: Some(core.deadline_for(main).await),
            max_margin_loss_ratio: option.max_margin_loss_ratio,
            stop_loss_hit: false,
        };

        match core.decide_close(pair, &check).await {
            CloseDecision::Finish(reason) => {
                for leg in &positions {
                    core.finish_locked(leg, reason, price).await?;
                }
                core.reset_profit(pair);
                return Ok(());
            }
            CloseDecision::Ratchet => {
                core.extend_deadline(main).await;
                let profit = core.pair_profit(pair).await;
                info!(
                    pair = %pair,
                    flag = %main.order_flag,
                    ratio = %ratio,
                    close = %profit.close,
                    "Dual profit lock ratcheted"
                );
                return Ok(());
            }
            CloseDecision::Watch | CloseDecision::Hold => {}
        }

        let (_, free_quote) = broker.pair_asset(pair).await?;
        let quantity = hedge_quantity(main, sub, price, free_quote, option, &core.setting().dual);
        if quantity.is_zero() {
            return Ok(());
        }

        let extra = position_extra(sub.unwrap_or(main), None);
        let hedge_side = main.position_side.opposite();
        if core.add_market_locked(pair, hedge_side, quantity, extra).await?.is_some() {
            info!(
                pair = %pair,
                main = %main.position_side,
                main_ratio = %main.profit_ratio(price),
                hedge_quantity = %quantity,
                "Hedged main leg"
            );
        }
        Ok(())
    }
}
