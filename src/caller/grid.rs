//! Grid mode: entries and add-ons at fixed price levels around a base.
//!
//! A rolling window of candles classifies the market every tick:
//! calm markets trade the grid (NORMAL), a price or volume spike only allows
//! entries that hedge open exposure (HEDGE), and a spike in both closes
//! everything (CLOSE). Positions at their add-on limit freeze the grid
//! (MORE_LIMIT) until the profit lock or a stop releases them.

use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use rust_decimal::Decimal;
use tracing::{debug, info};

use super::core::{position_extra, CallerCore};
use super::signal::NO_CONSENSUS;
use super::sizing::grid_step_quantity;
use crate::config::{GridSetting, PairOption};
use crate::models::{Candle, CloseReason, OrderExtra, Position, PositionGrid};
use crate::sync::SafeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GridState {
    #[default]
    Normal,
    Hedge,
    Close,
    MoreLimit,
}

impl fmt::Display for GridState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            GridState::Normal => "NORMAL",
            GridState::Hedge => "HEDGE",
            GridState::Close => "CLOSE",
            GridState::MoreLimit => "MORE_LIMIT",
        })
    }
}

/// Classify the window by its price change and the last candle's volume
/// against the window mean.
pub fn detect_volatility(window: &[Candle], setting: &GridSetting) -> GridState {
    let (Some(first), Some(last)) = (window.first(), window.last()) else {
        return GridState::Normal;
    };
    if window.len() < 2 || first.close.is_zero() {
        return GridState::Normal;
    }

    let price_change = ((last.close - first.close) / first.close).abs();

    let earlier = &window[..window.len() - 1];
    let mean_volume = earlier.iter().map(|c| c.volume).sum::<Decimal>() / Decimal::from(earlier.len());
    let volume_ratio = if mean_volume > Decimal::ZERO {
        last.volume / mean_volume
    } else {
        Decimal::ZERO
    };

    let price_spike = price_change >= setting.spike_price_ratio;
    let volume_spike = volume_ratio >= setting.spike_volume_ratio;

    match (price_spike, volume_spike) {
        (true, true) => GridState::Close,
        (true, false) | (false, true) => GridState::Hedge,
        (false, false) => GridState::Normal,
    }
}

/// Final state for the tick: CLOSE wins, then the add-on limit.
pub fn grid_state(volatility: GridState, positions: &[Position], option: &PairOption) -> GridState {
    if volatility == GridState::Close {
        return GridState::Close;
    }
    if positions.iter().any(|p| p.more_count >= option.max_add_position) {
        return GridState::MoreLimit;
    }
    volatility
}

#[derive(Debug, Default)]
struct GridBook {
    grid: Option<PositionGrid>,
    state: GridState,
}

pub struct GridCaller {
    pub(super) core: Arc<CallerCore>,
    books: SafeMap<String, GridBook>,
}

impl GridCaller {
    pub fn new(core: Arc<CallerCore>) -> Self {
        Self {
            core,
            books: SafeMap::new(),
        }
    }

    pub async fn on_candle(&self, candle: &Candle) -> Result<()> {
        self.evaluate(&candle.pair).await
    }

    pub async fn event_call_open(&self, pair: &str) -> Result<()> {
        self.evaluate(pair).await
    }

    pub async fn event_call_close(&self, pair: &str) -> Result<()> {
        self.core.event_close(pair).await
    }

    pub async fn state(&self, pair: &str) -> GridState {
        self.books.lock(&pair.to_string()).await.state
    }

    async fn evaluate(&self, pair: &str) -> Result<()> {
        let core = &self.core;
        let _guard = core.lock_pair(pair).await;

        let Some(option) = core.option(pair) else {
            return Ok(());
        };
        let setting = &core.setting().grid;
        let broker = core.broker();
        let price = core.last_price(pair).await?;

        let window = core.sample_window(pair, setting.window).await;
        let positions = broker.get_positions_for_pair(pair).await?;
        let state = grid_state(detect_volatility(&window, setting), &positions, option);

        let mut book = self.books.lock(&pair.to_string()).await;
        if book.state != state {
            info!(pair = %pair, from = %book.state, to = %state, "Grid state changed");
            book.state = state;
        }

        if state == GridState::Close {
            for position in &positions {
                core.finish_locked(position, CloseReason::GridClose, price).await?;
            }
            book.grid = None;
            return Ok(());
        }

        core.close_locked(pair).await?;
        let positions = broker.get_positions_for_pair(pair).await?;

        let rebuild = match &book.grid {
            None => true,
            Some(grid) => !grid.contains(price) || (positions.is_empty() && grid.locked_count() > 0),
        };
        if rebuild {
            let grid = PositionGrid::build(pair, price, setting.step_ratio, setting.levels, core.now());
            info!(pair = %pair, base = %price, lower = %grid.lower, upper = %grid.upper, "Grid rebuilt");
            book.grid = Some(grid);
        }

        if state == GridState::MoreLimit {
            debug!(pair = %pair, "Add-on limit reached, watching");
            return Ok(());
        }
        if !core.is_enabled(pair) {
            return Ok(());
        }

        let Some(grid) = book.grid.as_mut() else {
            return Ok(());
        };
        let Some(idx) = grid.crossed_level(price) else {
            return Ok(());
        };
        let level = grid.items[idx].clone();

        if state == GridState::Hedge && !positions.iter().any(|p| p.position_side == level.position_side.opposite()) {
            debug!(pair = %pair, level = %level.price, "Volatile market, level skipped");
            return Ok(());
        }

        let (_, free_quote) = broker.pair_asset(pair).await?;
        let quantity = grid_step_quantity(free_quote, option, price, setting.levels);
        if quantity.is_zero() {
            return Ok(());
        }

        let order = match positions.iter().find(|p| p.position_side == level.position_side) {
            Some(position) => {
                core.add_market_locked(pair, level.position_side, quantity, position_extra(position, None))
                    .await?
            }
            None => {
                let extra = OrderExtra::new_entry(option.leverage, NO_CONSENSUS);
                let order = core.add_market_locked(pair, level.position_side, quantity, extra).await?;
                if let Some(order) = &order {
                    core.on_market_entry(order).await;
                }
                order
            }
        };

        if let Some(order) = order {
            grid.lock(idx);
            info!(
                pair = %pair,
                flag = %order.order_flag,
                level = %level.price,
                side = %level.position_side,
                quantity = %quantity,
                state = %state,
                "Grid level filled"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::caller::testkit::{flat, Kit};
    use crate::caller::Caller;
    use crate::config::{CallerMode, CallerSetting};
    use crate::models::{PairProfit, PositionSide};
    use rust_decimal_macros::dec;

    fn window(closes: &[Decimal], last_volume: Decimal) -> Vec<Candle> {
        let mut candles: Vec<Candle> = closes
            .iter()
            .enumerate()
            .map(|(i, close)| flat(i as i64, *close))
            .collect();
        if let Some(last) = candles.last_mut() {
            last.volume = last_volume;
        }
        candles
    }

    #[test]
    fn test_detect_volatility() {
        let setting = GridSetting::default();

        let calm = window(&[dec!(100), dec!(100.5), dec!(101)], dec!(1));
        assert_eq!(detect_volatility(&calm, &setting), GridState::Normal);

        let price_spike = window(&[dec!(100), dec!(102), dec!(104)], dec!(1));
        assert_eq!(detect_volatility(&price_spike, &setting), GridState::Hedge);

        let volume_spike = window(&[dec!(100), dec!(100), dec!(100)], dec!(5));
        assert_eq!(detect_volatility(&volume_spike, &setting), GridState::Hedge);

        let both = window(&[dec!(100), dec!(97), dec!(95)], dec!(4));
        assert_eq!(detect_volatility(&both, &setting), GridState::Close);

        assert_eq!(detect_volatility(&[], &setting), GridState::Normal);
    }

    #[tokio::test]
    async fn test_more_limit_blocks_add_on() {
        let setting = CallerSetting {
            mode: CallerMode::Grid,
            ..Default::default()
        };
        let option = PairOption {
            max_add_position: 1,
            ..PairOption::new("BTCUSDT")
        };
        let kit = Kit::with_option(setting, option);
        let caller = Caller::new(CallerMode::Grid, kit.core.clone(), None).unwrap();

        // builds the grid around 100 (levels every 0.5%)
        kit.feed(&caller, &flat(0, dec!(100))).await;
        assert!(kit.engine.get_positions_for_pair("BTCUSDT").await.unwrap().is_empty());

        // crosses 99.5: opens LONG
        kit.feed(&caller, &flat(1, dec!(99.4))).await;
        let positions = kit.engine.get_positions_for_pair("BTCUSDT").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].more_count, 0);

        // crosses 99: add-on, now at the limit
        kit.feed(&caller, &flat(2, dec!(98.9))).await;
        let positions = kit.engine.get_positions_for_pair("BTCUSDT").await.unwrap();
        assert_eq!(positions[0].more_count, 1);
        let orders_before = kit.engine.orders().await.len();

        // crosses 98.5: MORE_LIMIT, no further add-on
        kit.feed(&caller, &flat(3, dec!(98.4))).await;
        assert_eq!(kit.engine.orders().await.len(), orders_before);
        if let Caller::Grid(grid) = &caller {
            assert_eq!(grid.state("BTCUSDT").await, GridState::MoreLimit);
        }
    }

    #[tokio::test]
    async fn test_each_leg_keeps_its_own_lock() {
        let setting = CallerSetting {
            mode: CallerMode::Grid,
            ..Default::default()
        };
        let kit = Kit::new(setting);
        let caller = Caller::new(CallerMode::Grid, kit.core.clone(), None).unwrap();

        kit.feed(&caller, &flat(0, dec!(100))).await;
        kit.feed(&caller, &flat(1, dec!(99.4))).await;

        // LONG from 99.4 arms its lock, then 100.5 is crossed and SHORT opens
        kit.feed(&caller, &flat(2, dec!(100.6))).await;
        let positions = kit.engine.get_positions_for_pair("BTCUSDT").await.unwrap();
        assert_eq!(positions.len(), 2);
        let long = kit.core.leg_profit("BTCUSDT", PositionSide::Long).await;
        assert!(long.is_lock);
        assert!(long.close > Decimal::ZERO);

        // the break-even SHORT is not held to the LONG's lock
        kit.feed(&caller, &flat(3, dec!(100.6))).await;
        assert!(kit.engine.trades().await.is_empty());
        assert_eq!(kit.engine.get_positions_for_pair("BTCUSDT").await.unwrap().len(), 2);
        assert_eq!(kit.core.leg_profit("BTCUSDT", PositionSide::Long).await, long);
        assert_eq!(kit.core.leg_profit("BTCUSDT", PositionSide::Short).await, PairProfit::default());
    }

    #[test]
    fn test_grid_state_precedence() {
        let option = PairOption {
            max_add_position: 0,
            ..PairOption::new("BTCUSDT")
        };
        assert_eq!(grid_state(GridState::Hedge, &[], &option), GridState::Hedge);
        assert_eq!(grid_state(GridState::Close, &[], &option), GridState::Close);
    }
}
