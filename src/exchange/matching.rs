//! Paper exchange: a simulated futures wallet that fills orders against
//! candles the way the venue would.
//!
//! Entries reserve `price × quantity / leverage` plus fee from the free quote
//! balance when they are created. Market orders fill at the last close right
//! away; resting orders are matched on every candle. Exits are reduce-only.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::broker::{Broker, BrokerError, BrokerResult};
use crate::config::ExchangeSetting;
use crate::models::{
    split_pair, Account, AssetBalance, Candle, CloseReason, Order, OrderExtra, OrderStatus,
    OrderType, Position, PositionSide, SideType,
};

/// One exit fill against a position.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedTrade {
    pub pair: String,
    pub position_side: PositionSide,
    pub order_flag: String,
    pub entry_price: Decimal,
    pub exit_price: Decimal,
    pub quantity: Decimal,
    pub margin: Decimal,

    /// Realized P&L net of the exit fee
    pub pnl: Decimal,
    pub fee: Decimal,
    pub reason: Option<CloseReason>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
}

impl ClosedTrade {
    /// P&L as a fraction of the margin released by the fill.
    pub fn return_ratio(&self) -> Decimal {
        if self.margin.is_zero() {
            Decimal::ZERO
        } else {
            self.pnl / self.margin
        }
    }
}

#[derive(Debug, Default)]
struct EngineState {
    quote: AssetBalance,
    orders: Vec<Order>,
    positions: HashMap<(String, PositionSide), Position>,
    last_candle: HashMap<String, Candle>,
    volume: HashMap<String, Decimal>,
    trades: Vec<ClosedTrade>,
    equity_curve: Vec<(DateTime<Utc>, Decimal)>,
    total_fees: Decimal,
    now: Option<DateTime<Utc>>,
}

impl EngineState {
    fn now(&self) -> DateTime<Utc> {
        self.now.unwrap_or_else(Utc::now)
    }

    fn last_close(&self, pair: &str) -> BrokerResult<Decimal> {
        self.last_candle
            .get(pair)
            .map(|c| c.close)
            .ok_or_else(|| BrokerError::NoMarketData(pair.to_string()))
    }

    fn equity(&self) -> Decimal {
        let unrealized: Decimal = self
            .positions
            .values()
            .map(|p| {
                let price = self.last_candle.get(&p.pair).map(|c| c.close).unwrap_or(p.avg_price);
                p.unrealized_pnl(price).max(-p.margin)
            })
            .sum();
        self.quote.total() + unrealized
    }

    /// Hold margin and fee for a new entry, or reject it untouched.
    fn reserve(&mut self, order: &mut Order, price: Decimal, fee_rate: Decimal, asset: &str) -> BrokerResult<()> {
        let margin = price * order.quantity / Decimal::from(order.leverage.max(1));
        let fee = price * order.quantity * fee_rate;
        let required = margin + fee;

        if self.quote.free < required {
            return Err(BrokerError::InsufficientFunds {
                pair: order.pair.clone(),
                asset: asset.to_string(),
                quantity: order.quantity,
                required,
                available: self.quote.free,
            });
        }

        self.quote.free -= required;
        self.quote.lock += required;
        order.locked_margin = margin;
        order.fee = fee;
        Ok(())
    }

    fn release(&mut self, order: &mut Order) {
        let held = order.locked_margin + order.fee;
        self.quote.lock -= held;
        self.quote.free += held;
        order.locked_margin = Decimal::ZERO;
        order.fee = Decimal::ZERO;
    }

    fn fill_entry(&mut self, order: &mut Order, price: Decimal, fee_rate: Decimal, at: DateTime<Utc>) {
        self.release(order);

        let margin = price * order.quantity / Decimal::from(order.leverage.max(1));
        let fee = price * order.quantity * fee_rate;
        self.quote.free -= margin + fee;
        self.quote.lock += margin;
        self.total_fees += fee;
        *self.volume.entry(order.pair.clone()).or_default() += price * order.quantity;

        let key = (order.pair.clone(), order.position_side);
        match self.positions.get_mut(&key) {
            Some(position) => position.add(order.quantity, price, margin, at),
            None => {
                self.positions.insert(key, Position::from_fill(order, price, margin, at));
            }
        }

        order.status = OrderStatus::Filled;
        order.executed_quantity = order.quantity;
        order.price = price;
        order.locked_margin = margin;
        order.fee = fee;
        order.updated_at = at;

        debug!(
            pair = %order.pair,
            flag = %order.order_flag,
            side = %order.side,
            quantity = %order.quantity,
            price = %price,
            "Entry filled"
        );
    }

    /// Reduce the position the exit belongs to. Stops must match the
    /// position's flag; a stop whose position is gone is cancelled.
    fn fill_exit(&mut self, order: &mut Order, price: Decimal, fee_rate: Decimal, at: DateTime<Utc>) {
        let key = (order.pair.clone(), order.position_side);
        let by_flag = order.order_type != OrderType::Market;

        let Some(position) = self
            .positions
            .get_mut(&key)
            .filter(|p| !by_flag || p.order_flag == order.order_flag)
        else {
            warn!(pair = %order.pair, flag = %order.order_flag, order_id = %order.id, "No position for exit, cancelling");
            order.status = OrderStatus::Canceled;
            order.updated_at = at;
            return;
        };

        let entry_price = position.avg_price;
        let opened_at = position.created_at;
        let (closed, released, realized) = position.reduce(order.quantity, price, at);
        let fully_closed = position.is_closed();

        // isolated margin: the loss stops at the margin released, and the
        // fee at what is left of the wallet
        let realized = realized.max(-released);
        let fee = (price * closed * fee_rate).min((self.quote.free + released + realized).max(Decimal::ZERO));

        self.quote.lock -= released;
        self.quote.free += released + realized - fee;
        self.total_fees += fee;
        *self.volume.entry(order.pair.clone()).or_default() += price * closed;

        if fully_closed {
            self.positions.remove(&key);
        }

        self.trades.push(ClosedTrade {
            pair: order.pair.clone(),
            position_side: order.position_side,
            order_flag: order.order_flag.clone(),
            entry_price,
            exit_price: price,
            quantity: closed,
            margin: released,
            pnl: realized - fee,
            fee,
            reason: order.close_reason,
            opened_at,
            closed_at: at,
        });

        order.status = OrderStatus::Filled;
        order.executed_quantity = closed;
        order.price = price;
        order.fee = fee;
        order.updated_at = at;

        debug!(
            pair = %order.pair,
            flag = %order.order_flag,
            quantity = %closed,
            price = %price,
            pnl = %(realized - fee),
            fully_closed,
            "Exit filled"
        );
    }
}

/// Price a resting order fills at on this candle, if it triggers.
fn trigger_price(order: &Order, candle: &Candle) -> Option<Decimal> {
    match order.order_type {
        OrderType::Market => None,
        OrderType::Limit => {
            let hit = match order.side {
                SideType::Buy => candle.close <= order.price,
                SideType::Sell => candle.close >= order.price,
            };
            hit.then_some(order.price)
        }
        OrderType::StopMarket | OrderType::StopLimit => {
            let stop = order.stop_price?;
            let hit = match order.side {
                // SELL stops close a LONG (or break down into a SHORT)
                SideType::Sell => candle.low <= stop,
                SideType::Buy => candle.high >= stop,
            };
            let fill = if order.order_type == OrderType::StopLimit {
                order.price
            } else {
                stop
            };
            hit.then_some(fill)
        }
    }
}

/// Simulated futures wallet implementing [`Broker`].
pub struct MatchingEngine {
    quote_asset: String,
    initial_balance: Decimal,
    maker_fee_rate: Decimal,
    taker_fee_rate: Decimal,
    state: RwLock<EngineState>,
}

impl MatchingEngine {
    pub fn new(setting: &ExchangeSetting) -> Self {
        let state = EngineState {
            quote: AssetBalance {
                free: setting.initial_balance,
                lock: Decimal::ZERO,
            },
            ..Default::default()
        };
        Self {
            quote_asset: setting.quote_asset.clone(),
            initial_balance: setting.initial_balance,
            maker_fee_rate: setting.maker_fee_rate,
            taker_fee_rate: setting.taker_fee_rate,
            state: RwLock::new(state),
        }
    }

    pub fn initial_balance(&self) -> Decimal {
        self.initial_balance
    }

    /// Match resting orders for the candle's pair. Late candles are dropped.
    pub async fn on_candle(&self, candle: &Candle) {
        let mut state = self.state.write().await;

        if let Some(last) = state.last_candle.get(&candle.pair) {
            if candle.time < last.time {
                warn!(pair = %candle.pair, time = %candle.time, last = %last.time, "Late candle dropped");
                return;
            }
        }
        state.last_candle.insert(candle.pair.clone(), candle.clone());
        state.now = Some(state.now.map_or(candle.time, |now| now.max(candle.time)));
        let at = candle.time;

        let triggered: Vec<(usize, Decimal)> = state
            .orders
            .iter()
            .enumerate()
            .filter(|(_, o)| o.pair == candle.pair && o.status == OrderStatus::New)
            .filter_map(|(idx, o)| trigger_price(o, candle).map(|price| (idx, price)))
            .collect();

        for (idx, price) in triggered {
            let mut order = state.orders[idx].clone();
            if order.is_entry() {
                state.fill_entry(&mut order, price, self.maker_fee_rate, at);
            } else {
                state.fill_exit(&mut order, price, self.maker_fee_rate, at);
            }
            state.orders[idx] = order;
        }

        let equity = state.equity();
        state.equity_curve.push((at, equity));
    }

    /// Quote balance plus unrealized P&L at the last closes.
    pub async fn equity(&self) -> Decimal {
        self.state.read().await.equity()
    }

    pub async fn quote_balance(&self) -> AssetBalance {
        self.state.read().await.quote
    }

    pub async fn trades(&self) -> Vec<ClosedTrade> {
        self.state.read().await.trades.clone()
    }

    pub async fn equity_curve(&self) -> Vec<(DateTime<Utc>, Decimal)> {
        self.state.read().await.equity_curve.clone()
    }

    pub async fn orders(&self) -> Vec<Order> {
        self.state.read().await.orders.clone()
    }

    pub async fn open_positions(&self) -> Vec<Position> {
        self.state.read().await.positions.values().cloned().collect()
    }

    pub async fn volume(&self, pair: &str) -> Decimal {
        self.state.read().await.volume.get(pair).copied().unwrap_or_default()
    }

    pub async fn total_fees(&self) -> Decimal {
        self.state.read().await.total_fees
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_order(
        &self,
        order_type: OrderType,
        side: SideType,
        position_side: PositionSide,
        pair: &str,
        quantity: Decimal,
        price: Option<Decimal>,
        stop_price: Option<Decimal>,
        extra: OrderExtra,
    ) -> BrokerResult<Order> {
        if quantity <= Decimal::ZERO {
            return Err(BrokerError::InvalidQuantity {
                pair: pair.to_string(),
                quantity,
            });
        }

        let mut state = self.state.write().await;
        let at = state.now();
        let price = match (order_type, price, stop_price) {
            (OrderType::Market, _, _) => state.last_close(pair)?,
            (_, Some(price), _) => price,
            (_, None, Some(stop)) => stop,
            (_, None, None) => state.last_close(pair)?,
        };

        let mut order = Order::new(pair, side, position_side, order_type, quantity, price, stop_price, extra, at);
        let (asset, _) = split_pair(pair);

        if order.is_entry() {
            let fee_rate = if order_type == OrderType::Market {
                self.taker_fee_rate
            } else {
                self.maker_fee_rate
            };
            state.reserve(&mut order, price, fee_rate, &self.quote_asset)?;
            if order_type == OrderType::Market {
                state.fill_entry(&mut order, price, self.taker_fee_rate, at);
            }
        } else {
            // reduce-only: clamp to what is open
            let open = state
                .positions
                .get(&(pair.to_string(), position_side))
                .map(|p| p.quantity)
                .ok_or_else(|| BrokerError::PositionNotFound(order.order_flag.clone()))?;
            order.quantity = order.quantity.min(open);
            if order_type == OrderType::Market {
                state.fill_exit(&mut order, price, self.taker_fee_rate, at);
            }
        }

        info!(
            pair = %pair,
            asset = %asset,
            order_id = %order.id,
            order_type = order_type.as_str(),
            side = %side,
            position_side = %position_side,
            quantity = %order.quantity,
            price = %order.price,
            status = order.status.as_str(),
            "Order accepted"
        );

        state.orders.push(order.clone());
        Ok(order)
    }
}

#[async_trait]
impl Broker for MatchingEngine {
    async fn account(&self) -> BrokerResult<Account> {
        let state = self.state.read().await;
        let mut account = Account::default();
        account.balances.insert(self.quote_asset.clone(), state.quote);

        for position in state.positions.values() {
            let (asset, _) = split_pair(&position.pair);
            let balance = account.balances.entry(asset).or_default();
            balance.free += position.position_side.sign() * position.quantity;
        }
        Ok(account)
    }

    async fn position(&self, pair: &str) -> BrokerResult<(Decimal, Decimal)> {
        let state = self.state.read().await;
        Ok((net_quantity(&state, pair), state.quote.total()))
    }

    async fn pair_asset(&self, pair: &str) -> BrokerResult<(Decimal, Decimal)> {
        let state = self.state.read().await;
        Ok((net_quantity(&state, pair), state.quote.free))
    }

    async fn create_order_limit(
        &self,
        side: SideType,
        position_side: PositionSide,
        pair: &str,
        quantity: Decimal,
        price: Decimal,
        extra: OrderExtra,
    ) -> BrokerResult<Order> {
        self.create_order(OrderType::Limit, side, position_side, pair, quantity, Some(price), None, extra)
            .await
    }

    async fn create_order_market(
        &self,
        side: SideType,
        position_side: PositionSide,
        pair: &str,
        quantity: Decimal,
        extra: OrderExtra,
    ) -> BrokerResult<Order> {
        self.create_order(OrderType::Market, side, position_side, pair, quantity, None, None, extra)
            .await
    }

    async fn create_order_stop_limit(
        &self,
        side: SideType,
        position_side: PositionSide,
        pair: &str,
        quantity: Decimal,
        price: Decimal,
        stop_price: Decimal,
        extra: OrderExtra,
    ) -> BrokerResult<Order> {
        self.create_order(
            OrderType::StopLimit,
            side,
            position_side,
            pair,
            quantity,
            Some(price),
            Some(stop_price),
            extra,
        )
        .await
    }

    async fn create_order_stop_market(
        &self,
        side: SideType,
        position_side: PositionSide,
        pair: &str,
        quantity: Decimal,
        stop_price: Decimal,
        extra: OrderExtra,
    ) -> BrokerResult<Order> {
        self.create_order(
            OrderType::StopMarket,
            side,
            position_side,
            pair,
            quantity,
            None,
            Some(stop_price),
            extra,
        )
        .await
    }

    async fn cancel(&self, order: &Order) -> BrokerResult<()> {
        let mut state = self.state.write().await;
        let at = state.now();
        let idx = state
            .orders
            .iter()
            .position(|o| o.id == order.id)
            .ok_or_else(|| BrokerError::OrderNotFound(order.id.clone()))?;

        let mut stored = state.orders[idx].clone();
        if !stored.status.is_open() {
            return Ok(());
        }
        if stored.is_entry() {
            state.release(&mut stored);
        }
        stored.status = OrderStatus::Canceled;
        stored.updated_at = at;
        state.orders[idx] = stored;

        debug!(pair = %order.pair, order_id = %order.id, "Order cancelled");
        Ok(())
    }

    async fn get_positions_for_pair(&self, pair: &str) -> BrokerResult<Vec<Position>> {
        let state = self.state.read().await;
        let mut positions: Vec<Position> = [PositionSide::Long, PositionSide::Short]
            .into_iter()
            .filter_map(|side| state.positions.get(&(pair.to_string(), side)).cloned())
            .collect();
        positions.retain(|p| !p.is_closed());
        Ok(positions)
    }

    async fn get_orders_for_position_loss_unfilled(&self, order_flag: &str) -> BrokerResult<Vec<Order>> {
        let state = self.state.read().await;
        Ok(state
            .orders
            .iter()
            .filter(|o| {
                o.status.is_open() && o.order_flag == order_flag && o.order_type.is_stop() && !o.is_entry()
            })
            .cloned()
            .collect())
    }

    async fn get_position_orders_for_pair_unfilled(&self, pair: &str) -> BrokerResult<Vec<Order>> {
        let state = self.state.read().await;
        Ok(state
            .orders
            .iter()
            .filter(|o| o.status.is_open() && o.pair == pair)
            .cloned()
            .collect())
    }

    async fn get_orders_for_unfilled(&self) -> BrokerResult<Vec<Order>> {
        let state = self.state.read().await;
        Ok(state.orders.iter().filter(|o| o.status.is_open()).cloned().collect())
    }
}

fn net_quantity(state: &EngineState, pair: &str) -> Decimal {
    state
        .positions
        .values()
        .filter(|p| p.pair == pair)
        .map(|p| p.position_side.sign() * p.quantity)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn engine(balance: Decimal) -> MatchingEngine {
        MatchingEngine::new(&ExchangeSetting {
            initial_balance: balance,
            ..Default::default()
        })
    }

    fn candle(minute: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            pair: "BTCUSDT".to_string(),
            timeframe: "1m".to_string(),
            time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute),
            open,
            high,
            low,
            close,
            volume: dec!(1),
            complete: true,
        }
    }

    fn flat(minute: i64, price: Decimal) -> Candle {
        candle(minute, price, price, price, price)
    }

    /// Context for follow-up orders on the position `order` opened.
    fn follow_up(order: &Order) -> OrderExtra {
        OrderExtra {
            order_flag: order.order_flag.clone(),
            leverage: order.leverage,
            long_short_ratio: order.long_short_ratio,
            matched_strategies: order.matched_strategies.clone(),
            stop_loss_price: order.stop_loss_price,
            close_reason: None,
        }
    }

    #[tokio::test]
    async fn test_market_entry_locks_margin_and_fee() {
        let engine = engine(dec!(10000));
        engine.on_candle(&flat(0, dec!(100))).await;

        let order = engine
            .create_order_market(SideType::Buy, PositionSide::Long, "BTCUSDT", dec!(1), OrderExtra::new_entry(10, 0.8))
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Filled);

        // margin 10, taker fee 0.04
        let quote = engine.quote_balance().await;
        assert_eq!(quote.lock, dec!(10));
        assert_eq!(quote.free, dec!(9989.96));
        assert!(quote.total() <= dec!(10000));

        let positions = engine.get_positions_for_pair("BTCUSDT").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].avg_price, dec!(100));
        assert_eq!(positions[0].order_flag, order.order_flag);
    }

    #[tokio::test]
    async fn test_insufficient_funds_rejected_untouched() {
        let engine = engine(dec!(5));
        engine.on_candle(&flat(0, dec!(100))).await;

        let err = engine
            .create_order_limit(
                SideType::Buy,
                PositionSide::Long,
                "BTCUSDT",
                dec!(1),
                dec!(100),
                OrderExtra::new_entry(10, 0.8),
            )
            .await
            .unwrap_err();

        match err {
            BrokerError::InsufficientFunds { required, available, .. } => {
                assert_eq!(required, dec!(10.02));
                assert_eq!(available, dec!(5));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(engine.quote_balance().await.free, dec!(5));
        assert!(engine.get_orders_for_unfilled().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_limit_entry_fills_when_close_crosses() {
        let engine = engine(dec!(10000));
        engine.on_candle(&flat(0, dec!(100))).await;

        let order = engine
            .create_order_limit(
                SideType::Buy,
                PositionSide::Long,
                "BTCUSDT",
                dec!(1),
                dec!(99),
                OrderExtra::new_entry(10, 0.8),
            )
            .await
            .unwrap();
        assert_eq!(engine.quote_balance().await.lock, dec!(9.9198));

        // low touches but close stays above
        engine.on_candle(&candle(1, dec!(100), dec!(100), dec!(98), dec!(99.5))).await;
        assert!(engine.get_positions_for_pair("BTCUSDT").await.unwrap().is_empty());

        engine.on_candle(&flat(2, dec!(98.5))).await;
        let positions = engine.get_positions_for_pair("BTCUSDT").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].avg_price, dec!(99));

        let stored = engine.orders().await.into_iter().find(|o| o.id == order.id).unwrap();
        assert_eq!(stored.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn test_stop_fills_only_when_low_reaches() {
        let engine = engine(dec!(10000));
        engine.on_candle(&flat(0, dec!(100))).await;
        let entry = engine
            .create_order_market(SideType::Buy, PositionSide::Long, "BTCUSDT", dec!(2), OrderExtra::new_entry(10, 0.8))
            .await
            .unwrap();

        let mut extra = follow_up(&entry);
        extra.close_reason = Some(CloseReason::StopLoss);
        engine
            .create_order_stop_market(SideType::Sell, PositionSide::Long, "BTCUSDT", dec!(2), dec!(95), extra)
            .await
            .unwrap();

        engine.on_candle(&candle(1, dec!(100), dec!(101), dec!(95.01), dec!(96))).await;
        assert_eq!(engine.get_positions_for_pair("BTCUSDT").await.unwrap().len(), 1);

        engine.on_candle(&candle(2, dec!(96), dec!(96), dec!(95), dec!(95.5))).await;
        assert!(engine.get_positions_for_pair("BTCUSDT").await.unwrap().is_empty());

        let trades = engine.trades().await;
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].exit_price, dec!(95));
        assert_eq!(trades[0].reason, Some(CloseReason::StopLoss));
        // -10 realized minus maker fee on 190 notional
        assert_eq!(trades[0].pnl, dec!(-10.038));
        assert_eq!(engine.quote_balance().await.lock, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_loss_capped_at_margin() {
        let engine = engine(dec!(1000));
        engine.on_candle(&flat(0, dec!(100))).await;
        engine
            .create_order_market(SideType::Buy, PositionSide::Long, "BTCUSDT", dec!(1), OrderExtra::new_entry(10, 0.8))
            .await
            .unwrap();

        engine.on_candle(&flat(1, dec!(50))).await;
        engine
            .create_order_market(SideType::Sell, PositionSide::Long, "BTCUSDT", dec!(1), OrderExtra::default())
            .await
            .unwrap();

        let trades = engine.trades().await;
        // margin 10 lost in full, not the 50 price move
        assert_eq!(trades[0].pnl, dec!(-10) - dec!(50) * dec!(0.0004));
        assert_eq!(engine.quote_balance().await.free, dec!(1000) - dec!(0.04) - dec!(10) - dec!(0.02));
    }

    #[tokio::test]
    async fn test_account_reports_quote_and_net_exposure() {
        let engine = engine(dec!(10000));
        engine.on_candle(&flat(0, dec!(100))).await;
        engine
            .create_order_market(SideType::Buy, PositionSide::Long, "BTCUSDT", dec!(2), OrderExtra::new_entry(10, 0.8))
            .await
            .unwrap();
        engine
            .create_order_market(SideType::Sell, PositionSide::Short, "BTCUSDT", dec!(0.5), OrderExtra::new_entry(10, 0.8))
            .await
            .unwrap();

        let account = engine.account().await.unwrap();
        assert_eq!(account.balance("BTC").free, dec!(1.5));
        assert_eq!(account.balance("USDT").lock, dec!(25));
        assert_eq!(account.balance("ETH"), AssetBalance::default());

        let (net, quote_total) = engine.position("BTCUSDT").await.unwrap();
        assert_eq!(net, dec!(1.5));
        assert_eq!(quote_total, account.balance("USDT").total());
    }

    #[tokio::test]
    async fn test_exit_fee_never_overdraws_the_wallet() {
        // margin 10 plus taker fee 0.04 leaves nothing free
        let engine = engine(dec!(10.04));
        engine.on_candle(&flat(0, dec!(100))).await;
        engine
            .create_order_market(SideType::Buy, PositionSide::Long, "BTCUSDT", dec!(1), OrderExtra::new_entry(10, 0.8))
            .await
            .unwrap();
        assert_eq!(engine.quote_balance().await.free, Decimal::ZERO);

        engine.on_candle(&flat(1, dec!(50))).await;
        engine
            .create_order_market(SideType::Sell, PositionSide::Long, "BTCUSDT", dec!(1), OrderExtra::default())
            .await
            .unwrap();

        let quote = engine.quote_balance().await;
        assert_eq!(quote.free, Decimal::ZERO);
        assert_eq!(quote.lock, Decimal::ZERO);
        let trades = engine.trades().await;
        assert_eq!(trades[0].fee, Decimal::ZERO);
        assert_eq!(trades[0].pnl, dec!(-10));
    }

    #[tokio::test]
    async fn test_average_price_and_reseed() {
        let engine = engine(dec!(10000));
        engine.on_candle(&flat(0, dec!(100))).await;
        let entry = engine
            .create_order_market(SideType::Buy, PositionSide::Long, "BTCUSDT", dec!(1), OrderExtra::new_entry(10, 0.8))
            .await
            .unwrap();

        engine.on_candle(&flat(1, dec!(110))).await;
        engine
            .create_order_market(SideType::Buy, PositionSide::Long, "BTCUSDT", dec!(1), follow_up(&entry))
            .await
            .unwrap();
        let position = engine.get_positions_for_pair("BTCUSDT").await.unwrap().remove(0);
        assert_eq!(position.avg_price, dec!(105));
        assert_eq!(position.more_count, 1);

        // partial exit keeps the average, oversize exit is clamped
        engine
            .create_order_market(SideType::Sell, PositionSide::Long, "BTCUSDT", dec!(0.5), follow_up(&entry))
            .await
            .unwrap();
        let position = engine.get_positions_for_pair("BTCUSDT").await.unwrap().remove(0);
        assert_eq!(position.avg_price, dec!(105));
        assert_eq!(position.quantity, dec!(1.5));

        let exit = engine
            .create_order_market(SideType::Sell, PositionSide::Long, "BTCUSDT", dec!(9), follow_up(&entry))
            .await
            .unwrap();
        assert_eq!(exit.executed_quantity, dec!(1.5));
        assert!(engine.get_positions_for_pair("BTCUSDT").await.unwrap().is_empty());

        engine.on_candle(&flat(2, dec!(120))).await;
        engine
            .create_order_market(SideType::Buy, PositionSide::Long, "BTCUSDT", dec!(1), OrderExtra::new_entry(10, 0.8))
            .await
            .unwrap();
        let position = engine.get_positions_for_pair("BTCUSDT").await.unwrap().remove(0);
        assert_eq!(position.avg_price, dec!(120));
        assert_eq!(position.more_count, 0);
    }

    #[tokio::test]
    async fn test_late_candle_dropped() {
        let engine = engine(dec!(10000));
        engine.on_candle(&flat(5, dec!(100))).await;
        engine.on_candle(&flat(3, dec!(50))).await;

        let order = engine
            .create_order_market(SideType::Buy, PositionSide::Long, "BTCUSDT", dec!(1), OrderExtra::new_entry(10, 0.8))
            .await
            .unwrap();
        assert_eq!(order.price, dec!(100));
    }

    #[tokio::test]
    async fn test_stop_for_missing_position_cancelled() {
        let engine = engine(dec!(10000));
        engine.on_candle(&flat(0, dec!(100))).await;
        let entry = engine
            .create_order_market(SideType::Buy, PositionSide::Long, "BTCUSDT", dec!(1), OrderExtra::new_entry(10, 0.8))
            .await
            .unwrap();
        let stop = engine
            .create_order_stop_market(SideType::Sell, PositionSide::Long, "BTCUSDT", dec!(1), dec!(95), follow_up(&entry))
            .await
            .unwrap();

        // position closed and reopened under a new flag
        engine
            .create_order_market(SideType::Sell, PositionSide::Long, "BTCUSDT", dec!(1), follow_up(&entry))
            .await
            .unwrap();
        engine
            .create_order_market(SideType::Buy, PositionSide::Long, "BTCUSDT", dec!(1), OrderExtra::new_entry(10, 0.8))
            .await
            .unwrap();

        engine.on_candle(&flat(1, dec!(94))).await;
        let stored = engine.orders().await.into_iter().find(|o| o.id == stop.id).unwrap();
        assert_eq!(stored.status, OrderStatus::Canceled);
        assert_eq!(engine.get_positions_for_pair("BTCUSDT").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_releases_reservation() {
        let engine = engine(dec!(10000));
        engine.on_candle(&flat(0, dec!(100))).await;
        let order = engine
            .create_order_limit(
                SideType::Sell,
                PositionSide::Short,
                "BTCUSDT",
                dec!(1),
                dec!(101),
                OrderExtra::new_entry(10, 0.2),
            )
            .await
            .unwrap();
        assert!(engine.quote_balance().await.lock > Decimal::ZERO);

        engine.cancel(&order).await.unwrap();
        let quote = engine.quote_balance().await;
        assert_eq!(quote.free, dec!(10000));
        assert_eq!(quote.lock, Decimal::ZERO);
    }
}
