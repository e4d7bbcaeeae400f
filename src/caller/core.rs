//! Shared open / close / finish primitives used by every caller mode.
//!
//! Every mutating operation on a pair runs under that pair's lock for its
//! full duration, broker awaits included. Methods suffixed `_locked` expect
//! the caller to already hold the guard.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::{debug, info, warn};

use super::profit::{close_decision, CloseCheck, CloseDecision};
use super::signal::{should_reverse, summarize};
use super::sizing::{entry_quantity, scale_in_quantity, stop_loss_price};
use crate::broker::{Broker, BrokerError, Feeder, StrategyAggregator};
use crate::config::{CallerSetting, PairOption};
use crate::events::CallerEvent;
use crate::models::{
    Candle, CloseReason, Order, OrderExtra, PairProfit, Position, PositionSide, StrategySignal,
};
use crate::sync::SafeMap;

/// Replay clock: "now" is the latest candle time seen.
#[derive(Debug, Default)]
pub struct Clock {
    millis: AtomicI64,
}

impl Clock {
    pub fn replay() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }

    /// Move time forward; never backwards.
    pub fn advance(&self, to: DateTime<Utc>) {
        self.millis.fetch_max(to.timestamp_millis(), Ordering::SeqCst);
    }
}

/// Profit-lock key of one position leg.
pub(crate) fn leg_key(pair: &str, side: PositionSide) -> String {
    format!("{}:{}", pair, side.as_str())
}

#[derive(Debug, Clone)]
struct Deadline {
    pair: String,
    at: DateTime<Utc>,
}

/// Result of an open evaluation.
#[derive(Debug, Clone)]
pub enum OpenOutcome {
    /// An entry order was placed
    Opened(Order),
    /// A position on the signalled side already exists
    Held(Position),
    /// Nothing placed (no consensus, guard, zero size, funding)
    Skipped,
}

/// Per-pair state and the primitives shared by the caller modes.
pub struct CallerCore {
    broker: Arc<dyn Broker>,
    feeder: Arc<dyn Feeder>,
    strategy: Arc<dyn StrategyAggregator>,
    setting: CallerSetting,
    options: HashMap<String, PairOption>,
    enabled: DashMap<String, bool>,
    running: AtomicBool,

    /// Wall-clock tickers drive the timer modes; otherwise candles do
    tickers: AtomicBool,
    clock: Clock,
    events: mpsc::UnboundedSender<CallerEvent>,

    pair_locks: SafeMap<String, ()>,

    /// Profit lock per leg (`pair:SIDE`), or per pair for combined legs
    profits: SafeMap<String, PairProfit>,
    last_prices: SafeMap<String, Decimal>,
    samples: SafeMap<String, VecDeque<Candle>>,

    /// Hold-window deadline per order flag
    deadlines: SafeMap<String, Deadline>,

    /// Last tick per `pair:kind`, for candle-time tickers
    ticks: SafeMap<String, Option<DateTime<Utc>>>,
}

impl CallerCore {
    pub fn new(
        broker: Arc<dyn Broker>,
        feeder: Arc<dyn Feeder>,
        strategy: Arc<dyn StrategyAggregator>,
        setting: CallerSetting,
        pairs: Vec<PairOption>,
        clock: Clock,
        events: mpsc::UnboundedSender<CallerEvent>,
    ) -> Self {
        let enabled = DashMap::new();
        let mut options = HashMap::new();
        for option in pairs {
            enabled.insert(option.pair.clone(), option.enabled);
            options.insert(option.pair.clone(), option);
        }

        Self {
            broker,
            feeder,
            strategy,
            setting,
            options,
            enabled,
            running: AtomicBool::new(true),
            tickers: AtomicBool::new(false),
            clock,
            events,
            pair_locks: SafeMap::new(),
            profits: SafeMap::new(),
            last_prices: SafeMap::new(),
            samples: SafeMap::new(),
            deadlines: SafeMap::new(),
            ticks: SafeMap::new(),
        }
    }

    // ==================== Accessors ====================

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    pub fn setting(&self) -> &CallerSetting {
        &self.setting
    }

    pub fn option(&self, pair: &str) -> Option<&PairOption> {
        self.options.get(pair)
    }

    pub fn pairs(&self) -> Vec<String> {
        let mut pairs: Vec<String> = self.options.keys().cloned().collect();
        pairs.sort();
        pairs
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Whether new entries are allowed for the pair.
    pub fn is_enabled(&self, pair: &str) -> bool {
        self.running.load(Ordering::SeqCst) && self.enabled.get(pair).map(|e| *e).unwrap_or(false)
    }

    pub fn set_pair_enabled(&self, pair: &str, enabled: bool) {
        if self.options.contains_key(pair) {
            info!(pair = %pair, enabled, "Pair status updated");
            self.enabled.insert(pair.to_string(), enabled);
        } else {
            warn!(pair = %pair, "Status change for unknown pair ignored");
        }
    }

    /// Stop accepting new entries on every pair.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn set_tickers_running(&self, running: bool) {
        self.tickers.store(running, Ordering::SeqCst);
    }

    /// True when wall-clock tickers own the timer-driven evaluations.
    pub fn tickers_running(&self) -> bool {
        self.tickers.load(Ordering::SeqCst)
    }

    /// Hold the pair's lock.
    pub async fn lock_pair(&self, pair: &str) -> OwnedMutexGuard<()> {
        self.pair_locks.lock(&pair.to_string()).await
    }

    pub async fn leg_profit(&self, pair: &str, side: PositionSide) -> PairProfit {
        self.profits.get(&leg_key(pair, side)).await.unwrap_or_default()
    }

    /// Combined lock shared by every leg of the pair.
    pub async fn pair_profit(&self, pair: &str) -> PairProfit {
        self.profits.get(&pair.to_string()).await.unwrap_or_default()
    }

    pub async fn deadline(&self, order_flag: &str) -> Option<DateTime<Utc>> {
        self.deadlines.get(&order_flag.to_string()).await.map(|d| d.at)
    }

    pub(crate) fn emit(&self, event: CallerEvent) {
        if self.events.send(event).is_err() {
            debug!("Event channel closed, event dropped");
        }
    }

    // ==================== Market data ====================

    /// Record a candle: advances replay time, refreshes the last price and
    /// the strategy sample window.
    pub async fn record_candle(&self, candle: &Candle) {
        self.clock.advance(candle.time);
        self.last_prices.set(candle.pair.clone(), candle.close).await;

        let limit = self.setting.candle_limit.max(1);
        self.samples
            .update(&candle.pair, |window| {
                // a forming candle is replaced by its later update
                if window.back().is_some_and(|last| last.time == candle.time) {
                    window.pop_back();
                }
                window.push_back(candle.clone());
                while window.len() > limit {
                    window.pop_front();
                }
            })
            .await;
    }

    /// Last seen close for the pair, asking the feeder when nothing is cached.
    pub async fn last_price(&self, pair: &str) -> Result<Decimal> {
        if let Some(price) = self.last_prices.get(&pair.to_string()).await {
            return Ok(price);
        }
        let candles = self
            .feeder
            .candles_by_limit(pair, &self.setting.timeframe, 1)
            .await?;
        let price = candles
            .last()
            .map(|c| c.close)
            .ok_or_else(|| BrokerError::NoMarketData(pair.to_string()))?;
        self.last_prices.set(pair.to_string(), price).await;
        Ok(price)
    }

    pub async fn signals(&self, pair: &str) -> Vec<StrategySignal> {
        let samples: Vec<Candle> = self
            .samples
            .get(&pair.to_string())
            .await
            .map(|w| w.into_iter().collect())
            .unwrap_or_default();
        if samples.is_empty() {
            return Vec::new();
        }
        self.strategy.call_matchers(pair, &samples)
    }

    /// Latest `n` samples for the pair, oldest first.
    pub async fn sample_window(&self, pair: &str, n: usize) -> Vec<Candle> {
        let window = self.samples.get(&pair.to_string()).await.unwrap_or_default();
        let skip = window.len().saturating_sub(n);
        window.into_iter().skip(skip).collect()
    }

    /// True once per `every` of clock time for `key`.
    pub(crate) async fn tick_due(&self, key: &str, every: Duration) -> bool {
        let now = self.now();
        self.ticks
            .update(&key.to_string(), |last| match *last {
                Some(prev) if now - prev < every => false,
                _ => {
                    *last = Some(now);
                    true
                }
            })
            .await
    }

    // ==================== Deadlines ====================

    async fn arm_deadline(&self, pair: &str, order_flag: &str) -> DateTime<Utc> {
        let at = self.now() + Duration::minutes(self.setting.position_timeout_mins);
        let deadline = Deadline {
            pair: pair.to_string(),
            at,
        };
        self.deadlines.set(order_flag.to_string(), deadline).await;
        at
    }

    /// Deadline for a position, arming one if it has none yet.
    pub(crate) async fn deadline_for(&self, position: &Position) -> DateTime<Utc> {
        match self.deadline(&position.order_flag).await {
            Some(at) => at,
            None => self.arm_deadline(&position.pair, &position.order_flag).await,
        }
    }

    pub(crate) async fn extend_deadline(&self, position: &Position) {
        let extended = self.now() + Duration::minutes(self.setting.timeout_extension_mins);
        let at = self
            .deadline(&position.order_flag)
            .await
            .map_or(extended, |d| d.max(extended));
        let deadline = Deadline {
            pair: position.pair.clone(),
            at,
        };
        self.deadlines.set(position.order_flag.clone(), deadline).await;
    }

    /// Drop the deadlines of `pair` whose flag is in neither an open position
    /// nor an unfilled order.
    async fn prune_deadlines(&self, pair: &str, live: &HashSet<String>) {
        for flag in self.deadlines.keys() {
            if live.contains(&flag) {
                continue;
            }
            let owned = self.deadlines.get(&flag).await.is_some_and(|d| d.pair == pair);
            if owned && self.deadlines.remove(&flag) {
                debug!(pair = %pair, flag = %flag, "Dropped deadline of closed position");
            }
        }
    }

    // ==================== Profit locks ====================

    /// Reset the lock of every leg without a position, and the combined lock
    /// once the pair is flat. Exits filled inside the exchange (stops) end up
    /// here.
    pub(crate) fn release_closed_locks(&self, pair: &str, positions: &[Position]) {
        for side in [PositionSide::Long, PositionSide::Short] {
            if !positions.iter().any(|p| p.position_side == side) {
                self.profits.remove(&leg_key(pair, side));
            }
        }
        if positions.is_empty() {
            self.profits.remove(&pair.to_string());
        }
    }

    pub(crate) fn reset_profit(&self, key: &str) {
        self.profits.remove(&key.to_string());
    }

    // ==================== Open ====================

    /// Evaluate signals for `pair` and open a position when they agree.
    pub async fn event_open(&self, pair: &str) -> Result<OpenOutcome> {
        let _guard = self.lock_pair(pair).await;
        self.open_locked(pair).await
    }

    pub(crate) async fn open_locked(&self, pair: &str) -> Result<OpenOutcome> {
        let Some(option) = self.option(pair) else {
            return Ok(OpenOutcome::Skipped);
        };
        if !self.is_enabled(pair) {
            debug!(pair = %pair, "Pair disabled, skipping open");
            return Ok(OpenOutcome::Skipped);
        }

        let signals = self.signals(pair).await;
        let Some(summary) = summarize(&signals) else {
            debug!(pair = %pair, signals = signals.len(), "No consensus");
            return Ok(OpenOutcome::Skipped);
        };

        let position_side = summary.side.opening_position_side();
        let positions = self.broker.get_positions_for_pair(pair).await?;

        if let Some(existing) = positions.iter().find(|p| p.position_side == position_side) {
            debug!(pair = %pair, flag = %existing.order_flag, side = %position_side, "Position already open, holding");
            return Ok(OpenOutcome::Held(existing.clone()));
        }

        if let Some(reverse) = positions.iter().find(|p| p.position_side == position_side.opposite()) {
            if !should_reverse(summary.ratio, reverse.long_short_ratio) {
                debug!(
                    pair = %pair,
                    ratio = summary.ratio,
                    old_ratio = reverse.long_short_ratio,
                    "Reverse signal not decisive, holding"
                );
                return Ok(OpenOutcome::Skipped);
            }
            let price = self.last_price(pair).await?;
            self.finish_locked(reverse, CloseReason::Reverse, price).await?;
        }

        let unfilled = self.broker.get_position_orders_for_pair_unfilled(pair).await?;
        if unfilled.iter().any(|o| o.is_entry() && o.position_side == position_side) {
            debug!(pair = %pair, side = %position_side, "Entry order already pending");
            return Ok(OpenOutcome::Skipped);
        }

        let price = self.last_price(pair).await?;
        let (_, free_quote) = self.broker.pair_asset(pair).await?;
        let quantity = entry_quantity(free_quote, option, price);
        if quantity.is_zero() {
            info!(pair = %pair, free_quote = %free_quote, price = %price, "Entry size rounds to zero, skipping");
            return Ok(OpenOutcome::Skipped);
        }

        let mut extra = OrderExtra::new_entry(option.leverage, summary.ratio);
        extra.matched_strategies = summary.matched_strategies;
        extra.stop_loss_price = stop_loss_price(position_side, price, summary.mean_atr);

        let order = match self
            .broker
            .create_order_limit(summary.side, position_side, pair, quantity, price, extra)
            .await
        {
            Ok(order) => order,
            Err(e @ BrokerError::InsufficientFunds { .. }) => {
                warn!(pair = %pair, error = %e, "Entry rejected");
                return Ok(OpenOutcome::Skipped);
            }
            Err(e) => return Err(e).with_context(|| format!("Failed to place entry for {}", pair)),
        };

        self.reset_profit(&leg_key(pair, position_side));
        self.arm_deadline(pair, &order.order_flag).await;

        info!(
            pair = %pair,
            flag = %order.order_flag,
            side = %order.side,
            quantity = %order.quantity,
            price = %order.price,
            ratio = summary.ratio,
            stop = ?order.stop_loss_price,
            "Opened position"
        );
        self.emit(CallerEvent::PositionOpened { order: order.clone() });

        Ok(OpenOutcome::Opened(order))
    }

    // ==================== Close ====================

    /// Run the close state machine over every open position of `pair`.
    pub async fn event_close(&self, pair: &str) -> Result<()> {
        let _guard = self.lock_pair(pair).await;
        self.close_locked(pair).await
    }

    pub(crate) async fn close_locked(&self, pair: &str) -> Result<()> {
        let Some(option) = self.option(pair) else {
            return Ok(());
        };
        let positions = self.broker.get_positions_for_pair(pair).await?;
        self.release_closed_locks(pair, &positions);
        if positions.is_empty() {
            return Ok(());
        }
        let price = self.last_price(pair).await?;

        for position in positions.iter().filter(|p| !p.is_closed()) {
            let ratio = position.profit_ratio(price);
            let check = CloseCheck {
                ratio,
                now: self.now(),
                deadline: Some(self.deadline_for(position).await),
                max_margin_loss_ratio: option.max_margin_loss_ratio,
                stop_loss_hit: position.stop_loss_hit(price),
            };
            let decision = self.decide_close(&leg_key(pair, position.position_side), &check).await;

            match decision {
                CloseDecision::Finish(reason) => {
                    self.finish_locked(position, reason, price).await?;
                }
                CloseDecision::Ratchet => {
                    self.extend_deadline(position).await;
                    let profit = self.leg_profit(pair, position.position_side).await;
                    info!(
                        pair = %pair,
                        flag = %position.order_flag,
                        ratio = %ratio,
                        close = %profit.close,
                        floor = %profit.floor,
                        "Profit lock ratcheted"
                    );
                }
                CloseDecision::Watch => {
                    debug!(pair = %pair, flag = %position.order_flag, ratio = %ratio, "Watching profit");
                }
                CloseDecision::Hold => {
                    self.ensure_stop_loss_locked(option, position).await?;
                }
            }
        }
        Ok(())
    }

    /// Run the close state machine against the profit lock stored at `key`:
    /// a [`leg_key`] for single legs, the pair for combined legs.
    pub(crate) async fn decide_close(&self, key: &str, check: &CloseCheck) -> CloseDecision {
        let ladder = &self.setting.profit_ladder;
        self.profits
            .update(&key.to_string(), |profit| close_decision(profit, ladder, check))
            .await
    }

    // ==================== Finish ====================

    /// Market exit for the full quantity, then drop the deadline, cancel
    /// every unfilled order sharing the flag and reset the leg's lock.
    pub(crate) async fn finish_locked(
        &self,
        position: &Position,
        reason: CloseReason,
        price: Decimal,
    ) -> Result<Option<Order>> {
        if position.quantity <= Decimal::ZERO {
            warn!(pair = %position.pair, flag = %position.order_flag, "Finish with zero quantity skipped");
            return Ok(None);
        }

        let extra = position_extra(position, Some(reason));
        let order = self
            .broker
            .create_order_market(
                position.position_side.exit_side(),
                position.position_side,
                &position.pair,
                position.quantity,
                extra,
            )
            .await
            .with_context(|| format!("Failed to finish {} {}", position.pair, position.position_side))?;

        self.deadlines.remove(&position.order_flag);
        self.cancel_flag_orders(&position.pair, &position.order_flag).await;
        self.reset_profit(&leg_key(&position.pair, position.position_side));

        info!(
            pair = %position.pair,
            flag = %position.order_flag,
            position_side = %position.position_side,
            quantity = %position.quantity,
            avg_price = %position.avg_price,
            price = %price,
            ratio = %position.profit_ratio(price),
            reason = %reason,
            "Finished position"
        );
        self.emit(CallerEvent::OrderClosed {
            order: order.clone(),
            reason,
        });

        Ok(Some(order))
    }

    /// Cancel unfilled orders carrying `order_flag`. Failures are logged and
    /// left for the timeout sweep.
    async fn cancel_flag_orders(&self, pair: &str, order_flag: &str) {
        let orders = match self.broker.get_position_orders_for_pair_unfilled(pair).await {
            Ok(orders) => orders,
            Err(e) => {
                warn!(pair = %pair, flag = %order_flag, error = %e, "Failed to list orders to cancel");
                return;
            }
        };
        for order in orders.iter().filter(|o| o.order_flag == order_flag) {
            if let Err(e) = self.broker.cancel(order).await {
                warn!(pair = %pair, order_id = %order.id, error = %e, "Failed to cancel order");
            }
        }
    }

    // ==================== Protection ====================

    /// Place a stop exit at the position's stop price when no ratio limit is
    /// configured and no loss order exists yet. A non-zero
    /// `stop_limit_offset` rests it as a stop-limit past the stop.
    pub(crate) async fn ensure_stop_loss_locked(&self, option: &PairOption, position: &Position) -> Result<()> {
        if !option.max_margin_loss_ratio.is_zero() {
            return Ok(());
        }
        let Some(stop) = position.stop_loss_price else {
            return Ok(());
        };
        let existing = self
            .broker
            .get_orders_for_position_loss_unfilled(&position.order_flag)
            .await?;
        if existing.iter().any(|o| o.position_side == position.position_side) {
            return Ok(());
        }

        let side = position.position_side.exit_side();
        let extra = position_extra(position, Some(CloseReason::StopLoss));
        let order = if option.stop_limit_offset.is_zero() {
            self.broker
                .create_order_stop_market(side, position.position_side, &position.pair, position.quantity, stop, extra)
                .await?
        } else {
            // a SELL exit limits below the stop, a BUY exit above it
            let limit = stop * (Decimal::ONE - position.position_side.sign() * option.stop_limit_offset);
            self.broker
                .create_order_stop_limit(
                    side,
                    position.position_side,
                    &position.pair,
                    position.quantity,
                    limit,
                    stop,
                    extra,
                )
                .await?
        };
        info!(
            pair = %position.pair,
            flag = %position.order_flag,
            stop = %stop,
            limit = %order.price,
            order_id = %order.id,
            "Stop loss placed"
        );
        Ok(())
    }

    /// Add to a winning position once it passes the profit trigger.
    pub(crate) async fn scale_in_locked(&self, position: &Position, price: Decimal) -> Result<Option<Order>> {
        let Some(option) = self.option(&position.pair) else {
            return Ok(None);
        };
        let ratio = position.profit_ratio(price);
        if option.profitable_scale <= Decimal::ZERO
            || ratio < option.profitable_trigger
            || position.more_count >= option.max_add_position
        {
            return Ok(None);
        }

        let quantity = scale_in_quantity(position.quantity, option);
        if quantity.is_zero() {
            return Ok(None);
        }

        match self
            .broker
            .create_order_market(
                position.position_side.entry_side(),
                position.position_side,
                &position.pair,
                quantity,
                position_extra(position, None),
            )
            .await
        {
            Ok(order) => {
                info!(
                    pair = %position.pair,
                    flag = %position.order_flag,
                    quantity = %quantity,
                    ratio = %ratio,
                    more_count = position.more_count + 1,
                    "Scaled into position"
                );
                Ok(Some(order))
            }
            Err(e @ BrokerError::InsufficientFunds { .. }) => {
                warn!(pair = %position.pair, error = %e, "Scale-in rejected");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Market entry on a leg, used by hedge, grid and copy add-ons.
    /// Funding rejections are logged and reported as `None`.
    pub(crate) async fn add_market_locked(
        &self,
        pair: &str,
        position_side: PositionSide,
        quantity: Decimal,
        extra: OrderExtra,
    ) -> Result<Option<Order>> {
        match self
            .broker
            .create_order_market(position_side.entry_side(), position_side, pair, quantity, extra)
            .await
        {
            Ok(order) => Ok(Some(order)),
            Err(e @ BrokerError::InsufficientFunds { .. }) => {
                warn!(pair = %pair, side = %position_side, error = %e, "Add-on rejected");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Record a freshly opened market leg: reset its lock and arm the hold
    /// window.
    pub(crate) async fn on_market_entry(&self, order: &Order) {
        self.reset_profit(&leg_key(&order.pair, order.position_side));
        self.arm_deadline(&order.pair, &order.order_flag).await;
        self.emit(CallerEvent::PositionOpened { order: order.clone() });
    }

    // ==================== Order timeout ====================

    /// Cancel stale entry orders and stop orders whose position is gone,
    /// then drop the locks and deadlines left by closed positions. A failing
    /// pair is logged and the sweep moves on.
    pub async fn check_order_timeout(&self) -> Result<()> {
        let mut pairs: BTreeSet<String> = self.pairs().into_iter().collect();
        match self.broker.get_orders_for_unfilled().await {
            Ok(orders) => pairs.extend(orders.into_iter().map(|o| o.pair)),
            Err(e) => warn!(error = %e, "Failed to list unfilled orders, sweeping configured pairs"),
        }

        let mut failed = 0usize;
        for pair in pairs {
            if let Err(e) = self.sweep_pair(&pair).await {
                failed += 1;
                warn!(pair = %pair, error = %e, "Order timeout check failed");
            }
        }
        if failed > 0 {
            anyhow::bail!("Order timeout check failed for {} pair(s)", failed);
        }
        Ok(())
    }

    async fn sweep_pair(&self, pair: &str) -> Result<()> {
        let _guard = self.lock_pair(pair).await;
        let timeout = Duration::seconds(self.setting.order_timeout_secs);
        let now = self.now();
        let positions = self.broker.get_positions_for_pair(pair).await?;
        let orders = self.broker.get_position_orders_for_pair_unfilled(pair).await?;

        let mut live: HashSet<String> = positions.iter().map(|p| p.order_flag.clone()).collect();
        for order in orders {
            let stale_entry = order.is_entry() && !order.order_type.is_stop() && now - order.created_at > timeout;
            let orphan_stop = !order.is_entry()
                && order.order_type.is_stop()
                && !positions
                    .iter()
                    .any(|p| p.order_flag == order.order_flag && p.position_side == order.position_side);

            if !(stale_entry || orphan_stop) {
                live.insert(order.order_flag.clone());
                continue;
            }

            match self.broker.cancel(&order).await {
                Ok(()) => info!(
                    pair = %pair,
                    order_id = %order.id,
                    flag = %order.order_flag,
                    stale_entry,
                    orphan_stop,
                    "Cancelled unfilled order"
                ),
                Err(e) => {
                    live.insert(order.order_flag.clone());
                    warn!(pair = %pair, order_id = %order.id, error = %e, "Failed to cancel order");
                }
            }
        }

        self.prune_deadlines(pair, &live).await;
        self.release_closed_locks(pair, &positions);
        Ok(())
    }
}

/// Extra context for orders acting on an existing position.
pub fn position_extra(position: &Position, close_reason: Option<CloseReason>) -> OrderExtra {
    OrderExtra {
        order_flag: position.order_flag.clone(),
        leverage: position.leverage,
        long_short_ratio: position.long_short_ratio,
        matched_strategies: position.matched_strategies.clone(),
        stop_loss_price: position.stop_loss_price,
        close_reason,
    }
}
