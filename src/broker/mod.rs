//! Contracts the caller needs from the outside world.
//!
//! - `Broker`: account, positions and order placement (live adapter or the
//!   paper `MatchingEngine`)
//! - `Feeder`: candle history and live candle streams
//! - `StrategyAggregator`: per-strategy signals for a pair
//! - `GuiderSource`: positions of a followed account

mod feeder;
mod guider;

pub use feeder::HistoryFeeder;
pub use guider::FileGuiderSource;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::{
    Account, Candle, GuiderPosition, Order, OrderExtra, Position, PositionSide, SideType,
    StrategySignal,
};

/// Errors surfaced by a broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("insufficient {asset} for {pair}: quantity {quantity} needs {required}, available {available}")]
    InsufficientFunds {
        pair: String,
        asset: String,
        quantity: Decimal,
        required: Decimal,
        available: Decimal,
    },

    #[error("invalid quantity {quantity} for {pair}")]
    InvalidQuantity { pair: String, quantity: Decimal },

    #[error("no market data for {0}")]
    NoMarketData(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("position not found for flag {0}")]
    PositionNotFound(String),
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Order placement and account queries, hedge-mode futures semantics.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn account(&self) -> BrokerResult<Account>;

    /// Total `(asset, quote)` balances for the pair.
    async fn position(&self, pair: &str) -> BrokerResult<(Decimal, Decimal)>;

    /// Free `(asset, quote)` balances for the pair.
    async fn pair_asset(&self, pair: &str) -> BrokerResult<(Decimal, Decimal)>;

    async fn create_order_limit(
        &self,
        side: SideType,
        position_side: PositionSide,
        pair: &str,
        quantity: Decimal,
        price: Decimal,
        extra: OrderExtra,
    ) -> BrokerResult<Order>;

    async fn create_order_market(
        &self,
        side: SideType,
        position_side: PositionSide,
        pair: &str,
        quantity: Decimal,
        extra: OrderExtra,
    ) -> BrokerResult<Order>;

    #[allow(clippy::too_many_arguments)]
    async fn create_order_stop_limit(
        &self,
        side: SideType,
        position_side: PositionSide,
        pair: &str,
        quantity: Decimal,
        price: Decimal,
        stop_price: Decimal,
        extra: OrderExtra,
    ) -> BrokerResult<Order>;

    async fn create_order_stop_market(
        &self,
        side: SideType,
        position_side: PositionSide,
        pair: &str,
        quantity: Decimal,
        stop_price: Decimal,
        extra: OrderExtra,
    ) -> BrokerResult<Order>;

    async fn cancel(&self, order: &Order) -> BrokerResult<()>;

    /// Open positions on both legs of the pair.
    async fn get_positions_for_pair(&self, pair: &str) -> BrokerResult<Vec<Position>>;

    /// Unfilled stop (loss) orders carrying `order_flag`.
    async fn get_orders_for_position_loss_unfilled(&self, order_flag: &str) -> BrokerResult<Vec<Order>>;

    /// Every unfilled order for the pair.
    async fn get_position_orders_for_pair_unfilled(&self, pair: &str) -> BrokerResult<Vec<Order>>;

    /// Every unfilled order across pairs.
    async fn get_orders_for_unfilled(&self) -> BrokerResult<Vec<Order>>;
}

/// Candle source.
#[async_trait]
pub trait Feeder: Send + Sync {
    /// Latest `limit` candles, oldest first.
    async fn candles_by_limit(&self, pair: &str, timeframe: &str, limit: usize) -> Result<Vec<Candle>>;

    /// Candles with open time in `[start, end]`, oldest first.
    async fn candles_by_period(
        &self,
        pair: &str,
        timeframe: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;

    /// Stream of candles for the pair.
    async fn candles_subscription(&self, pair: &str, timeframe: &str) -> Result<mpsc::Receiver<Candle>>;
}

/// Runs every signal source for a pair over the sample window.
pub trait StrategyAggregator: Send + Sync {
    fn call_matchers(&self, pair: &str, samples: &[Candle]) -> Vec<StrategySignal>;
}

/// Positions held by a followed account.
#[async_trait]
pub trait GuiderSource: Send + Sync {
    async fn positions(&self) -> Result<Vec<GuiderPosition>>;
}
