//! Data models for candles, orders, positions, profit locks, grids and guiders.

mod account;
mod candle;
mod grid;
mod guider;
mod order;
mod position;
mod profit;
mod signal;

pub use account::{split_pair, Account, AssetBalance};
pub use candle::Candle;
pub use grid::PositionGrid;
pub use guider::GuiderPosition;
pub use order::{CloseReason, Order, OrderExtra, OrderStatus, OrderType, PositionSide, SideType};
pub use position::{MarginType, Position};
pub use profit::{PairProfit, ProfitLadder};
pub use signal::StrategySignal;
