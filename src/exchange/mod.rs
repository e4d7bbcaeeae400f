//! Simulated exchange for backtests and paper trading.

mod matching;
mod queue;

pub use matching::{ClosedTrade, MatchingEngine};
pub use queue::CandleQueue;
