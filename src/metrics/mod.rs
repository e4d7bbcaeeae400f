//! Backtest and paper-run statistics.

mod calculator;

pub use calculator::{BacktestReport, ReportCalculator};
