//! Calculator for run statistics: win rate, profit factor, drawdown, Sharpe and Sortino.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use statrs::statistics::Statistics;

use crate::exchange::ClosedTrade;

/// Summary of one backtest or paper run.
#[derive(Debug, Clone, Default)]
pub struct BacktestReport {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,

    /// Initial quote balance
    pub initial_capital: Decimal,

    /// Equity at the last candle, open positions marked to market
    pub final_equity: Decimal,

    pub total_return_pct: Decimal,
    pub total_fees: Decimal,
    pub total_volume: Decimal,

    /// Exit fills counted as trades
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,

    /// Gross profit / gross loss
    pub profit_factor: f64,
    pub realized_pnl: Decimal,

    /// Largest peak-to-trough equity decline (0.0 to 1.0)
    pub max_drawdown_pct: f64,
    pub max_drawdown: Decimal,

    /// Annualized over per-trade margin returns
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,

    pub avg_holding_hours: f64,

    /// Trades per close reason
    pub close_reasons: BTreeMap<String, usize>,
}

/// Builds a [`BacktestReport`] from the engine's trade log and equity curve.
pub struct ReportCalculator;

impl ReportCalculator {
    pub fn calculate(
        initial_capital: Decimal,
        trades: &[ClosedTrade],
        equity_curve: &[(DateTime<Utc>, Decimal)],
        total_fees: Decimal,
        total_volume: Decimal,
    ) -> BacktestReport {
        let final_equity = equity_curve.last().map_or(initial_capital, |(_, e)| *e);
        let mut report = BacktestReport {
            started_at: equity_curve.first().map(|(t, _)| *t),
            ended_at: equity_curve.last().map(|(t, _)| *t),
            initial_capital,
            final_equity,
            total_fees,
            total_volume,
            total_trades: trades.len(),
            ..Default::default()
        };

        if initial_capital > Decimal::ZERO {
            report.total_return_pct = (final_equity - initial_capital) / initial_capital;
        }

        Self::calculate_pnl_metrics(&mut report, trades);
        Self::calculate_drawdown(&mut report, equity_curve);
        Self::calculate_sharpe_sortino(&mut report, trades);

        if !trades.is_empty() {
            let hours: f64 = trades
                .iter()
                .map(|t| (t.closed_at - t.opened_at).num_minutes() as f64 / 60.0)
                .sum();
            report.avg_holding_hours = hours / trades.len() as f64;
        }

        for trade in trades {
            let reason = trade.reason.map_or("UNKNOWN", |r| r.as_str());
            *report.close_reasons.entry(reason.to_string()).or_default() += 1;
        }

        report
    }

    fn calculate_pnl_metrics(report: &mut BacktestReport, trades: &[ClosedTrade]) {
        let (wins, losses): (Vec<Decimal>, Vec<Decimal>) =
            trades.iter().map(|t| t.pnl).partition(|p| *p > Decimal::ZERO);

        report.winning_trades = wins.len();
        report.losing_trades = losses.len();
        report.realized_pnl = trades.iter().map(|t| t.pnl).sum();

        if !trades.is_empty() {
            report.win_rate = wins.len() as f64 / trades.len() as f64;
        }

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|l| l.abs()).sum();

        if !wins.is_empty() {
            report.avg_win = gross_profit / Decimal::from(wins.len());
        }
        if !losses.is_empty() {
            report.avg_loss = gross_loss / Decimal::from(losses.len());
        }

        if gross_loss > Decimal::ZERO {
            report.profit_factor = gross_profit.to_f64().unwrap_or(0.0) / gross_loss.to_f64().unwrap_or(1.0);
        } else if gross_profit > Decimal::ZERO {
            report.profit_factor = f64::INFINITY;
        }
    }

    /// Maximum drawdown over the equity curve.
    fn calculate_drawdown(report: &mut BacktestReport, equity_curve: &[(DateTime<Utc>, Decimal)]) {
        let mut peak = report.initial_capital;
        let mut max_dd = Decimal::ZERO;
        let mut max_dd_pct = 0.0f64;

        for (_, equity) in equity_curve {
            if *equity > peak {
                peak = *equity;
            }
            if peak > Decimal::ZERO {
                let dd = peak - *equity;
                if dd > max_dd {
                    max_dd = dd;
                }
                let dd_pct = (dd / peak).to_f64().unwrap_or(0.0);
                if dd_pct > max_dd_pct {
                    max_dd_pct = dd_pct;
                }
            }
        }

        report.max_drawdown = max_dd;
        report.max_drawdown_pct = max_dd_pct;
    }

    fn calculate_sharpe_sortino(report: &mut BacktestReport, trades: &[ClosedTrade]) {
        if trades.len() < 2 {
            return;
        }

        let returns: Vec<f64> = trades.iter().filter_map(|t| t.return_ratio().to_f64()).collect();
        if returns.len() < 2 {
            return;
        }

        let mean = returns.iter().mean();
        let std_dev = returns.iter().std_dev();

        // 0% risk-free rate, 365 periods a year
        if std_dev > 0.0 {
            report.sharpe_ratio = (mean / std_dev) * 365.0_f64.sqrt();
        }

        let negative: Vec<f64> = returns.iter().filter(|r| **r < 0.0).copied().collect();
        if negative.len() >= 2 {
            let downside_dev = negative.iter().std_dev();
            if downside_dev > 0.0 {
                report.sortino_ratio = (mean / downside_dev) * 365.0_f64.sqrt();
            }
        }
    }
}

impl std::fmt::Display for BacktestReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        if let (Some(start), Some(end)) = (self.started_at, self.ended_at) {
            writeln!(f, "Period: {} to {}", start.format("%Y-%m-%d %H:%M"), end.format("%Y-%m-%d %H:%M"))?;
            writeln!(f)?;
        }
        writeln!(f, "--- Capital ---")?;
        writeln!(f, "Initial:     ${:.2}", self.initial_capital)?;
        writeln!(f, "Final:       ${:.2}", self.final_equity)?;
        writeln!(f, "Return:      {:.2}%", self.total_return_pct * dec!(100))?;
        writeln!(f, "Realized:    ${:.2}", self.realized_pnl)?;
        writeln!(f, "Fees Paid:   ${:.2}", self.total_fees)?;
        writeln!(f, "Volume:      ${:.2}", self.total_volume)?;
        writeln!(f)?;
        writeln!(f, "--- Trades ---")?;
        writeln!(f, "Total:       {}", self.total_trades)?;
        writeln!(f, "Winners:     {} ({:.1}%)", self.winning_trades, self.win_rate * 100.0)?;
        writeln!(f, "Losers:      {}", self.losing_trades)?;
        writeln!(f, "Avg Win:     ${:.2}", self.avg_win)?;
        writeln!(f, "Avg Loss:    ${:.2}", self.avg_loss)?;
        writeln!(f, "Profit Factor: {:.2}", self.profit_factor)?;
        for (reason, count) in &self.close_reasons {
            writeln!(f, "  {:<14} {}", reason, count)?;
        }
        writeln!(f)?;
        writeln!(f, "--- Risk Metrics ---")?;
        writeln!(f, "Max Drawdown: {:.2}% (${:.2})", self.max_drawdown_pct * 100.0, self.max_drawdown)?;
        writeln!(f, "Sharpe Ratio: {:.2}", self.sharpe_ratio)?;
        writeln!(f, "Sortino Ratio: {:.2}", self.sortino_ratio)?;
        writeln!(f)?;
        writeln!(f, "--- Timing ---")?;
        writeln!(f, "Avg Hold:    {:.1} hours", self.avg_holding_hours)?;
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}
