//! Orchestration: deterministic backtest replay and paper trading.
//!
//! Both modes run the caller against the paper `MatchingEngine`. Backtests
//! pop candles from a [`CandleQueue`] and feed the engine, then the caller,
//! on one path. Paper runs subscribe to every pair, let the caller's tickers
//! drive the timer modes and stop on ctrl-c.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::broker::{Broker, Feeder, GuiderSource, HistoryFeeder, StrategyAggregator};
use crate::caller::{Caller, CallerCore, Clock};
use crate::config::{AppConfig, PairOption};
use crate::db::{OrderFilter, OrderRepository};
use crate::events::{CallerEvent, Notifier};
use crate::exchange::{CandleQueue, MatchingEngine};
use crate::metrics::{BacktestReport, ReportCalculator};
use crate::models::Candle;

/// Owns the engine, the caller and the event channel for one run.
pub struct Runner {
    config: AppConfig,
    engine: Arc<MatchingEngine>,
    feeder: Arc<HistoryFeeder>,
    caller: Arc<Caller>,
    repository: Option<Arc<dyn OrderRepository>>,
    notifier: Arc<dyn Notifier>,
    control: mpsc::UnboundedSender<CallerEvent>,
    events: mpsc::UnboundedReceiver<CallerEvent>,
}

impl Runner {
    pub fn new(
        config: AppConfig,
        feeder: Arc<HistoryFeeder>,
        strategy: Arc<dyn StrategyAggregator>,
        guider: Option<Arc<dyn GuiderSource>>,
        repository: Option<Arc<dyn OrderRepository>>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let engine = Arc::new(MatchingEngine::new(&config.exchange));
        let (control, events) = mpsc::unbounded_channel();

        let core = Arc::new(CallerCore::new(
            engine.clone(),
            feeder.clone(),
            strategy,
            config.caller.clone(),
            config.pairs.clone(),
            Clock::replay(),
            control.clone(),
        ));
        let caller = Arc::new(Caller::new(config.caller.mode, core, guider).context("Failed to build caller")?);

        Ok(Self {
            config,
            engine,
            feeder,
            caller,
            repository,
            notifier,
            control,
            events,
        })
    }

    pub fn engine(&self) -> &Arc<MatchingEngine> {
        &self.engine
    }

    pub fn caller(&self) -> &Arc<Caller> {
        &self.caller
    }

    /// Sender for inbound control events such as [`CallerEvent::PairStatus`].
    pub fn control(&self) -> mpsc::UnboundedSender<CallerEvent> {
        self.control.clone()
    }

    /// Replay the configured pairs in time order, optionally limited to
    /// `[from, to]`.
    pub async fn backtest(&mut self, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Result<BacktestReport> {
        let timeframe = self.config.caller.timeframe.clone();
        let mut queue = CandleQueue::new();

        for option in &self.config.pairs {
            let candles = match (from, to) {
                (None, None) => self.feeder.candles_by_limit(&option.pair, &timeframe, usize::MAX).await?,
                (from, to) => {
                    let start = from.unwrap_or(DateTime::<Utc>::MIN_UTC);
                    let end = to.unwrap_or(DateTime::<Utc>::MAX_UTC);
                    self.feeder.candles_by_period(&option.pair, &timeframe, start, end).await?
                }
            };
            debug!(pair = %option.pair, candles = candles.len(), "Queued candles");
            queue.extend(candles);
        }

        info!(
            mode = self.config.caller.mode.as_str(),
            pairs = self.config.pairs.len(),
            candles = queue.len(),
            "Starting backtest"
        );

        self.pump_events().await;
        while let Some(candle) = queue.pop() {
            self.step(&candle).await;
            self.pump_events().await;
        }

        self.persist_orders().await?;
        log_account(self.engine.as_ref(), &self.config.exchange.quote_asset, &self.config.pairs).await;
        let report = self.report().await;
        info!(
            trades = report.total_trades,
            final_equity = %report.final_equity,
            return_pct = %report.total_return_pct,
            "Backtest complete"
        );
        Ok(report)
    }

    /// Stream every pair through the engine and caller until the feeds end
    /// or ctrl-c.
    pub async fn paper(self) -> Result<BacktestReport> {
        let Runner {
            config,
            engine,
            feeder,
            caller,
            repository,
            notifier,
            control: _,
            mut events,
        } = self;
        let core = caller.core().clone();

        // control events sent before the start apply to the first candle
        while let Ok(event) = events.try_recv() {
            handle_event(&core, repository.as_deref(), notifier.as_ref(), event).await;
        }

        let mut feeds = Vec::new();
        for option in &config.pairs {
            let mut rx = feeder
                .candles_subscription(&option.pair, &config.caller.timeframe)
                .await
                .with_context(|| format!("Failed to subscribe to {}", option.pair))?;
            let engine = engine.clone();
            let caller = caller.clone();
            let pair = option.pair.clone();

            feeds.push(tokio::spawn(async move {
                while let Some(candle) = rx.recv().await {
                    if !caller.core().is_running() {
                        break;
                    }
                    engine.on_candle(&candle).await;
                    if let Err(e) = caller.on_candle(&candle).await {
                        warn!(pair = %pair, time = %candle.time, error = %e, "Candle evaluation failed");
                    }
                }
                info!(pair = %pair, "Feed finished");
            }));
        }

        let mut tickers = caller.start();

        let (stop_pump, mut pump_stopped) = oneshot::channel::<()>();
        let pump = {
            let core = core.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        Some(event) = events.recv() => {
                            handle_event(&core, repository.as_deref(), notifier.as_ref(), event).await;
                        }
                        _ = &mut pump_stopped => break,
                    }
                }
                while let Ok(event) = events.try_recv() {
                    handle_event(&core, repository.as_deref(), notifier.as_ref(), event).await;
                }
                repository
            })
        };

        info!(mode = config.caller.mode.as_str(), pairs = config.pairs.len(), "Paper trading started");

        tokio::select! {
            _ = join_all(feeds) => info!("All feeds finished"),
            _ = tokio::signal::ctrl_c() => info!("Shutdown signal received"),
        }

        core.stop();
        if tokio::time::timeout(Duration::from_secs(5), join_all(tickers.iter_mut()))
            .await
            .is_err()
        {
            debug!("Tickers still waiting, aborting");
            for handle in &tickers {
                handle.abort();
            }
        }

        // the pump drains what is queued, then hands the repository back
        let _ = stop_pump.send(());
        let repository = pump.await.context("Event pump panicked")?;

        if let Some(repository) = repository.as_deref() {
            persist_orders(repository, &engine).await?;
        }
        log_account(engine.as_ref(), &config.exchange.quote_asset, &config.pairs).await;
        let report = build_report(&engine).await;
        info!(trades = report.total_trades, final_equity = %report.final_equity, "Paper trading stopped");
        Ok(report)
    }

    async fn step(&self, candle: &Candle) {
        self.engine.on_candle(candle).await;
        if let Err(e) = self.caller.on_candle(candle).await {
            warn!(pair = %candle.pair, time = %candle.time, error = %e, "Candle evaluation failed");
        }
    }

    async fn pump_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            handle_event(self.caller.core(), self.repository.as_deref(), self.notifier.as_ref(), event).await;
        }
    }

    async fn persist_orders(&self) -> Result<()> {
        match self.repository.as_deref() {
            Some(repository) => persist_orders(repository, &self.engine).await,
            None => Ok(()),
        }
    }

    pub async fn report(&self) -> BacktestReport {
        build_report(&self.engine).await
    }
}

async fn handle_event(
    core: &CallerCore,
    repository: Option<&dyn OrderRepository>,
    notifier: &dyn Notifier,
    event: CallerEvent,
) {
    match &event {
        CallerEvent::PairStatus { pair, enabled } => core.set_pair_enabled(pair, *enabled),
        CallerEvent::PositionOpened { order } | CallerEvent::OrderClosed { order, .. } => {
            if let Some(repository) = repository {
                if let Err(e) = repository.create_order(order).await {
                    warn!(order_id = %order.id, error = %e, "Failed to log order");
                }
            }
        }
    }
    notifier.notify(&event).await;
}

/// Write the engine's final order states: known orders are updated, the
/// rest (stops, add-ons) are created.
async fn persist_orders(repository: &dyn OrderRepository, engine: &MatchingEngine) -> Result<()> {
    let known: HashSet<String> = repository
        .orders(&OrderFilter::default())
        .await?
        .into_iter()
        .map(|o| o.id)
        .collect();

    let orders = engine.orders().await;
    for order in &orders {
        if known.contains(&order.id) {
            repository.update_order(order).await?;
        } else {
            repository.create_order(order).await?;
        }
    }
    debug!(orders = orders.len(), "Order log synced");
    Ok(())
}

/// Final wallet as the broker reports it, and any exposure left open.
async fn log_account(broker: &dyn Broker, quote_asset: &str, pairs: &[PairOption]) {
    match broker.account().await {
        Ok(account) => {
            let quote = account.balance(quote_asset);
            info!(asset = %quote_asset, free = %quote.free, lock = %quote.lock, "Final balance");
        }
        Err(e) => warn!(error = %e, "Failed to read account"),
    }

    for option in pairs {
        match broker.position(&option.pair).await {
            Ok((net, _)) if net.is_zero() => {}
            Ok((net, quote_total)) => {
                info!(pair = %option.pair, net = %net, quote_total = %quote_total, "Position left open")
            }
            Err(e) => warn!(pair = %option.pair, error = %e, "Failed to read position"),
        }
    }
}

async fn build_report(engine: &MatchingEngine) -> BacktestReport {
    let trades = engine.trades().await;
    let curve = engine.equity_curve().await;
    let mut volume = rust_decimal::Decimal::ZERO;
    for pair in trades.iter().map(|t| t.pair.as_str()).collect::<HashSet<_>>() {
        volume += engine.volume(pair).await;
    }
    ReportCalculator::calculate(engine.initial_balance(), &trades, &curve, engine.total_fees().await, volume)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caller::testkit::{flat, FixedStrategy};
    use crate::config::CallerMode;
    use crate::db::SqliteOrderRepository;
    use crate::events::LogNotifier;
    use crate::models::{CloseReason, SideType, StrategySignal};
    use rust_decimal_macros::dec;

    fn history() -> Vec<Candle> {
        // flat, a rally that arms the profit lock, then a give-back
        let closes = [
            dec!(100), dec!(100), dec!(100), dec!(101), dec!(102), dec!(103), dec!(102.5), dec!(101), dec!(100.5),
        ];
        closes.iter().enumerate().map(|(i, c)| flat(i as i64, *c)).collect()
    }

    async fn runner(repository: Option<Arc<dyn OrderRepository>>) -> (Runner, Arc<FixedStrategy>) {
        let config = AppConfig {
            caller: crate::config::CallerSetting {
                mode: CallerMode::Candle,
                ..Default::default()
            },
            ..Default::default()
        };
        let strategy = Arc::new(FixedStrategy::default());
        strategy.set(vec![StrategySignal::new("sma", SideType::Buy, 1.0, dec!(2))]);
        let runner = Runner::new(
            config,
            Arc::new(HistoryFeeder::new(history())),
            strategy.clone(),
            None,
            repository,
            Arc::new(LogNotifier),
        )
        .unwrap();
        (runner, strategy)
    }

    #[tokio::test]
    async fn test_backtest_closes_on_profit_back_and_logs_orders() {
        let repository = Arc::new(SqliteOrderRepository::new("sqlite::memory:").await.unwrap());
        let (mut runner, _) = runner(Some(repository.clone())).await;

        let report = runner.backtest(None, None).await.unwrap();

        assert!(report.total_trades >= 1);
        assert_eq!(report.close_reasons.get(CloseReason::ProfitBack.as_str()), Some(&1));
        let btc_only = OrderFilter {
            pair: Some("BTCUSDT".to_string()),
            ..Default::default()
        };
        let stored = repository.orders(&btc_only).await.unwrap();
        assert_eq!(stored, runner.engine().orders().await);
    }

    #[tokio::test]
    async fn test_backtest_is_deterministic() {
        let (mut first, _) = runner(None).await;
        let (mut second, _) = runner(None).await;

        first.backtest(None, None).await.unwrap();
        second.backtest(None, None).await.unwrap();

        assert_eq!(first.engine().equity_curve().await, second.engine().equity_curve().await);
        assert_eq!(first.engine().trades().await.len(), second.engine().trades().await.len());
    }

    #[tokio::test]
    async fn test_pair_status_blocks_entries() {
        let (mut runner, _) = runner(None).await;
        runner
            .control()
            .send(CallerEvent::PairStatus {
                pair: "BTCUSDT".to_string(),
                enabled: false,
            })
            .unwrap();

        runner.backtest(None, None).await.unwrap();

        assert!(runner.engine().orders().await.is_empty());
        assert!(!runner.caller().core().is_enabled("BTCUSDT"));
    }
}
