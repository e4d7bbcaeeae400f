//! Trading callers: one shared core and six driving modes.

mod candle;
mod core;
mod dual;
mod grid;
mod interval;
pub mod profit;
mod scoop;
pub mod signal;
pub mod sizing;
mod watchdog;

pub use self::core::{CallerCore, Clock};
pub use candle::CandleCaller;
pub use dual::DualCaller;
pub use grid::GridCaller;
pub use interval::IntervalCaller;
pub use scoop::ScoopCaller;
pub use watchdog::WatchdogCaller;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use self::scoop::until_next_boundary;
use crate::broker::GuiderSource;
use crate::config::CallerMode;
use crate::models::Candle;

/// The caller variant selected by configuration.
pub enum Caller {
    Interval(IntervalCaller),
    Candle(CandleCaller),
    Scoop(ScoopCaller),
    Dual(DualCaller),
    Grid(GridCaller),
    Watchdog(WatchdogCaller),
}

impl Caller {
    pub fn new(mode: CallerMode, core: Arc<CallerCore>, guider: Option<Arc<dyn GuiderSource>>) -> Result<Self> {
        let caller = match mode {
            CallerMode::Interval => Caller::Interval(IntervalCaller::new(core)),
            CallerMode::Candle => Caller::Candle(CandleCaller::new(core)),
            CallerMode::Scoop => Caller::Scoop(ScoopCaller::new(core)),
            CallerMode::Dual => Caller::Dual(DualCaller::new(core)),
            CallerMode::Grid => Caller::Grid(GridCaller::new(core)),
            CallerMode::Watchdog => match guider {
                Some(guider) => Caller::Watchdog(WatchdogCaller::new(core, guider)),
                None => bail!("watchdog mode needs a guider source"),
            },
        };
        Ok(caller)
    }

    pub fn mode(&self) -> CallerMode {
        match self {
            Caller::Interval(_) => CallerMode::Interval,
            Caller::Candle(_) => CallerMode::Candle,
            Caller::Scoop(_) => CallerMode::Scoop,
            Caller::Dual(_) => CallerMode::Dual,
            Caller::Grid(_) => CallerMode::Grid,
            Caller::Watchdog(_) => CallerMode::Watchdog,
        }
    }

    pub fn core(&self) -> &Arc<CallerCore> {
        match self {
            Caller::Interval(c) => &c.core,
            Caller::Candle(c) => &c.core,
            Caller::Scoop(c) => &c.core,
            Caller::Dual(c) => &c.core,
            Caller::Grid(c) => &c.core,
            Caller::Watchdog(c) => &c.core,
        }
    }

    /// Feed one candle: record it, run the mode, then the timeout sweep when
    /// no wall-clock ticker owns it.
    pub async fn on_candle(&self, candle: &Candle) -> Result<()> {
        let core = self.core();
        core.record_candle(candle).await;

        let step = match self {
            Caller::Interval(c) => c.on_candle(candle).await,
            Caller::Candle(c) => c.on_candle(candle).await,
            Caller::Scoop(c) => c.on_candle(candle).await,
            Caller::Dual(c) => c.on_candle(candle).await,
            Caller::Grid(c) => c.on_candle(candle).await,
            Caller::Watchdog(c) => c.on_candle(candle).await,
        };

        // the sweep runs even when the mode step failed
        let mut swept = Ok(());
        if !core.tickers_running() {
            let every = chrono::Duration::seconds(core.setting().timeout_check_secs as i64);
            if core.tick_due("timeout", every).await {
                swept = core.check_order_timeout().await;
            }
        }
        step.and(swept)
    }

    pub async fn event_call_open(&self, pair: &str) -> Result<()> {
        match self {
            Caller::Interval(c) => c.event_call_open(pair).await,
            Caller::Candle(c) => c.event_call_open(pair).await,
            Caller::Scoop(c) => c.event_call_open(pair).await,
            Caller::Dual(c) => c.event_call_open(pair).await,
            Caller::Grid(c) => c.event_call_open(pair).await,
            Caller::Watchdog(c) => c.event_call_open(pair).await,
        }
    }

    pub async fn event_call_close(&self, pair: &str) -> Result<()> {
        match self {
            Caller::Interval(c) => c.event_call_close(pair).await,
            Caller::Candle(c) => c.event_call_close(pair).await,
            Caller::Scoop(c) => c.event_call_close(pair).await,
            Caller::Dual(c) => c.event_call_close(pair).await,
            Caller::Grid(c) => c.event_call_close(pair).await,
            Caller::Watchdog(c) => c.event_call_close(pair).await,
        }
    }

    pub async fn check_order_timeout(&self) -> Result<()> {
        self.core().check_order_timeout().await
    }

    /// Spawn the wall-clock tickers for this mode. From then on candles only
    /// refresh market data for the timer-driven modes.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let core = self.core().clone();
        core.set_tickers_running(true);
        let setting = core.setting().clone();
        let open_every = Duration::from_secs(setting.open_interval_secs.max(1));
        let close_every = Duration::from_secs(setting.close_interval_secs.max(1));
        let timeout_every = Duration::from_secs(setting.timeout_check_secs.max(1));

        let mut handles = Vec::new();
        for pair in core.pairs() {
            match self.mode() {
                CallerMode::Interval => {
                    handles.push(self.spawn_ticker(pair.clone(), "open", open_every, |c, p| async move {
                        c.event_call_open(&p).await
                    }));
                    handles.push(self.spawn_ticker(pair.clone(), "close", close_every, |c, p| async move {
                        c.event_call_close(&p).await
                    }));
                }
                CallerMode::Scoop => {
                    handles.push(self.spawn_scoop_opener(pair.clone(), setting.scoop_boundary_mins));
                    handles.push(self.spawn_ticker(pair.clone(), "close", close_every, |c, p| async move {
                        c.event_call_close(&p).await
                    }));
                }
                CallerMode::Watchdog => {
                    handles.push(self.spawn_ticker(pair.clone(), "open", open_every, |c, p| async move {
                        c.event_call_open(&p).await
                    }));
                }
                CallerMode::Candle | CallerMode::Dual | CallerMode::Grid => {}
            }
        }

        handles.push(self.spawn_ticker("*".to_string(), "timeout", timeout_every, |c, _| async move {
            c.check_order_timeout().await
        }));

        info!(mode = self.mode().as_str(), tasks = handles.len(), "Caller tickers started");
        handles
    }

    fn spawn_ticker<F, Fut>(self: &Arc<Self>, pair: String, kind: &'static str, every: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Caller>, String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send,
    {
        let caller = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !caller.core().is_running() {
                    break;
                }
                if let Err(e) = tick(caller.clone(), pair.clone()).await {
                    warn!(pair = %pair, kind, error = %e, "Tick failed");
                }
            }
        })
    }

    /// Opens at each aligned boundary of the wall clock.
    fn spawn_scoop_opener(self: &Arc<Self>, pair: String, boundary_mins: u32) -> JoinHandle<()> {
        let caller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let wait = until_next_boundary(chrono::Utc::now(), boundary_mins);
                tokio::time::sleep(if wait.is_zero() {
                    Duration::from_secs(u64::from(boundary_mins.max(1)) * 60)
                } else {
                    wait
                })
                .await;
                if !caller.core().is_running() {
                    break;
                }
                if let Err(e) = caller.event_call_open(&pair).await {
                    warn!(pair = %pair, kind = "open", error = %e, "Tick failed");
                }
            }
        })
    }
}
