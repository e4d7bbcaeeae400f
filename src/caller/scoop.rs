//! Scoop mode: entries only on aligned time boundaries, closes on their own
//! ticker.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};

use super::core::CallerCore;
use crate::models::Candle;

/// True when `time` sits exactly on a `boundary_mins` boundary.
pub fn is_boundary(time: DateTime<Utc>, boundary_mins: u32) -> bool {
    let period = i64::from(boundary_mins.max(1)) * 60_000;
    time.timestamp_millis().rem_euclid(period) == 0
}

/// Wall time left until the next boundary (zero when on one).
pub fn until_next_boundary(now: DateTime<Utc>, boundary_mins: u32) -> std::time::Duration {
    let period = i64::from(boundary_mins.max(1)) * 60_000;
    let rem = now.timestamp_millis().rem_euclid(period);
    let wait = if rem == 0 { 0 } else { period - rem };
    std::time::Duration::from_millis(wait as u64)
}

pub struct ScoopCaller {
    pub(super) core: Arc<CallerCore>,
}

impl ScoopCaller {
    pub fn new(core: Arc<CallerCore>) -> Self {
        Self { core }
    }

    pub async fn on_candle(&self, candle: &Candle) -> Result<()> {
        if self.core.tickers_running() {
            return Ok(());
        }
        let setting = self.core.setting();
        let pair = &candle.pair;

        let close_every = Duration::seconds(setting.close_interval_secs as i64);
        if self.core.tick_due(&format!("{}:close", pair), close_every).await {
            self.event_call_close(pair).await?;
        }

        if candle.complete && is_boundary(candle.time, setting.scoop_boundary_mins) {
            self.event_call_open(pair).await?;
        }
        Ok(())
    }

    pub async fn event_call_open(&self, pair: &str) -> Result<()> {
        self.core.event_open(pair).await.map(|_| ())
    }

    pub async fn event_call_close(&self, pair: &str) -> Result<()> {
        self.core.event_close(pair).await
    }
}
