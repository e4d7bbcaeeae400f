//! Candle mode: open on completed candles, close on every candle, and scale
//! into positions that keep running in the signalled direction.

use std::sync::Arc;

use anyhow::Result;

use super::core::{CallerCore, OpenOutcome};
use crate::models::Candle;

pub struct CandleCaller {
    pub(super) core: Arc<CallerCore>,
}

impl CandleCaller {
    pub fn new(core: Arc<CallerCore>) -> Self {
        Self { core }
    }

    pub async fn on_candle(&self, candle: &Candle) -> Result<()> {
        self.event_call_close(&candle.pair).await?;
        if candle.complete {
            self.event_call_open(&candle.pair).await?;
        }
        Ok(())
    }

    pub async fn event_call_open(&self, pair: &str) -> Result<()> {
        let _guard = self.core.lock_pair(pair).await;
        if let OpenOutcome::Held(position) = self.core.open_locked(pair).await? {
            let price = self.core.last_price(pair).await?;
            self.core.scale_in_locked(&position, price).await?;
        }
        Ok(())
    }

    pub async fn event_call_close(&self, pair: &str) -> Result<()> {
        self.core.event_close(pair).await
    }
}
