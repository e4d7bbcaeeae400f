//! Interval mode: open and close checks on a fixed tick.

use std::sync::Arc;

use anyhow::Result;
use chrono::Duration;

use super::core::CallerCore;
use crate::models::Candle;

pub struct IntervalCaller {
    pub(super) core: Arc<CallerCore>,
}

impl IntervalCaller {
    pub fn new(core: Arc<CallerCore>) -> Self {
        Self { core }
    }

    /// Without wall-clock tickers, candle time paces the ticks.
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

        let open_every = Duration::seconds(setting.open_interval_secs as i64);
        if self.core.tick_due(&format!("{}:open", pair), open_every).await {
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

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use crate::broker::Broker;
    use crate::caller::testkit::{flat, Kit};
    use crate::caller::Caller;
    use crate::config::{CallerMode, CallerSetting};
    use crate::models::{Candle, CloseReason, SideType, StrategySignal};

    fn at(secs: i64, price: Decimal) -> Candle {
        let mut candle = flat(0, price);
        candle.time += chrono::Duration::seconds(secs);
        candle
    }

    #[tokio::test]
    async fn test_candle_time_paces_open_and_close() {
        let setting = CallerSetting {
            mode: CallerMode::Interval,
            open_interval_secs: 60,
            close_interval_secs: 30,
            ..Default::default()
        };
        let kit = Kit::new(setting);
        let caller = Caller::new(CallerMode::Interval, kit.core.clone(), None).unwrap();

        kit.strategy.set(vec![StrategySignal::new("sma", SideType::Buy, 1.0, dec!(2))]);
        kit.feed(&caller, &at(0, dec!(100))).await;
        assert_eq!(kit.strategy.calls(), 1);
        kit.strategy.set(Vec::new());

        kit.feed(&caller, &at(10, dec!(100))).await;
        assert_eq!(kit.engine.get_positions_for_pair("BTCUSDT").await.unwrap().len(), 1);

        // past the loss limit, but the next close tick is at 30s
        kit.feed(&caller, &at(20, dec!(94))).await;
        assert_eq!(kit.engine.get_positions_for_pair("BTCUSDT").await.unwrap().len(), 1);

        kit.feed(&caller, &at(30, dec!(94))).await;
        let trades = kit.engine.trades().await;
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].reason, Some(CloseReason::LossMax));

        for secs in [40, 50] {
            kit.feed(&caller, &at(secs, dec!(94))).await;
        }
        assert_eq!(kit.strategy.calls(), 1);

        kit.feed(&caller, &at(60, dec!(94))).await;
        kit.feed(&caller, &at(90, dec!(94))).await;
        assert_eq!(kit.strategy.calls(), 2);
        kit.feed(&caller, &at(120, dec!(94))).await;
        assert_eq!(kit.strategy.calls(), 3);
    }

    #[tokio::test]
    async fn test_running_tickers_own_the_evaluations() {
        let setting = CallerSetting {
            mode: CallerMode::Interval,
            ..Default::default()
        };
        let kit = Kit::new(setting);
        let caller = Caller::new(CallerMode::Interval, kit.core.clone(), None).unwrap();
        kit.core.set_tickers_running(true);

        for minute in 0..5 {
            kit.feed(&caller, &flat(minute, dec!(100))).await;
        }
        assert_eq!(kit.strategy.calls(), 0);
    }
}
