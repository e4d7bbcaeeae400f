//! Watchdog mode: mirror a followed account instead of local signals.
//!
//! Each tick compares the local quantity on every leg with the guider's,
//! scaled by `follow_ratio`. Drift beyond the tolerance is closed with one
//! market order; a guider that went flat finishes the local leg.

use std::sync::Arc;

use anyhow::Result;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::core::{position_extra, CallerCore};
use super::signal::NO_CONSENSUS;
use super::sizing::round_down;
use crate::broker::{BrokerError, GuiderSource};
use crate::models::{Candle, CloseReason, OrderExtra, PositionSide};

/// Quantity change that brings `local` to `guider × target`, or `None` when
/// the relative drift is within `tolerance`.
pub fn watchdog_adjustment(local: Decimal, guider: Decimal, target: Decimal, tolerance: Decimal) -> Option<Decimal> {
    let desired = guider * target;
    if desired.is_zero() {
        return (local > Decimal::ZERO).then(|| -local);
    }
    let delta = desired - local;
    if (delta / desired).abs() <= tolerance {
        return None;
    }
    Some(delta)
}

pub struct WatchdogCaller {
    pub(super) core: Arc<CallerCore>,
    guider: Arc<dyn GuiderSource>,
}

impl WatchdogCaller {
    pub fn new(core: Arc<CallerCore>, guider: Arc<dyn GuiderSource>) -> Self {
        Self { core, guider }
    }

    pub async fn on_candle(&self, candle: &Candle) -> Result<()> {
        if self.core.tickers_running() {
            return Ok(());
        }
        let every = chrono::Duration::seconds(self.core.setting().open_interval_secs as i64);
        if self.core.tick_due(&format!("{}:open", candle.pair), every).await {
            self.event_call_open(&candle.pair).await?;
        }
        Ok(())
    }

    pub async fn event_call_open(&self, pair: &str) -> Result<()> {
        self.sync(pair).await
    }

    /// Closes follow the guider, so there is nothing to evaluate locally.
    pub async fn event_call_close(&self, _pair: &str) -> Result<()> {
        Ok(())
    }

    async fn sync(&self, pair: &str) -> Result<()> {
        let core = &self.core;
        let guider_positions = self.guider.positions().await?;

        let _guard = core.lock_pair(pair).await;
        let Some(option) = core.option(pair) else {
            return Ok(());
        };
        let setting = &core.setting().watchdog;
        let broker = core.broker();
        let positions = broker.get_positions_for_pair(pair).await?;
        let price = core.last_price(pair).await?;

        for side in [PositionSide::Long, PositionSide::Short] {
            let guider: Decimal = guider_positions
                .iter()
                .filter(|g| g.symbol == pair && g.position_side == side)
                .map(|g| g.amount.abs())
                .sum();
            let local = positions.iter().find(|p| p.position_side == side);
            let local_quantity = local.map_or(Decimal::ZERO, |p| p.quantity);

            let Some(delta) = watchdog_adjustment(local_quantity, guider, setting.follow_ratio, setting.tolerance) else {
                debug!(pair = %pair, side = %side, local = %local_quantity, guider = %guider, "In sync with guider");
                continue;
            };

            if guider.is_zero() {
                if let Some(position) = local {
                    core.finish_locked(position, CloseReason::GuiderClosed, price).await?;
                }
                continue;
            }

            let quantity = round_down(delta.abs(), option.quantity_precision);
            if quantity.is_zero() {
                continue;
            }

            if delta > Decimal::ZERO {
                if !core.is_enabled(pair) {
                    debug!(pair = %pair, "Pair disabled, not following guider entry");
                    continue;
                }
                match local {
                    Some(position) => {
                        core.add_market_locked(pair, side, quantity, position_extra(position, None)).await?;
                    }
                    None => {
                        let extra = OrderExtra::new_entry(option.leverage, NO_CONSENSUS);
                        if let Some(order) = core.add_market_locked(pair, side, quantity, extra).await? {
                            core.on_market_entry(&order).await;
                        }
                    }
                }
            } else if let Some(position) = local {
                match broker
                    .create_order_market(side.exit_side(), side, pair, quantity, position_extra(position, None))
                    .await
                {
                    Ok(_) => {}
                    Err(e @ BrokerError::InvalidQuantity { .. }) => {
                        warn!(pair = %pair, side = %side, error = %e, "Reduce rejected");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            }

            info!(
                pair = %pair,
                side = %side,
                local = %local_quantity,
                guider = %guider,
                delta = %delta,
                quantity = %quantity,
                "Adjusted toward guider"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::caller::testkit::{flat, Kit};
    use crate::caller::Caller;
    use crate::config::{CallerMode, CallerSetting};
    use crate::models::GuiderPosition;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct StubGuider(Mutex<Vec<GuiderPosition>>);

    impl StubGuider {
        fn long(amount: Decimal) -> Arc<Self> {
            let stub = Arc::new(Self(Mutex::new(Vec::new())));
            stub.set_long(amount);
            stub
        }

        fn set_long(&self, amount: Decimal) {
            let position = GuiderPosition {
                symbol: "BTCUSDT".to_string(),
                position_side: PositionSide::Long,
                amount,
                entry_price: dec!(100),
                leverage: 10,
                available_margin: dec!(1000),
            };
            *self.0.lock().unwrap() = vec![position];
        }
    }

    #[async_trait]
    impl GuiderSource for StubGuider {
        async fn positions(&self) -> Result<Vec<GuiderPosition>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    #[test]
    fn test_adjustment_tolerance() {
        // desired 1.0, local 0.99: 1% drift
        assert_eq!(watchdog_adjustment(dec!(0.99), dec!(10), dec!(0.1), dec!(0.02)), None);
        // 5% drift: one order for the gap
        assert_eq!(watchdog_adjustment(dec!(0.95), dec!(10), dec!(0.1), dec!(0.02)), Some(dec!(0.05)));
        // over-exposed
        assert_eq!(watchdog_adjustment(dec!(1.5), dec!(10), dec!(0.1), dec!(0.02)), Some(dec!(-0.5)));
        // guider flat
        assert_eq!(watchdog_adjustment(dec!(1), dec!(0), dec!(0.1), dec!(0.02)), Some(dec!(-1)));
        assert_eq!(watchdog_adjustment(dec!(0), dec!(0), dec!(0.1), dec!(0.02)), None);
    }

    #[tokio::test]
    async fn test_follows_guider_with_one_order_per_drift() {
        let setting = CallerSetting {
            mode: CallerMode::Watchdog,
            ..Default::default()
        };
        let kit = Kit::new(setting);
        let guider = StubGuider::long(dec!(10));
        let caller = Caller::new(CallerMode::Watchdog, kit.core.clone(), Some(guider.clone() as Arc<dyn GuiderSource>)).unwrap();

        kit.feed(&caller, &flat(0, dec!(100))).await;
        assert_eq!(kit.engine.orders().await.len(), 1);
        let positions = kit.engine.get_positions_for_pair("BTCUSDT").await.unwrap();
        assert_eq!(positions[0].quantity, dec!(1));

        // 1% drift: nothing
        guider.set_long(dec!(10.1));
        kit.feed(&caller, &flat(1, dec!(100))).await;
        assert_eq!(kit.engine.orders().await.len(), 1);

        // 5% drift: exactly one add-on
        guider.set_long(dec!(10.5));
        kit.feed(&caller, &flat(2, dec!(100))).await;
        assert_eq!(kit.engine.orders().await.len(), 2);
        let positions = kit.engine.get_positions_for_pair("BTCUSDT").await.unwrap();
        assert_eq!(positions[0].quantity, dec!(1.05));

        // guider flat: finished
        guider.set_long(dec!(0));
        kit.feed(&caller, &flat(3, dec!(100))).await;
        assert!(kit.engine.get_positions_for_pair("BTCUSDT").await.unwrap().is_empty());
    }
}
