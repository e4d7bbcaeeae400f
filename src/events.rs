//! Lifecycle events flowing in and out of the caller.

use async_trait::async_trait;
use tracing::info;

use crate::models::{CloseReason, Order};

/// Events exchanged between the caller and the runner over an mpsc channel.
#[derive(Debug, Clone)]
pub enum CallerEvent {
    /// Enable or disable new entries for a pair (inbound)
    PairStatus { pair: String, enabled: bool },

    /// An entry order was placed (outbound)
    PositionOpened { order: Order },

    /// A position was finished with a market exit (outbound)
    OrderClosed { order: Order, reason: CloseReason },
}

/// Receives outbound lifecycle events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &CallerEvent);
}

/// Writes events to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: &CallerEvent) {
        match event {
            CallerEvent::PairStatus { pair, enabled } => {
                info!(pair = %pair, enabled, "Pair status changed");
            }
            CallerEvent::PositionOpened { order } => {
                info!(
                    pair = %order.pair,
                    flag = %order.order_flag,
                    side = %order.side,
                    position_side = %order.position_side,
                    quantity = %order.quantity,
                    price = %order.price,
                    ratio = order.long_short_ratio,
                    "Entry order placed"
                );
            }
            CallerEvent::OrderClosed { order, reason } => {
                info!(
                    pair = %order.pair,
                    flag = %order.order_flag,
                    position_side = %order.position_side,
                    quantity = %order.quantity,
                    price = %order.price,
                    reason = %reason,
                    "Position finished"
                );
            }
        }
    }
}
