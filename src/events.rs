//! Inter-engine events
//!
//! The order engine publishes lifecycle events on a broadcast bus; interested
//! observers (copy-trading dispatch, notifications) subscribe independently.
//! Lagging subscribers drop old events rather than back-pressuring the engine.

use rust_decimal::Decimal;
use tokio::sync::broadcast;

use crate::core_types::{Network, OrderId, Token, UserId};

/// A spot order reached COMPLETED with a recorded execution result.
#[derive(Debug, Clone)]
pub struct OrderCompleted {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub network: Network,
    pub from_token: Token,
    pub to_token: Token,
    pub amount: Decimal,
    pub output_amount: Decimal,
    pub venue: String,
}

/// Broadcast bus for order lifecycle events.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<OrderCompleted>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Returns silently when nobody is subscribed.
    pub fn publish(&self, event: OrderCompleted) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderCompleted> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
