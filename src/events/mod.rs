use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Domain events published after a transaction commits. Delivery is
/// fire-and-forget: the notification side never participates in (or rolls
/// back) the transaction that produced the event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    // Cart events
    CartCreated(Uuid),
    CartUpdated(Uuid),
    CartItemAdded {
        cart_id: Uuid,
        product_id: Uuid,
    },
    CartCleared(Uuid),
    CartsMerged {
        source_cart_id: Uuid,
        target_cart_id: Uuid,
    },

    // Order events
    OrderCreated(Uuid),
    OrderPaid(Uuid),
    OrderCancelled {
        order_id: Uuid,
        reason: String,
    },
    OrderRefunded {
        order_id: Uuid,
        amount: Decimal,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },

    // Payment events
    PaymentCreated {
        payment_id: Uuid,
        order_id: Uuid,
    },
    PaymentCompleted {
        payment_id: Uuid,
        order_id: Uuid,
    },
    PaymentFailed {
        payment_id: Uuid,
        order_id: Uuid,
        reason: String,
    },
    PaymentExpired {
        payment_id: Uuid,
        order_id: Uuid,
    },

    // Inventory events
    StockReserved {
        order_id: Uuid,
        lines: usize,
    },
    StockRestored {
        order_id: Uuid,
        lines: usize,
    },

    // Coupon events
    CouponRedeemed {
        coupon_id: Uuid,
        order_id: Uuid,
        discount: Decimal,
    },

    // Generic event for custom messages
    Generic {
        message: String,
        timestamp: DateTime<Utc>,
        metadata: serde_json::Value,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event, logging instead of failing when the consumer is
    /// gone. Used on commit paths where event delivery must never abort
    /// the business operation.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event).await {
            warn!("Event dropped: {}", e);
        }
    }
}

/// Builds a connected (sender, consumer-task-input) pair.
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Event consumer loop. Stands in for the notification service: order and
/// payment events become customer-facing messages (confirmation, shipped,
/// cancelled) with at-least-once semantics owned by the downstream system.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::OrderCreated(order_id) => {
                info!(order_id = %order_id, "Dispatching order confirmation notification");
            }
            Event::OrderPaid(order_id) => {
                info!(order_id = %order_id, "Dispatching payment-received notification");
            }
            Event::OrderCancelled { order_id, reason } => {
                info!(order_id = %order_id, reason = %reason, "Dispatching cancellation notification");
            }
            Event::OrderRefunded { order_id, amount } => {
                info!(order_id = %order_id, amount = %amount, "Dispatching refund notification");
            }
            Event::PaymentFailed {
                payment_id, reason, ..
            } => {
                info!(payment_id = %payment_id, reason = %reason, "Dispatching payment-failed notification");
            }
            other => {
                info!(event = ?other, "Event observed");
            }
        }
    }

    info!("Event processing loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_consumer() {
        let (sender, mut rx) = channel(8);
        sender
            .send(Event::OrderCreated(Uuid::new_v4()))
            .await
            .expect("send should succeed");
        assert!(matches!(rx.recv().await, Some(Event::OrderCreated(_))));
    }

    #[tokio::test]
    async fn send_or_log_swallows_closed_channel() {
        let (sender, rx) = channel(1);
        drop(rx);
        // Must not panic or error out.
        sender.send_or_log(Event::CartCreated(Uuid::new_v4())).await;
    }
}
