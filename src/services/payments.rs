use crate::{
    config::AppConfig,
    entities::{order, payment, payment_method, Order, Payment, PaymentMethod},
    errors::ServiceError,
    events::{Event, EventSender},
    gateways::{CheckoutRedirect, GatewayRegistry, GatewayStatus},
    services::{idempotency::IdempotencyGuard, orders::OrderService, orders::record_status_change},
};
use chrono::{Duration, Utc};
use rand::{rngs::OsRng, Rng};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Generates the webhook/reconciliation correlation key.
/// Format: `TXN{yymmddHHMMSS}{6 digits}`.
pub fn generate_transaction_id() -> String {
    let date_part = Utc::now().format("%y%m%d%H%M%S");
    let mut rng = OsRng;
    let suffix: u32 = rng.gen_range(0..1_000_000);
    format!("TXN{}{:06}", date_part, suffix)
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct CreatePaymentInput {
    pub order_id: Uuid,
    pub payment_method_code: String,
    pub return_url: String,
    /// Client-supplied token making payment creation safe to retry.
    pub idempotency_key: Option<String>,
}

/// Freshly created payment plus where to send the customer.
#[derive(Debug, Serialize)]
pub struct PaymentCheckout {
    pub payment: payment::Model,
    pub payment_url: Option<String>,
}

/// What [`PaymentService::apply_gateway_result`] did with a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentTransition {
    /// Payment moved to completed; order marked paid.
    Completed,
    /// Payment moved to failed; inventory released where possible.
    Failed,
    /// Payment was already settled; redelivered notification, no-op.
    AlreadySettled,
    /// Gateway still reports the payment in flight; nothing changed.
    StillPending,
}

/// Payment lifecycle: creation against an order, and the single
/// state-transition function that webhooks, the reconciliation poller and
/// the expiry sweep all converge on.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    event_sender: EventSender,
    gateways: Arc<GatewayRegistry>,
    orders: Arc<OrderService>,
    config: Arc<AppConfig>,
    idempotency: IdempotencyGuard,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        event_sender: EventSender,
        gateways: Arc<GatewayRegistry>,
        orders: Arc<OrderService>,
        config: Arc<AppConfig>,
    ) -> Self {
        let ttl = std::time::Duration::from_secs(config.payments.idempotency_ttl_secs);
        Self {
            db,
            event_sender,
            gateways,
            orders,
            config,
            idempotency: IdempotencyGuard::new(ttl),
        }
    }

    /// Creates a payment attempt for a pending order and opens a checkout
    /// session at the gateway. At most one payment per order may ever
    /// complete; a paid order refuses new attempts outright.
    #[instrument(skip(self, input), fields(order_id = %input.order_id, method = %input.payment_method_code))]
    pub async fn create_payment(
        &self,
        input: CreatePaymentInput,
    ) -> Result<PaymentCheckout, ServiceError> {
        if let Some(key) = &input.idempotency_key {
            if !self.idempotency.claim(key) {
                return Err(ServiceError::Conflict(
                    "A payment request with this idempotency key is already in progress"
                        .to_string(),
                ));
            }
        }

        let result = self.create_payment_inner(&input).await;

        if result.is_err() {
            if let Some(key) = &input.idempotency_key {
                self.idempotency.release(key);
            }
        }

        result
    }

    async fn create_payment_inner(
        &self,
        input: &CreatePaymentInput,
    ) -> Result<PaymentCheckout, ServiceError> {
        let txn = self.db.begin().await?;

        let order = Order::find_by_id(input.order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", input.order_id)))?;

        if order.payment_status == order::OrderPaymentStatus::Paid {
            return Err(ServiceError::Conflict("Order is already paid".to_string()));
        }
        if order.status != order::OrderStatus::Pending {
            return Err(ServiceError::InvalidOperation(format!(
                "Order in status {} does not accept payments",
                order.status
            )));
        }

        let completed_exists = Payment::find()
            .filter(payment::Column::OrderId.eq(order.id))
            .filter(payment::Column::Status.eq(payment::PaymentStatus::Completed))
            .one(&txn)
            .await?
            .is_some();
        if completed_exists {
            return Err(ServiceError::Conflict(
                "Order already has a completed payment".to_string(),
            ));
        }

        let method = PaymentMethod::find()
            .filter(payment_method::Column::Code.eq(input.payment_method_code.clone()))
            .filter(payment_method::Column::IsActive.eq(true))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Payment method {} not found",
                    input.payment_method_code
                ))
            })?;

        if !method.accepts_amount(order.total) {
            return Err(ServiceError::ValidationError(format!(
                "Amount {} is outside the bounds of payment method {}",
                order.total, method.code
            )));
        }

        let fee = method.calculate_fee(order.total);
        let now = Utc::now();
        let payment = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            transaction_id: Set(generate_transaction_id()),
            order_id: Set(order.id),
            customer_id: Set(order.customer_id),
            payment_method_id: Set(method.id),
            gateway: Set(method.gateway.clone()),
            currency: Set(order.currency.clone()),
            amount: Set(order.total),
            fee: Set(fee),
            net_amount: Set(order.total - fee),
            status: Set(payment::PaymentStatus::Pending),
            gateway_transaction_id: Set(None),
            gateway_response: Set(None),
            failure_reason: Set(None),
            paid_at: Set(None),
            expires_at: Set(Some(now + Duration::hours(self.config.payments.expiry_hours))),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await?;

        let gateway = self.gateways.get(&method.gateway)?;
        let redirect: CheckoutRedirect = gateway
            .build_checkout(&order, &payment, &input.return_url)
            .await?;

        let mut update: payment::ActiveModel = payment.clone().into();
        update.gateway_response = Set(Some(serde_json::json!({
            "payment_url": redirect.payment_url,
            "gateway": redirect.gateway,
        })));
        update.updated_at = Set(Utc::now());
        let payment = update.update(&txn).await?;

        txn.commit().await?;

        self.event_sender
            .send_or_log(Event::PaymentCreated {
                payment_id: payment.id,
                order_id: payment.order_id,
            })
            .await;

        info!(
            transaction_id = %payment.transaction_id,
            order_id = %payment.order_id,
            amount = %payment.amount,
            "Payment created"
        );

        Ok(PaymentCheckout {
            payment_url: redirect.payment_url,
            payment,
        })
    }

    /// The single choke point for payment state transitions. Webhook
    /// ingestion, the reconciliation poller and the expiry sweep all call
    /// this with the gateway-reported outcome; the current-state check
    /// makes redelivered or racing notifications no-ops, so inventory is
    /// never restored twice and an order is never double-marked paid.
    #[instrument(skip(self, raw))]
    pub async fn apply_gateway_result(
        &self,
        transaction_id: &str,
        outcome: GatewayStatus,
        gateway_transaction_id: Option<String>,
        raw: Option<serde_json::Value>,
    ) -> Result<PaymentTransition, ServiceError> {
        let txn = self.db.begin().await?;

        let payment = Payment::find()
            .filter(payment::Column::TransactionId.eq(transaction_id))
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::PaymentNotFound(transaction_id.to_string()))?;

        if !payment.status.is_open() {
            warn!(
                transaction_id = %transaction_id,
                status = %payment.status,
                "Notification for settled payment ignored"
            );
            return Ok(PaymentTransition::AlreadySettled);
        }

        let transition = match outcome {
            GatewayStatus::Pending => PaymentTransition::StillPending,
            GatewayStatus::Completed => {
                let order_id = payment.order_id;
                let payment_id = payment.id;

                let mut update: payment::ActiveModel = payment.into();
                update.status = Set(payment::PaymentStatus::Completed);
                update.paid_at = Set(Some(Utc::now()));
                if gateway_transaction_id.is_some() {
                    update.gateway_transaction_id = Set(gateway_transaction_id);
                }
                if let Some(raw) = raw {
                    update.gateway_response = Set(Some(raw));
                }
                update.updated_at = Set(Utc::now());
                update.update(&txn).await?;

                self.mark_order_paid(&txn, order_id).await?;
                txn.commit().await?;

                self.event_sender
                    .send_or_log(Event::PaymentCompleted {
                        payment_id,
                        order_id,
                    })
                    .await;
                self.event_sender.send_or_log(Event::OrderPaid(order_id)).await;

                info!(transaction_id = %transaction_id, order_id = %order_id, "Payment completed");
                return Ok(PaymentTransition::Completed);
            }
            GatewayStatus::Failed { reason } => {
                let order_id = payment.order_id;
                let payment_id = payment.id;

                let mut update: payment::ActiveModel = payment.into();
                update.status = Set(payment::PaymentStatus::Failed);
                update.failure_reason = Set(Some(reason.clone()));
                if let Some(raw) = raw {
                    update.gateway_response = Set(Some(raw));
                }
                update.updated_at = Set(Utc::now());
                update.update(&txn).await?;

                // Release the stock the order is holding. The order may
                // already be paid through another attempt or cancelled by
                // the sweep; that is not an error here.
                match self
                    .orders
                    .cancel_within(&txn, order_id, "Payment failed")
                    .await
                {
                    Ok(_) => {}
                    Err(ServiceError::OrderNotCancellable { status, .. }) => {
                        warn!(
                            order_id = %order_id,
                            status = %status,
                            "Skipping stock restoration for non-cancellable order"
                        );
                    }
                    Err(other) => return Err(other),
                }

                txn.commit().await?;

                self.event_sender
                    .send_or_log(Event::PaymentFailed {
                        payment_id,
                        order_id,
                        reason: reason.clone(),
                    })
                    .await;

                warn!(transaction_id = %transaction_id, reason = %reason, "Payment failed");
                return Ok(PaymentTransition::Failed);
            }
        };

        // StillPending: nothing written; drop the transaction.
        Ok(transition)
    }

    /// Flips the owning order to paid, inside the caller's transaction.
    async fn mark_order_paid(
        &self,
        txn: &sea_orm::DatabaseTransaction,
        order_id: Uuid,
    ) -> Result<(), ServiceError> {
        let order = Order::find()
            .filter(order::Column::Id.eq(order_id))
            .lock_exclusive()
            .one(txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order.payment_status == order::OrderPaymentStatus::Paid {
            return Ok(());
        }

        let old_status = order.status;
        let now = Utc::now();
        let mut update: order::ActiveModel = order.into();
        update.status = Set(order::OrderStatus::Paid);
        update.payment_status = Set(order::OrderPaymentStatus::Paid);
        update.paid_at = Set(Some(now));
        update.updated_at = Set(now);
        update.update(txn).await?;

        record_status_change(txn, order_id, old_status, order::OrderStatus::Paid, "Payment confirmed")
            .await?;

        Ok(())
    }

    /// Fetches one payment by its correlation key.
    pub async fn get_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<payment::Model, ServiceError> {
        Payment::find()
            .filter(payment::Column::TransactionId.eq(transaction_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::PaymentNotFound(transaction_id.to_string()))
    }

    /// Fetches one payment by id.
    pub async fn get_payment(&self, payment_id: Uuid) -> Result<payment::Model, ServiceError> {
        Payment::find_by_id(payment_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_ids_have_prefix_timestamp_and_digits() {
        let id = generate_transaction_id();
        assert!(id.starts_with("TXN"));
        assert_eq!(id.len(), 3 + 12 + 6);
        assert!(id[3..].chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn transaction_ids_differ_across_draws() {
        // Same second; the random suffix must differentiate them.
        assert_ne!(generate_transaction_id(), generate_transaction_id());
    }
}
