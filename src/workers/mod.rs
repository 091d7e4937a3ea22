use crate::{
    config::AppConfig,
    entities::{order, payment, Order, Payment},
    errors::ServiceError,
    events::{Event, EventSender},
    gateways::{GatewayRegistry, GatewayStatus},
    services::{orders::OrderService, payments::PaymentService},
};
use chrono::{Duration, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

/// Outcome of one reconciliation run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub checked: usize,
    pub reconciled: usize,
    pub errors: usize,
}

/// Outcome of one sweep run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub swept: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Scheduled background jobs. Each is a plain async function against the
/// datastore; no in-memory queue state survives restarts because none is
/// needed: everything they act on lives in the payments/orders tables.
/// All three are idempotent and safe to run concurrently with webhook
/// delivery, because they funnel into the same payment transition
/// function that checks current state before acting.
pub struct Workers {
    db: Arc<DatabaseConnection>,
    payments: Arc<PaymentService>,
    orders: Arc<OrderService>,
    gateways: Arc<GatewayRegistry>,
    event_sender: EventSender,
    config: Arc<AppConfig>,
}

impl Workers {
    pub fn new(
        db: Arc<DatabaseConnection>,
        payments: Arc<PaymentService>,
        orders: Arc<OrderService>,
        gateways: Arc<GatewayRegistry>,
        event_sender: EventSender,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            db,
            payments,
            orders,
            gateways,
            event_sender,
            config,
        }
    }

    /// The correctness backstop for lost webhooks: payments pending past
    /// the grace window (but not yet expired) are actively re-queried at
    /// their gateway and the answer is fed through the same transition
    /// function the webhook path uses. One bad record never halts the
    /// sweep.
    #[instrument(skip(self))]
    pub async fn reconcile_pending_payments(&self) -> Result<ReconcileSummary, ServiceError> {
        let now = Utc::now();
        let newest = now - Duration::minutes(self.config.payments.reconcile_grace_minutes);
        let oldest = now - Duration::hours(self.config.payments.expiry_hours);

        let pending = Payment::find()
            .filter(payment::Column::Status.eq(payment::PaymentStatus::Pending))
            .filter(payment::Column::CreatedAt.lt(newest))
            .filter(payment::Column::CreatedAt.gt(oldest))
            .all(&*self.db)
            .await?;

        let mut summary = ReconcileSummary {
            checked: pending.len(),
            ..Default::default()
        };

        for record in pending {
            // Offline methods settle at fulfilment; nothing to query.
            if record.gateway == "cod" {
                continue;
            }

            let gateway = match self.gateways.get(&record.gateway) {
                Ok(gateway) => gateway,
                Err(_) => {
                    warn!(gateway = %record.gateway, transaction_id = %record.transaction_id, "No adapter for gateway, skipping");
                    continue;
                }
            };

            match gateway.query_status(&record).await {
                Ok(GatewayStatus::Pending) => {}
                Ok(settled) => {
                    match self
                        .payments
                        .apply_gateway_result(&record.transaction_id, settled, None, None)
                        .await
                    {
                        Ok(_) => summary.reconciled += 1,
                        Err(e) => {
                            error!(transaction_id = %record.transaction_id, error = %e, "Failed to apply reconciled status");
                            summary.errors += 1;
                        }
                    }
                }
                Err(ServiceError::GatewayUnavailable(reason)) => {
                    // Transient; the next scheduled run retries.
                    warn!(transaction_id = %record.transaction_id, reason = %reason, "Gateway unavailable during reconciliation");
                    summary.errors += 1;
                }
                Err(e) => {
                    error!(transaction_id = %record.transaction_id, error = %e, "Reconciliation query failed");
                    summary.errors += 1;
                }
            }
        }

        info!(
            checked = summary.checked,
            reconciled = summary.reconciled,
            errors = summary.errors,
            "Payment reconciliation completed"
        );
        Ok(summary)
    }

    /// Payments pending past the hard ceiling are abandoned attempts:
    /// force them to failed (releasing the order's stock) so inventory is
    /// never held hostage by a customer who walked away.
    #[instrument(skip(self))]
    pub async fn expire_stale_payments(&self) -> Result<SweepSummary, ServiceError> {
        let cutoff = Utc::now() - Duration::hours(self.config.payments.expiry_hours);

        let stale = Payment::find()
            .filter(payment::Column::Status.eq(payment::PaymentStatus::Pending))
            .filter(payment::Column::CreatedAt.lt(cutoff))
            .filter(payment::Column::Gateway.ne("cod"))
            .all(&*self.db)
            .await?;

        let mut summary = SweepSummary::default();

        for record in stale {
            let reason = format!(
                "expired: no gateway confirmation within {} hours",
                self.config.payments.expiry_hours
            );
            match self
                .payments
                .apply_gateway_result(&record.transaction_id, GatewayStatus::Failed { reason }, None, None)
                .await
            {
                Ok(_) => {
                    summary.swept += 1;
                    self.event_sender
                        .send_or_log(Event::PaymentExpired {
                            payment_id: record.id,
                            order_id: record.order_id,
                        })
                        .await;
                }
                Err(e) => {
                    error!(transaction_id = %record.transaction_id, error = %e, "Failed to expire payment");
                    summary.errors += 1;
                }
            }
        }

        if summary.swept > 0 {
            info!(expired = summary.swept, "Expired stale pending payments");
        }
        Ok(summary)
    }

    /// Orders that never got a payment attempt (or whose customer
    /// abandoned checkout before the gateway was ever reached) sit in
    /// pending/unpaid holding stock. Past the configured timeout they are
    /// cancelled and their inventory restored.
    #[instrument(skip(self))]
    pub async fn cancel_unpaid_orders(&self) -> Result<SweepSummary, ServiceError> {
        let timeout = self.config.checkout.unpaid_order_timeout_minutes;
        let cutoff = Utc::now() - Duration::minutes(timeout);

        let unpaid = Order::find()
            .filter(order::Column::Status.eq(order::OrderStatus::Pending))
            .filter(order::Column::PaymentStatus.eq(order::OrderPaymentStatus::Pending))
            .filter(order::Column::CreatedAt.lt(cutoff))
            .all(&*self.db)
            .await?;

        let mut summary = SweepSummary::default();

        for record in unpaid {
            let reason = format!("Automatically cancelled after {} minutes unpaid", timeout);
            match self.orders.cancel(record.id, &reason).await {
                Ok(_) => summary.swept += 1,
                Err(ServiceError::OrderNotCancellable { .. }) => {
                    // Raced a payment confirmation or a manual cancel.
                    summary.skipped += 1;
                }
                Err(e) => {
                    error!(order_id = %record.id, error = %e, "Failed to auto-cancel unpaid order");
                    summary.errors += 1;
                }
            }
        }

        if summary.swept > 0 {
            info!(
                cancelled = summary.swept,
                timeout_minutes = timeout,
                "Auto-cancelled unpaid orders"
            );
        }
        Ok(summary)
    }

    /// Spawns the three interval loops. The scheduler is plain tokio
    /// intervals; job state lives entirely in the database.
    pub fn spawn_all(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let reconcile_secs = self.config.payments.reconcile_interval_secs;
        let expiry_secs = self.config.payments.expiry_interval_secs;
        let autocancel_secs = self.config.payments.autocancel_interval_secs;

        let reconcile = {
            let workers = Arc::clone(&self);
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(std::time::Duration::from_secs(reconcile_secs));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if let Err(e) = workers.reconcile_pending_payments().await {
                        error!(error = %e, "Reconciliation run failed");
                    }
                }
            })
        };

        let expiry = {
            let workers = Arc::clone(&self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(std::time::Duration::from_secs(expiry_secs));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if let Err(e) = workers.expire_stale_payments().await {
                        error!(error = %e, "Expiry sweep failed");
                    }
                }
            })
        };

        let autocancel = {
            let workers = Arc::clone(&self);
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(std::time::Duration::from_secs(autocancel_secs));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if let Err(e) = workers.cancel_unpaid_orders().await {
                        error!(error = %e, "Unpaid-order sweep failed");
                    }
                }
            })
        };

        vec![reconcile, expiry, autocancel]
    }
}
