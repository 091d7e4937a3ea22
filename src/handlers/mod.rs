pub mod carts;
pub mod orders;
pub mod payments;
pub mod webhooks;

use crate::{
    config::AppConfig,
    db::DbPool,
    events::EventSender,
    gateways::GatewayRegistry,
    services::{
        carts::CartService, coupons::CouponService, idempotency::IdempotencyGuard,
        orders::OrderService, payments::PaymentService,
    },
};
use std::sync::Arc;
use std::time::Duration;

/// Aggregated services shared by every HTTP handler.
#[derive(Clone)]
pub struct AppServices {
    pub carts: Arc<CartService>,
    pub coupons: Arc<CouponService>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub gateways: Arc<GatewayRegistry>,
    /// Guard for the checkout endpoint's client idempotency tokens.
    pub checkout_guard: IdempotencyGuard,
}

impl AppServices {
    pub fn new(
        db: Arc<DbPool>,
        event_sender: EventSender,
        config: Arc<AppConfig>,
        gateways: Arc<GatewayRegistry>,
    ) -> Self {
        let carts = Arc::new(CartService::new(
            db.clone(),
            event_sender.clone(),
            config.clone(),
        ));
        let coupons = Arc::new(CouponService::new(db.clone()));
        let orders = Arc::new(OrderService::new(
            db.clone(),
            event_sender.clone(),
            config.clone(),
        ));
        let payments = Arc::new(PaymentService::new(
            db,
            event_sender,
            gateways.clone(),
            orders.clone(),
            config.clone(),
        ));
        let checkout_guard =
            IdempotencyGuard::new(Duration::from_secs(config.payments.idempotency_ttl_secs));

        Self {
            carts,
            coupons,
            orders,
            payments,
            gateways,
            checkout_guard,
        }
    }
}
