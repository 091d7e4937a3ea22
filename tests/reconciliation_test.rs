//! Reconciliation poller and expiry/auto-cancel sweeps: the correctness
//! backstops for lost webhooks and abandoned checkouts.

mod common;

use common::{seed_payment_method, seed_product, setup_with, shipping_address, StubGateway};
use chrono::{Duration, Utc};
use marketplace_api::{
    entities::{order, payment, product, Payment},
    services::carts::{AddItemInput, CreateCartInput},
    services::orders::{CheckoutInput, OrderWithItems},
    services::payments::CreatePaymentInput,
    workers::Workers,
};
use rust_decimal_macros::dec;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use std::sync::Arc;
use uuid::Uuid;

async fn place_order(ctx: &common::TestCtx, product: &product::Model, qty: i32) -> OrderWithItems {
    let customer_id = Uuid::new_v4();
    let cart = ctx
        .state
        .services
        .carts
        .create_cart(CreateCartInput {
            customer_id: Some(customer_id),
            session_key: None,
            currency: Some("VND".to_string()),
        })
        .await
        .unwrap();
    ctx.state
        .services
        .carts
        .add_item(
            cart.id,
            AddItemInput {
                product_id: product.id,
                variant_id: None,
                quantity: qty,
            },
        )
        .await
        .unwrap();
    ctx.state
        .services
        .orders
        .create_from_cart(CheckoutInput {
            cart_id: cart.id,
            customer_id,
            email: "customer@example.com".to_string(),
            shipping: shipping_address(),
            customer_note: None,
        })
        .await
        .unwrap()
}

fn workers_for(ctx: &common::TestCtx) -> Workers {
    Workers::new(
        ctx.db.clone(),
        ctx.state.services.payments.clone(),
        ctx.state.services.orders.clone(),
        ctx.gateways.clone(),
        ctx.state.event_sender.clone(),
        ctx.cfg.clone(),
    )
}

/// Rewinds a payment's creation time, standing in for a passing clock.
async fn backdate_payment(ctx: &common::TestCtx, payment_id: Uuid, age: Duration) {
    Payment::update_many()
        .col_expr(payment::Column::CreatedAt, Expr::value(Utc::now() - age))
        .filter(payment::Column::Id.eq(payment_id))
        .exec(&*ctx.db)
        .await
        .unwrap();
}

async fn backdate_order(ctx: &common::TestCtx, order_id: Uuid, age: Duration) {
    order::Entity::update_many()
        .col_expr(order::Column::CreatedAt, Expr::value(Utc::now() - age))
        .filter(order::Column::Id.eq(order_id))
        .exec(&*ctx.db)
        .await
        .unwrap();
}

#[tokio::test]
async fn reconciliation_recovers_a_lost_webhook() {
    // Gateway says completed; the webhook never arrived.
    let ctx = setup_with(|registry| {
        registry.register(Arc::new(StubGateway::completed("stub")));
    })
    .await;
    seed_payment_method(&ctx.db, "stub", "stub").await;
    let product = seed_product(&ctx.db, "Ceramic Mug", dec!(100000), 5).await;

    let placed = place_order(&ctx, &product, 2).await;
    let checkout = ctx
        .state
        .services
        .payments
        .create_payment(CreatePaymentInput {
            order_id: placed.order.id,
            payment_method_code: "stub".to_string(),
            return_url: "https://shop.example.com/return".to_string(),
            idempotency_key: None,
        })
        .await
        .unwrap();

    // Past the 15-minute grace window, inside the 24-hour ceiling.
    backdate_payment(&ctx, checkout.payment.id, Duration::minutes(20)).await;

    let summary = workers_for(&ctx)
        .reconcile_pending_payments()
        .await
        .expect("reconcile");
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.reconciled, 1);
    assert_eq!(summary.errors, 0);

    let payment_after = Payment::find_by_id(checkout.payment.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment_after.status, payment::PaymentStatus::Completed);

    let order_after = order::Entity::find_by_id(placed.order.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order_after.status, order::OrderStatus::Paid);
}

#[tokio::test]
async fn reconciliation_waits_out_the_grace_window() {
    let ctx = setup_with(|registry| {
        registry.register(Arc::new(StubGateway::completed("stub")));
    })
    .await;
    seed_payment_method(&ctx.db, "stub", "stub").await;
    let product = seed_product(&ctx.db, "Ceramic Mug", dec!(100000), 5).await;

    let placed = place_order(&ctx, &product, 1).await;
    let checkout = ctx
        .state
        .services
        .payments
        .create_payment(CreatePaymentInput {
            order_id: placed.order.id,
            payment_method_code: "stub".to_string(),
            return_url: "https://shop.example.com/return".to_string(),
            idempotency_key: None,
        })
        .await
        .unwrap();

    // Fresh payment: the customer may still be on the gateway page.
    let summary = workers_for(&ctx)
        .reconcile_pending_payments()
        .await
        .expect("reconcile");
    assert_eq!(summary.checked, 0);

    let payment_after = Payment::find_by_id(checkout.payment.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment_after.status, payment::PaymentStatus::Pending);
}

#[tokio::test]
async fn reconciliation_failure_releases_stock() {
    let ctx = setup_with(|registry| {
        registry.register(Arc::new(StubGateway::failed("stub", "customer declined")));
    })
    .await;
    seed_payment_method(&ctx.db, "stub", "stub").await;
    let product = seed_product(&ctx.db, "Ceramic Mug", dec!(100000), 5).await;

    let placed = place_order(&ctx, &product, 2).await;
    let checkout = ctx
        .state
        .services
        .payments
        .create_payment(CreatePaymentInput {
            order_id: placed.order.id,
            payment_method_code: "stub".to_string(),
            return_url: "https://shop.example.com/return".to_string(),
            idempotency_key: None,
        })
        .await
        .unwrap();
    backdate_payment(&ctx, checkout.payment.id, Duration::minutes(20)).await;

    let summary = workers_for(&ctx)
        .reconcile_pending_payments()
        .await
        .expect("reconcile");
    assert_eq!(summary.reconciled, 1);

    let product_after = product::Entity::find_by_id(product.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(product_after.stock_quantity, 5);

    let order_after = order::Entity::find_by_id(placed.order.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order_after.status, order::OrderStatus::Cancelled);
}

#[tokio::test]
async fn unreachable_gateway_leaves_the_payment_for_the_next_run() {
    let ctx = setup_with(|registry| {
        registry.register(Arc::new(StubGateway::unavailable("stub")));
    })
    .await;
    seed_payment_method(&ctx.db, "stub", "stub").await;
    let product = seed_product(&ctx.db, "Ceramic Mug", dec!(100000), 5).await;

    let placed = place_order(&ctx, &product, 1).await;
    let checkout = ctx
        .state
        .services
        .payments
        .create_payment(CreatePaymentInput {
            order_id: placed.order.id,
            payment_method_code: "stub".to_string(),
            return_url: "https://shop.example.com/return".to_string(),
            idempotency_key: None,
        })
        .await
        .unwrap();
    backdate_payment(&ctx, checkout.payment.id, Duration::minutes(20)).await;

    let summary = workers_for(&ctx)
        .reconcile_pending_payments()
        .await
        .expect("reconcile run itself succeeds");
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.reconciled, 0);

    let payment_after = Payment::find_by_id(checkout.payment.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment_after.status, payment::PaymentStatus::Pending);
}

#[tokio::test]
async fn expiry_sweep_fails_stale_payments_and_releases_stock() {
    let ctx = setup_with(|registry| {
        registry.register(Arc::new(StubGateway::completed("stub")));
    })
    .await;
    seed_payment_method(&ctx.db, "stub", "stub").await;
    let product = seed_product(&ctx.db, "Ceramic Mug", dec!(100000), 5).await;

    let placed = place_order(&ctx, &product, 2).await;
    let checkout = ctx
        .state
        .services
        .payments
        .create_payment(CreatePaymentInput {
            order_id: placed.order.id,
            payment_method_code: "stub".to_string(),
            return_url: "https://shop.example.com/return".to_string(),
            idempotency_key: None,
        })
        .await
        .unwrap();

    // Past the 24-hour ceiling with no gateway answer at all.
    backdate_payment(&ctx, checkout.payment.id, Duration::hours(25)).await;

    let summary = workers_for(&ctx)
        .expire_stale_payments()
        .await
        .expect("expiry sweep");
    assert_eq!(summary.swept, 1);

    let payment_after = Payment::find_by_id(checkout.payment.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment_after.status, payment::PaymentStatus::Failed);
    assert!(payment_after
        .failure_reason
        .as_deref()
        .unwrap_or_default()
        .starts_with("expired"));

    let product_after = product::Entity::find_by_id(product.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(product_after.stock_quantity, 5);
}

#[tokio::test]
async fn expiry_sweep_is_idempotent() {
    let ctx = setup_with(|registry| {
        registry.register(Arc::new(StubGateway::completed("stub")));
    })
    .await;
    seed_payment_method(&ctx.db, "stub", "stub").await;
    let product = seed_product(&ctx.db, "Ceramic Mug", dec!(100000), 5).await;

    let placed = place_order(&ctx, &product, 2).await;
    let checkout = ctx
        .state
        .services
        .payments
        .create_payment(CreatePaymentInput {
            order_id: placed.order.id,
            payment_method_code: "stub".to_string(),
            return_url: "https://shop.example.com/return".to_string(),
            idempotency_key: None,
        })
        .await
        .unwrap();
    backdate_payment(&ctx, checkout.payment.id, Duration::hours(25)).await;

    let workers = workers_for(&ctx);
    let first = workers.expire_stale_payments().await.unwrap();
    assert_eq!(first.swept, 1);

    // Second run finds nothing pending; stock is restored exactly once.
    let second = workers.expire_stale_payments().await.unwrap();
    assert_eq!(second.swept, 0);

    let product_after = product::Entity::find_by_id(product.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(product_after.stock_quantity, 5);
}

#[tokio::test]
async fn unpaid_orders_are_auto_cancelled_past_the_timeout() {
    let ctx = setup_with(|_| {}).await;
    let product = seed_product(&ctx.db, "Ceramic Mug", dec!(100000), 5).await;

    let stale = place_order(&ctx, &product, 2).await;
    let fresh = place_order(&ctx, &product, 1).await;
    backdate_order(&ctx, stale.order.id, Duration::minutes(45)).await;

    let summary = workers_for(&ctx)
        .cancel_unpaid_orders()
        .await
        .expect("auto-cancel sweep");
    assert_eq!(summary.swept, 1);

    let stale_after = order::Entity::find_by_id(stale.order.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stale_after.status, order::OrderStatus::Cancelled);

    let fresh_after = order::Entity::find_by_id(fresh.order.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh_after.status, order::OrderStatus::Pending);

    // Only the stale order's two units came back.
    let product_after = product::Entity::find_by_id(product.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(product_after.stock_quantity, 4);
}
