//! Order cancel/refund lifecycle: exact inventory restoration, the
//! double-cancel guard, and the status-history trail.

mod common;

use common::{seed_payment_method, seed_product, setup, shipping_address};
use marketplace_api::{
    entities::{order, order_status_history, payment, product, refund},
    errors::ServiceError,
    gateways::GatewayStatus,
    services::carts::{AddItemInput, CreateCartInput},
    services::orders::{CheckoutInput, OrderWithItems},
    services::payments::CreatePaymentInput,
};
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
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

async fn stock_of(ctx: &common::TestCtx, product_id: Uuid) -> i32 {
    product::Entity::find_by_id(product_id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap()
        .stock_quantity
}

#[tokio::test]
async fn cancel_restores_exact_pre_order_quantities() {
    let ctx = setup().await;
    let product = seed_product(&ctx.db, "Walnut Desk", dec!(500000), 7).await;

    let placed = place_order(&ctx, &product, 3).await;
    assert_eq!(stock_of(&ctx, product.id).await, 4);

    let cancelled = ctx
        .state
        .services
        .orders
        .cancel(placed.order.id, "Changed my mind")
        .await
        .expect("cancel");

    assert_eq!(cancelled.status, order::OrderStatus::Cancelled);
    assert!(cancelled.cancelled_at.is_some());
    assert_eq!(cancelled.cancellation_reason.as_deref(), Some("Changed my mind"));
    assert_eq!(stock_of(&ctx, product.id).await, 7);

    // One history row: pending -> cancelled.
    let history = order_status_history::Entity::find()
        .filter(order_status_history::Column::OrderId.eq(placed.order.id))
        .all(&*ctx.db)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].old_status, "pending");
    assert_eq!(history[0].new_status, "cancelled");
}

#[tokio::test]
async fn cancelling_twice_is_refused_and_never_double_restores() {
    let ctx = setup().await;
    let product = seed_product(&ctx.db, "Walnut Desk", dec!(500000), 7).await;

    let placed = place_order(&ctx, &product, 3).await;
    ctx.state
        .services
        .orders
        .cancel(placed.order.id, "first")
        .await
        .expect("first cancel");

    let err = ctx
        .state
        .services
        .orders
        .cancel(placed.order.id, "second")
        .await
        .expect_err("already cancelled");
    assert!(matches!(err, ServiceError::OrderNotCancellable { .. }));

    // Restored exactly once.
    assert_eq!(stock_of(&ctx, product.id).await, 7);
}

#[tokio::test]
async fn refund_requires_a_completed_payment() {
    let ctx = setup().await;
    let product = seed_product(&ctx.db, "Walnut Desk", dec!(500000), 7).await;
    let placed = place_order(&ctx, &product, 1).await;

    // Pending order: not refundable at all.
    let err = ctx
        .state
        .services
        .orders
        .refund(placed.order.id, "no")
        .await
        .expect_err("pending order");
    assert!(matches!(err, ServiceError::OrderNotRefundable { .. }));
}

#[tokio::test]
async fn refund_restores_stock_and_settles_the_payment() {
    let ctx = setup().await;
    let product = seed_product(&ctx.db, "Walnut Desk", dec!(500000), 7).await;
    seed_payment_method(&ctx.db, "vnpay", "vnpay").await;

    let placed = place_order(&ctx, &product, 2).await;
    let checkout = ctx
        .state
        .services
        .payments
        .create_payment(CreatePaymentInput {
            order_id: placed.order.id,
            payment_method_code: "vnpay".to_string(),
            return_url: "https://shop.example.com/return".to_string(),
            idempotency_key: None,
        })
        .await
        .expect("create payment");

    ctx.state
        .services
        .payments
        .apply_gateway_result(
            &checkout.payment.transaction_id,
            GatewayStatus::Completed,
            Some("GW123".to_string()),
            None,
        )
        .await
        .expect("complete payment");

    assert_eq!(stock_of(&ctx, product.id).await, 5);

    let refunded = ctx
        .state
        .services
        .orders
        .refund(placed.order.id, "Defective product")
        .await
        .expect("refund");

    assert_eq!(refunded.status, order::OrderStatus::Refunded);
    assert_eq!(
        refunded.payment_status,
        order::OrderPaymentStatus::Refunded
    );
    assert_eq!(stock_of(&ctx, product.id).await, 7);

    // Payment flipped to refunded.
    let payment_after = payment::Entity::find_by_id(checkout.payment.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment_after.status, payment::PaymentStatus::Refunded);

    // Refund audit row written.
    let refunds = refund::Entity::find()
        .filter(refund::Column::OrderId.eq(placed.order.id))
        .all(&*ctx.db)
        .await
        .unwrap();
    assert_eq!(refunds.len(), 1);
    assert_eq!(refunds[0].amount, placed.order.total);
    assert!(refunds[0].refund_number.starts_with("REF"));
}

#[tokio::test]
async fn shipped_orders_cannot_be_cancelled() {
    let ctx = setup().await;
    let product = seed_product(&ctx.db, "Walnut Desk", dec!(500000), 7).await;
    let placed = place_order(&ctx, &product, 1).await;

    ctx.state
        .services
        .orders
        .update_status(placed.order.id, order::OrderStatus::Paid, None)
        .await
        .unwrap();
    ctx.state
        .services
        .orders
        .update_status(placed.order.id, order::OrderStatus::Shipped, None)
        .await
        .unwrap();

    let err = ctx
        .state
        .services
        .orders
        .cancel(placed.order.id, "too late")
        .await
        .expect_err("already shipped");
    assert!(matches!(err, ServiceError::OrderNotCancellable { .. }));
    assert_eq!(stock_of(&ctx, product.id).await, 6);
}

#[tokio::test]
async fn manual_transitions_stamp_timestamps_and_history() {
    let ctx = setup().await;
    let product = seed_product(&ctx.db, "Walnut Desk", dec!(500000), 7).await;
    let placed = place_order(&ctx, &product, 1).await;

    let paid = ctx
        .state
        .services
        .orders
        .update_status(placed.order.id, order::OrderStatus::Paid, Some("manual".into()))
        .await
        .unwrap();
    assert!(paid.paid_at.is_some());
    assert_eq!(paid.payment_status, order::OrderPaymentStatus::Paid);

    let delivered = ctx
        .state
        .services
        .orders
        .update_status(placed.order.id, order::OrderStatus::Delivered, None)
        .await
        .unwrap();
    assert!(delivered.delivered_at.is_some());

    let history_count = order_status_history::Entity::find()
        .filter(order_status_history::Column::OrderId.eq(placed.order.id))
        .count(&*ctx.db)
        .await
        .unwrap();
    assert_eq!(history_count, 2);
}
