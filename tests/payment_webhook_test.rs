//! Payment creation and webhook-driven state transitions, exercised
//! through the same transition function the HTTP handlers use.

mod common;

use common::{seed_payment_method, seed_product, setup, shipping_address};
use hmac::{Hmac, Mac};
use marketplace_api::{
    entities::{order, payment, product},
    errors::ServiceError,
    gateways::GatewayStatus,
    services::carts::{AddItemInput, CreateCartInput},
    services::orders::{CheckoutInput, OrderWithItems},
    services::payments::{CreatePaymentInput, PaymentTransition},
};
use rust_decimal_macros::dec;
use sea_orm::EntityTrait;
use serde_json::{json, Value};
use sha2::Sha512;
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

async fn create_vnpay_payment(
    ctx: &common::TestCtx,
    order_id: Uuid,
) -> marketplace_api::services::payments::PaymentCheckout {
    ctx.state
        .services
        .payments
        .create_payment(CreatePaymentInput {
            order_id,
            payment_method_code: "vnpay".to_string(),
            return_url: "https://shop.example.com/return".to_string(),
            idempotency_key: None,
        })
        .await
        .expect("create payment")
}

/// Builds a VNPay IPN payload signed with the test credentials, the same
/// way the sandbox gateway would.
fn signed_vnpay_callback(transaction_id: &str, response_code: &str, status: &str) -> Value {
    let mut entries = vec![
        ("vnp_TxnRef".to_string(), transaction_id.to_string()),
        ("vnp_ResponseCode".to_string(), response_code.to_string()),
        ("vnp_TransactionStatus".to_string(), status.to_string()),
        ("vnp_TransactionNo".to_string(), "9900112233".to_string()),
    ];
    entries.sort_by(|a, b| a.0.cmp(&b.0));
    let raw = entries
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let mut mac = Hmac::<Sha512>::new_from_slice(b"test-hash-secret").unwrap();
    mac.update(raw.as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    let mut payload = json!({});
    for (k, v) in entries {
        payload[k] = Value::String(v);
    }
    payload["vnp_SecureHash"] = Value::String(signature);
    payload
}

#[tokio::test]
async fn successful_webhook_completes_payment_and_marks_order_paid() {
    let ctx = setup().await;
    seed_payment_method(&ctx.db, "vnpay", "vnpay").await;
    let product = seed_product(&ctx.db, "Ceramic Mug", dec!(100000), 5).await;

    let placed = place_order(&ctx, &product, 2).await;
    let checkout = create_vnpay_payment(&ctx, placed.order.id).await;
    assert!(checkout.payment_url.is_some());

    let gateway = ctx.gateways.get("vnpay").unwrap();
    let payload = signed_vnpay_callback(&checkout.payment.transaction_id, "00", "00");
    let verification = gateway.verify_callback(&payload).expect("valid signature");

    let transition = ctx
        .state
        .services
        .payments
        .apply_gateway_result(
            &verification.transaction_id,
            verification.status,
            verification.gateway_transaction_id,
            Some(verification.raw),
        )
        .await
        .expect("apply");
    assert_eq!(transition, PaymentTransition::Completed);

    let payment_after = payment::Entity::find_by_id(checkout.payment.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment_after.status, payment::PaymentStatus::Completed);
    assert!(payment_after.paid_at.is_some());
    assert_eq!(
        payment_after.gateway_transaction_id.as_deref(),
        Some("9900112233")
    );

    let order_after = order::Entity::find_by_id(placed.order.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order_after.status, order::OrderStatus::Paid);
    assert_eq!(order_after.payment_status, order::OrderPaymentStatus::Paid);
    assert!(order_after.paid_at.is_some());
}

#[tokio::test]
async fn redelivered_success_webhook_is_a_noop() {
    let ctx = setup().await;
    seed_payment_method(&ctx.db, "vnpay", "vnpay").await;
    let product = seed_product(&ctx.db, "Ceramic Mug", dec!(100000), 5).await;

    let placed = place_order(&ctx, &product, 2).await;
    let checkout = create_vnpay_payment(&ctx, placed.order.id).await;

    let apply = |ctx: &common::TestCtx, txn_id: String| {
        let payments = ctx.state.services.payments.clone();
        async move {
            payments
                .apply_gateway_result(&txn_id, GatewayStatus::Completed, None, None)
                .await
        }
    };

    let first = apply(&ctx, checkout.payment.transaction_id.clone())
        .await
        .unwrap();
    assert_eq!(first, PaymentTransition::Completed);

    // Gateways redeliver; the second application must change nothing.
    let second = apply(&ctx, checkout.payment.transaction_id.clone())
        .await
        .unwrap();
    assert_eq!(second, PaymentTransition::AlreadySettled);

    let product_after = product::Entity::find_by_id(product.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    // Stock reflects exactly one checkout, no restore.
    assert_eq!(product_after.stock_quantity, 3);

    let order_after = order::Entity::find_by_id(placed.order.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order_after.status, order::OrderStatus::Paid);
}

#[tokio::test]
async fn failure_webhook_restores_stock_and_cancels_the_order() {
    let ctx = setup().await;
    seed_payment_method(&ctx.db, "vnpay", "vnpay").await;
    let product = seed_product(&ctx.db, "Ceramic Mug", dec!(100000), 5).await;

    let placed = place_order(&ctx, &product, 2).await;
    let checkout = create_vnpay_payment(&ctx, placed.order.id).await;

    let gateway = ctx.gateways.get("vnpay").unwrap();
    let payload = signed_vnpay_callback(&checkout.payment.transaction_id, "24", "02");
    let verification = gateway.verify_callback(&payload).expect("valid signature");

    let transition = ctx
        .state
        .services
        .payments
        .apply_gateway_result(
            &verification.transaction_id,
            verification.status,
            verification.gateway_transaction_id,
            Some(verification.raw),
        )
        .await
        .expect("apply");
    assert_eq!(transition, PaymentTransition::Failed);

    let payment_after = payment::Entity::find_by_id(checkout.payment.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(payment_after.status, payment::PaymentStatus::Failed);
    assert!(payment_after.failure_reason.is_some());

    let order_after = order::Entity::find_by_id(placed.order.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order_after.status, order::OrderStatus::Cancelled);

    let product_after = product::Entity::find_by_id(product.id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(product_after.stock_quantity, 5);
}

#[tokio::test]
async fn unknown_transaction_is_reported_as_payment_not_found() {
    let ctx = setup().await;

    let err = ctx
        .state
        .services
        .payments
        .apply_gateway_result("TXN000000000000000000", GatewayStatus::Completed, None, None)
        .await
        .expect_err("no such payment");
    assert!(matches!(err, ServiceError::PaymentNotFound(_)));
}

#[tokio::test]
async fn paid_orders_refuse_new_payment_attempts() {
    let ctx = setup().await;
    seed_payment_method(&ctx.db, "vnpay", "vnpay").await;
    let product = seed_product(&ctx.db, "Ceramic Mug", dec!(100000), 5).await;

    let placed = place_order(&ctx, &product, 1).await;
    let checkout = create_vnpay_payment(&ctx, placed.order.id).await;
    ctx.state
        .services
        .payments
        .apply_gateway_result(
            &checkout.payment.transaction_id,
            GatewayStatus::Completed,
            None,
            None,
        )
        .await
        .unwrap();

    let err = ctx
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
        .expect_err("already paid");
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn failed_attempts_may_be_retried_until_one_completes() {
    let ctx = setup().await;
    seed_payment_method(&ctx.db, "cod", "cod").await;
    let product = seed_product(&ctx.db, "Ceramic Mug", dec!(100000), 5).await;

    let placed = place_order(&ctx, &product, 1).await;

    // COD checkout: no redirect URL, payment stays pending.
    let checkout = ctx
        .state
        .services
        .payments
        .create_payment(CreatePaymentInput {
            order_id: placed.order.id,
            payment_method_code: "cod".to_string(),
            return_url: "https://shop.example.com/return".to_string(),
            idempotency_key: None,
        })
        .await
        .expect("cod payment");
    assert!(checkout.payment_url.is_none());
    assert_eq!(checkout.payment.status, payment::PaymentStatus::Pending);
    assert_eq!(checkout.payment.gateway, "cod");
}

#[tokio::test]
async fn duplicate_idempotency_keys_conflict() {
    let ctx = setup().await;
    seed_payment_method(&ctx.db, "vnpay", "vnpay").await;
    let product = seed_product(&ctx.db, "Ceramic Mug", dec!(100000), 5).await;

    let placed = place_order(&ctx, &product, 1).await;

    let input = |key: &str| CreatePaymentInput {
        order_id: placed.order.id,
        payment_method_code: "vnpay".to_string(),
        return_url: "https://shop.example.com/return".to_string(),
        idempotency_key: Some(key.to_string()),
    };

    ctx.state
        .services
        .payments
        .create_payment(input("click-1"))
        .await
        .expect("first");

    let err = ctx
        .state
        .services
        .payments
        .create_payment(input("click-1"))
        .await
        .expect_err("duplicate key");
    assert!(matches!(err, ServiceError::Conflict(_)));
}
