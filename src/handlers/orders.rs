use crate::{
    entities::order,
    errors::ServiceError,
    services::orders::{CheckoutInput, OrderWithItems},
    AppState,
};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use std::str::FromStr;
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/checkout", post(checkout))
        .route("/orders/:order_id", get(get_order))
        .route("/orders/:order_id/cancel", post(cancel_order))
        .route("/orders/:order_id/refund", post(refund_order))
        .route("/orders/:order_id/status", post(update_status))
}

/// Converts the cart into an order. The `Idempotency-Key` header makes a
/// double-submitted checkout click a 409 instead of a second order.
#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    responses(
        (status = 200, description = "Order created from cart"),
        (status = 409, description = "Duplicate checkout submission", body = crate::errors::ErrorResponse),
        (status = 422, description = "Insufficient stock or invalid coupon", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
async fn checkout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CheckoutInput>,
) -> Result<Json<OrderWithItems>, ServiceError> {
    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if let Some(key) = &idempotency_key {
        if !state.services.checkout_guard.claim(key) {
            return Err(ServiceError::Conflict(
                "A checkout with this idempotency key is already in progress".to_string(),
            ));
        }
    }

    let result = state.services.orders.create_from_cart(input).await;

    // A failed checkout may be retried with the same key once the
    // customer fixes their cart.
    if result.is_err() {
        if let Some(key) = &idempotency_key {
            state.services.checkout_guard.release(key);
        }
    }

    result.map(Json)
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{order_id}",
    responses(
        (status = 200, description = "Order with item snapshots"),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderWithItems>, ServiceError> {
    Ok(Json(state.services.orders.get_order(order_id).await?))
}

#[derive(Debug, Deserialize, utoipa::ToSchema)]
struct ReasonRequest {
    reason: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{order_id}/cancel",
    responses(
        (status = 200, description = "Order cancelled, inventory restored"),
        (status = 409, description = "Order is not cancellable from its current status", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
async fn cancel_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(input): Json<ReasonRequest>,
) -> Result<Json<order::Model>, ServiceError> {
    let reason = input.reason.unwrap_or_else(|| "Cancelled by customer".to_string());
    Ok(Json(state.services.orders.cancel(order_id, &reason).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders/{order_id}/refund",
    responses(
        (status = 200, description = "Order refunded, inventory restored"),
        (status = 409, description = "Order is not refundable from its current status", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
async fn refund_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(input): Json<ReasonRequest>,
) -> Result<Json<order::Model>, ServiceError> {
    let reason = input.reason.unwrap_or_else(|| "Refund requested".to_string());
    Ok(Json(state.services.orders.refund(order_id, &reason).await?))
}

#[derive(Debug, Deserialize)]
struct UpdateStatusRequest {
    status: String,
    note: Option<String>,
}

async fn update_status(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(input): Json<UpdateStatusRequest>,
) -> Result<Json<order::Model>, ServiceError> {
    let status = order::OrderStatus::from_str(&input.status)
        .map_err(|_| ServiceError::BadRequest(format!("Unknown order status: {}", input.status)))?;
    Ok(Json(
        state
            .services
            .orders
            .update_status(order_id, status, input.note)
            .await?,
    ))
}
