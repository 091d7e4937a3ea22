use crate::{
    entities::payment,
    errors::ServiceError,
    services::payments::{CreatePaymentInput, PaymentCheckout},
    AppState,
};
use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/payments", post(create_payment))
        .route("/payments/:payment_id", get(get_payment))
}

#[utoipa::path(
    post,
    path = "/api/v1/payments",
    responses(
        (status = 200, description = "Payment created; redirect the customer to payment_url"),
        (status = 402, description = "Gateway rejected the payment", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order already paid or duplicate request", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
async fn create_payment(
    State(state): State<AppState>,
    Json(input): Json<CreatePaymentInput>,
) -> Result<Json<PaymentCheckout>, ServiceError> {
    Ok(Json(state.services.payments.create_payment(input).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/payments/{payment_id}",
    responses(
        (status = 200, description = "Payment record"),
        (status = 404, description = "Payment not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Payments"
)]
async fn get_payment(
    State(state): State<AppState>,
    Path(payment_id): Path<Uuid>,
) -> Result<Json<payment::Model>, ServiceError> {
    Ok(Json(state.services.payments.get_payment(payment_id).await?))
}
