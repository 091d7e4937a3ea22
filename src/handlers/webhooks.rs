use crate::{errors::ServiceError, gateways::CallbackRejection, AppState};
use axum::{
    extract::{Query, State},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{error, info, warn};

/// Gateway notification endpoints. Every response is HTTP 200 carrying the
/// gateway's own acknowledgment dialect: a verified, processed payload gets
/// the confirm ack; an unverifiable one gets the negative ack so the
/// gateway keeps retrying; a verified payload for an unknown transaction is
/// acknowledged (stopping the retry storm) and logged as an operator alert.
pub fn routes() -> Router<AppState> {
    Router::new()
        // VNPay IPN arrives as query parameters
        .route("/webhooks/vnpay", get(vnpay_webhook))
        .route("/webhooks/momo", post(momo_webhook))
        .route("/webhooks/zalopay", post(zalopay_webhook))
}

#[utoipa::path(
    get,
    path = "/api/v1/webhooks/vnpay",
    responses((status = 200, description = "VNPay acknowledgment body (RspCode/Message)")),
    tag = "Webhooks"
)]
async fn vnpay_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Json<Value> {
    let payload = json!(params);
    process_webhook(&state, "vnpay", payload).await
}

#[utoipa::path(
    post,
    path = "/api/v1/webhooks/momo",
    responses((status = 200, description = "MoMo acknowledgment body")),
    tag = "Webhooks"
)]
async fn momo_webhook(State(state): State<AppState>, Json(payload): Json<Value>) -> Json<Value> {
    process_webhook(&state, "momo", payload).await
}

#[utoipa::path(
    post,
    path = "/api/v1/webhooks/zalopay",
    responses((status = 200, description = "ZaloPay acknowledgment body (return_code/return_message)")),
    tag = "Webhooks"
)]
async fn zalopay_webhook(State(state): State<AppState>, Json(payload): Json<Value>) -> Json<Value> {
    process_webhook(&state, "zalopay", payload).await
}

async fn process_webhook(state: &AppState, gateway_code: &str, payload: Value) -> Json<Value> {
    let gateway = match state.services.gateways.get(gateway_code) {
        Ok(gateway) => gateway,
        Err(_) => {
            warn!(gateway = %gateway_code, "Webhook for unconfigured gateway");
            return Json(json!({"status": "unknown_gateway"}));
        }
    };

    let verification = match gateway.verify_callback(&payload) {
        Ok(verification) => verification,
        Err(rejection) => {
            warn!(gateway = %gateway_code, rejection = ?rejection, "Webhook rejected before processing");
            return Json(gateway.ack_rejected(&rejection));
        }
    };

    let transaction_id = verification.transaction_id.clone();
    match state
        .services
        .payments
        .apply_gateway_result(
            &transaction_id,
            verification.status,
            verification.gateway_transaction_id,
            Some(verification.raw),
        )
        .await
    {
        Ok(transition) => {
            info!(
                gateway = %gateway_code,
                transaction_id = %transaction_id,
                transition = ?transition,
                "Webhook processed"
            );
            Json(gateway.ack_confirm())
        }
        Err(ServiceError::PaymentNotFound(_)) => {
            // Signature checked out but we never issued this transaction.
            // Acknowledge so the gateway stops retrying; a human looks at
            // the alert.
            error!(
                gateway = %gateway_code,
                transaction_id = %transaction_id,
                "ALERT: verified webhook for unknown payment"
            );
            Json(gateway.ack_payment_missing())
        }
        Err(e) => {
            error!(
                gateway = %gateway_code,
                transaction_id = %transaction_id,
                error = %e,
                "Webhook processing failed"
            );
            Json(gateway.ack_rejected(&CallbackRejection::MalformedPayload(
                "processing error".to_string(),
            )))
        }
    }
}
