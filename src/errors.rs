use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use serde_json::json;
use utoipa::ToSchema;
use uuid::Uuid;

/// Error body returned by every HTTP endpoint.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[schema(example = json!({
    "error": "Unprocessable Entity",
    "message": "Insufficient stock for Ceramic Mug: requested 3, available 1",
    "details": null,
    "timestamp": "2025-03-09T10:30:00.000Z"
}))]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Bad Request")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Additional error details (validation errors, failing field)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

/// Why a coupon was refused. Kept as a dedicated enum so callers can map
/// each rejection to a specific customer-facing message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum CouponRejection {
    NotFound,
    Inactive,
    NotStarted,
    Expired,
    UsageLimitReached,
    UserLimitReached,
    MinimumNotMet,
}

impl CouponRejection {
    pub fn message(&self) -> &'static str {
        match self {
            Self::NotFound => "Coupon code does not exist",
            Self::Inactive => "Coupon has been deactivated",
            Self::NotStarted => "Coupon is not valid yet",
            Self::Expired => "Coupon has expired",
            Self::UsageLimitReached => "Coupon has no redemptions left",
            Self::UserLimitReached => {
                "You have already used this coupon the maximum number of times"
            }
            Self::MinimumNotMet => "Order does not meet the coupon's minimum amount",
        }
    }
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A cart line asked for more units than the inventory row holds.
    /// Carries the snapshot the customer needs to fix their cart.
    #[error("Insufficient stock for {name}: requested {requested}, available {available}")]
    InsufficientStock {
        name: String,
        requested: i32,
        available: i32,
    },

    /// The attached coupon failed re-validation inside the checkout
    /// transaction.
    #[error("Coupon rejected: {reason}")]
    CouponInvalid { reason: CouponRejection },

    #[error("Order {order_id} cannot be cancelled from status {status}")]
    OrderNotCancellable { order_id: Uuid, status: String },

    #[error("Order {order_id} cannot be refunded from status {status}")]
    OrderNotRefundable { order_id: Uuid, status: String },

    /// A gateway notification referenced a transaction id we never issued.
    /// Logged as an operator alert; the gateway still gets an acknowledgment.
    #[error("Payment not found for transaction {0}")]
    PaymentNotFound(String),

    #[error("Payment failed: {0}")]
    PaymentFailed(String),

    /// Transient gateway transport/config failure. The reconciliation job
    /// retries on its next scheduled run; never customer-facing.
    #[error("Gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    pub fn coupon(reason: CouponRejection) -> Self {
        ServiceError::CouponInvalid { reason }
    }

    pub fn insufficient_stock(name: impl Into<String>, requested: i32, available: i32) -> Self {
        ServiceError::InsufficientStock {
            name: name.into(),
            requested,
            available,
        }
    }

    /// Translates the database's last-resort non-negative CHECK constraint
    /// into the same user-facing error as the application-level stock check.
    /// Two writers racing past the pre-check must not surface a raw 500.
    pub fn from_stock_write_error(err: DbErr, name: &str, requested: i32) -> Self {
        if is_check_violation(&err) {
            ServiceError::insufficient_stock(name, requested, 0)
        } else {
            ServiceError::DatabaseError(err)
        }
    }

    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::InternalError(_) | Self::EventError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidOperation(_) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Conflict(_)
            | Self::OrderNotCancellable { .. }
            | Self::OrderNotRefundable { .. } => StatusCode::CONFLICT,
            Self::InsufficientStock { .. } | Self::CouponInvalid { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::PaymentNotFound(_) => StatusCode::NOT_FOUND,
            Self::PaymentFailed(_) => StatusCode::PAYMENT_REQUIRED,
            Self::GatewayUnavailable(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Message suitable for HTTP responses. Internal errors are collapsed
    /// to a generic message so implementation details never leak.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::InternalError(_) | Self::EventError(_) => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

fn is_check_violation(err: &DbErr) -> bool {
    let message = err.to_string().to_ascii_lowercase();
    message.contains("check constraint") || message.contains("violates check")
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}

/// Line-level stock shortfall used when a checkout reports every failing
/// line instead of just the first.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StockShortfall {
    pub name: String,
    pub requested: i32,
    pub available: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<Decimal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_stock_maps_to_422() {
        let err = ServiceError::insufficient_stock("Ceramic Mug", 3, 1);
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(err.to_string().contains("requested 3"));
        assert!(err.to_string().contains("available 1"));
    }

    #[test]
    fn coupon_rejection_maps_to_422_with_reason() {
        let err = ServiceError::coupon(CouponRejection::UsageLimitReached);
        assert_eq!(err.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(err.to_string().contains("usage_limit_reached"));
    }

    #[test]
    fn check_violation_is_translated_to_insufficient_stock() {
        let db_err = DbErr::Custom(
            "new row violates check constraint \"chk_products_stock_non_negative\"".into(),
        );
        let err = ServiceError::from_stock_write_error(db_err, "Mug", 2);
        assert!(matches!(
            err,
            ServiceError::InsufficientStock { available: 0, .. }
        ));
    }

    #[test]
    fn other_db_errors_pass_through() {
        let db_err = DbErr::Custom("connection reset".into());
        let err = ServiceError::from_stock_write_error(db_err, "Mug", 2);
        assert!(matches!(err, ServiceError::DatabaseError(_)));
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = ServiceError::InternalError("secret detail".into());
        assert_eq!(err.response_message(), "Internal server error");
    }
}
