use super::{
    CallbackRejection, CallbackVerification, CheckoutRedirect, GatewayStatus, PaymentGateway,
};
use crate::{
    entities::{order, payment},
    errors::ServiceError,
};
use async_trait::async_trait;
use serde_json::{json, Value};

/// Cash on delivery. No external gateway: checkout returns no redirect,
/// there are no callbacks, and settlement happens at fulfilment time, so
/// the expiry sweep leaves COD payments alone.
pub struct CodGateway;

impl CodGateway {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CodGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for CodGateway {
    fn code(&self) -> &str {
        "cod"
    }

    async fn build_checkout(
        &self,
        _order: &order::Model,
        payment: &payment::Model,
        _return_url: &str,
    ) -> Result<CheckoutRedirect, ServiceError> {
        Ok(CheckoutRedirect {
            payment_url: None,
            transaction_id: payment.transaction_id.clone(),
            gateway: self.code().to_string(),
        })
    }

    fn verify_callback(&self, _payload: &Value) -> Result<CallbackVerification, CallbackRejection> {
        Err(CallbackRejection::MalformedPayload(
            "cash on delivery has no gateway callbacks".to_string(),
        ))
    }

    async fn query_status(&self, _payment: &payment::Model) -> Result<GatewayStatus, ServiceError> {
        // Settlement is tracked internally at fulfilment, never remotely.
        Ok(GatewayStatus::Pending)
    }

    fn ack_confirm(&self) -> Value {
        json!({"status": "ok"})
    }

    fn ack_payment_missing(&self) -> Value {
        json!({"status": "ok"})
    }

    fn ack_rejected(&self, _rejection: &CallbackRejection) -> Value {
        json!({"status": "rejected"})
    }
}
