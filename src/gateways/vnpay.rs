use super::{
    constant_time_eq, hmac_sha512_hex, sorted_query_string, CallbackRejection,
    CallbackVerification, CheckoutRedirect, GatewayStatus, PaymentGateway,
};
use crate::{
    config::VnpayConfig,
    entities::{order, payment},
    errors::ServiceError,
};
use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{info, instrument};

/// VNPay adapter. Signatures are HMAC-SHA512 over the sorted `k=v&…`
/// string of all non-empty parameters; amounts are transmitted in minor
/// units (VND × 100).
pub struct VnpayGateway {
    config: VnpayConfig,
}

impl VnpayGateway {
    pub fn new(config: VnpayConfig) -> Self {
        Self { config }
    }

    fn sign(&self, params: &HashMap<String, String>) -> String {
        hmac_sha512_hex(&self.config.hash_secret, &sorted_query_string(params))
    }

    fn amount_minor(amount: Decimal) -> String {
        (amount * Decimal::from(100))
            .trunc()
            .to_i64()
            .unwrap_or(0)
            .to_string()
    }
}

#[async_trait]
impl PaymentGateway for VnpayGateway {
    fn code(&self) -> &str {
        "vnpay"
    }

    #[instrument(skip(self, order, payment))]
    async fn build_checkout(
        &self,
        order: &order::Model,
        payment: &payment::Model,
        return_url: &str,
    ) -> Result<CheckoutRedirect, ServiceError> {
        let mut params = HashMap::new();
        params.insert("vnp_Version".to_string(), "2.1.0".to_string());
        params.insert("vnp_Command".to_string(), "pay".to_string());
        params.insert("vnp_TmnCode".to_string(), self.config.tmn_code.clone());
        params.insert("vnp_Amount".to_string(), Self::amount_minor(payment.amount));
        params.insert("vnp_CurrCode".to_string(), "VND".to_string());
        params.insert("vnp_TxnRef".to_string(), payment.transaction_id.clone());
        params.insert(
            "vnp_OrderInfo".to_string(),
            format!("Payment for order {}", order.order_number),
        );
        params.insert("vnp_OrderType".to_string(), "other".to_string());
        params.insert("vnp_ReturnUrl".to_string(), return_url.to_string());
        params.insert(
            "vnp_CreateDate".to_string(),
            Utc::now().format("%Y%m%d%H%M%S").to_string(),
        );

        let signature = self.sign(&params);
        params.insert("vnp_SecureHash".to_string(), signature);

        let url = reqwest::Url::parse_with_params(&self.config.payment_url, params.iter())
            .map_err(|e| ServiceError::InternalError(format!("invalid VNPay payment URL: {}", e)))?;

        info!(transaction_id = %payment.transaction_id, "VNPay payment URL created");

        Ok(CheckoutRedirect {
            payment_url: Some(url.to_string()),
            transaction_id: payment.transaction_id.clone(),
            gateway: self.code().to_string(),
        })
    }

    fn verify_callback(&self, payload: &Value) -> Result<CallbackVerification, CallbackRejection> {
        let object = payload
            .as_object()
            .ok_or_else(|| CallbackRejection::MalformedPayload("expected object".to_string()))?;

        let mut params: HashMap<String, String> = HashMap::new();
        let mut received_signature = String::new();
        for (key, value) in object {
            let rendered = super::field_as_string(payload, key);
            match key.as_str() {
                "vnp_SecureHash" => received_signature = rendered,
                "vnp_SecureHashType" => {}
                _ => {
                    params.insert(key.clone(), rendered);
                }
            }
        }

        if received_signature.is_empty() {
            return Err(CallbackRejection::MalformedPayload(
                "missing vnp_SecureHash".to_string(),
            ));
        }

        let expected = self.sign(&params);
        if !constant_time_eq(&expected.to_lowercase(), &received_signature.to_lowercase()) {
            return Err(CallbackRejection::InvalidSignature);
        }

        let transaction_id = params
            .get("vnp_TxnRef")
            .cloned()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| CallbackRejection::MalformedPayload("missing vnp_TxnRef".to_string()))?;

        let response_code = params.get("vnp_ResponseCode").cloned().unwrap_or_default();
        let transaction_status = params
            .get("vnp_TransactionStatus")
            .cloned()
            .unwrap_or_default();

        let status = if response_code == "00" && transaction_status == "00" {
            GatewayStatus::Completed
        } else {
            GatewayStatus::Failed {
                reason: format!(
                    "VNPay response {} / status {}",
                    response_code, transaction_status
                ),
            }
        };

        Ok(CallbackVerification {
            transaction_id,
            gateway_transaction_id: params.get("vnp_TransactionNo").cloned(),
            status,
            raw: payload.clone(),
        })
    }

    #[instrument(skip(self, payment), fields(transaction_id = %payment.transaction_id))]
    async fn query_status(&self, payment: &payment::Model) -> Result<GatewayStatus, ServiceError> {
        let mut params = HashMap::new();
        params.insert("vnp_Version".to_string(), "2.1.0".to_string());
        params.insert("vnp_Command".to_string(), "querydr".to_string());
        params.insert("vnp_TmnCode".to_string(), self.config.tmn_code.clone());
        params.insert("vnp_TxnRef".to_string(), payment.transaction_id.clone());
        params.insert(
            "vnp_OrderInfo".to_string(),
            format!("Reconcile transaction {}", payment.transaction_id),
        );
        params.insert(
            "vnp_TransactionDate".to_string(),
            payment.created_at.format("%Y%m%d%H%M%S").to_string(),
        );
        params.insert(
            "vnp_CreateDate".to_string(),
            Utc::now().format("%Y%m%d%H%M%S").to_string(),
        );

        let signature = self.sign(&params);
        params.insert("vnp_SecureHash".to_string(), signature);

        let response = reqwest::Client::new()
            .post(&self.config.api_url)
            .form(&params)
            .send()
            .await
            .map_err(|e| ServiceError::GatewayUnavailable(format!("VNPay API error: {}", e)))?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::GatewayUnavailable(format!("VNPay API error: {}", e)))?;

        let response_code = super::field_as_string(&body, "vnp_ResponseCode");
        let transaction_status = super::field_as_string(&body, "vnp_TransactionStatus");

        if response_code == "00" && transaction_status == "00" {
            Ok(GatewayStatus::Completed)
        } else if response_code == "00"
            && (transaction_status == "01" || transaction_status == "02")
        {
            Ok(GatewayStatus::Failed {
                reason: format!("VNPay status {}", transaction_status),
            })
        } else {
            Ok(GatewayStatus::Pending)
        }
    }

    fn ack_confirm(&self) -> Value {
        json!({"RspCode": "00", "Message": "Confirm Success"})
    }

    fn ack_payment_missing(&self) -> Value {
        json!({"RspCode": "01", "Message": "Order not found"})
    }

    fn ack_rejected(&self, rejection: &CallbackRejection) -> Value {
        match rejection {
            CallbackRejection::InvalidSignature => {
                json!({"RspCode": "97", "Message": "Invalid Checksum"})
            }
            CallbackRejection::MalformedPayload(_) => {
                json!({"RspCode": "99", "Message": "Invalid request"})
            }
        }
    }
}
