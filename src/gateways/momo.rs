use super::{
    constant_time_eq, field_as_string, hmac_sha256_hex, CallbackRejection, CallbackVerification,
    CheckoutRedirect, GatewayStatus, PaymentGateway,
};
use crate::{
    config::MomoConfig,
    entities::{order, payment},
    errors::ServiceError,
};
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{json, Value};
use tracing::{info, instrument};

/// MoMo adapter. Signatures are HMAC-SHA256 over a canonical
/// `key=value&…` string whose field order is fixed by the MoMo protocol,
/// not sorted.
pub struct MomoGateway {
    config: MomoConfig,
}

impl MomoGateway {
    pub fn new(config: MomoConfig) -> Self {
        Self { config }
    }

    fn sign(&self, raw: &str) -> String {
        hmac_sha256_hex(&self.config.secret_key, raw)
    }

    /// Canonical string the IPN signature is computed over.
    fn callback_raw_signature(&self, payload: &Value) -> String {
        format!(
            "accessKey={}&amount={}&extraData={}&message={}&orderId={}&orderInfo={}&orderType={}&partnerCode={}&payType={}&requestId={}&responseTime={}&resultCode={}&transId={}",
            self.config.access_key,
            field_as_string(payload, "amount"),
            field_as_string(payload, "extraData"),
            field_as_string(payload, "message"),
            field_as_string(payload, "orderId"),
            field_as_string(payload, "orderInfo"),
            field_as_string(payload, "orderType"),
            field_as_string(payload, "partnerCode"),
            field_as_string(payload, "payType"),
            field_as_string(payload, "requestId"),
            field_as_string(payload, "responseTime"),
            field_as_string(payload, "resultCode"),
            field_as_string(payload, "transId"),
        )
    }
}

#[async_trait]
impl PaymentGateway for MomoGateway {
    fn code(&self) -> &str {
        "momo"
    }

    #[instrument(skip(self, order, payment))]
    async fn build_checkout(
        &self,
        order: &order::Model,
        payment: &payment::Model,
        return_url: &str,
    ) -> Result<CheckoutRedirect, ServiceError> {
        let amount = payment.amount.trunc().to_i64().unwrap_or(0);
        let order_info = format!("Payment for order {}", order.order_number);

        let raw_signature = format!(
            "accessKey={}&amount={}&extraData=&ipnUrl={}&orderId={}&orderInfo={}&partnerCode={}&redirectUrl={}&requestId={}&requestType=captureWallet",
            self.config.access_key,
            amount,
            return_url,
            payment.transaction_id,
            order_info,
            self.config.partner_code,
            return_url,
            payment.transaction_id,
        );
        let signature = self.sign(&raw_signature);

        let body = json!({
            "partnerCode": self.config.partner_code,
            "accessKey": self.config.access_key,
            "requestId": payment.transaction_id,
            "amount": amount.to_string(),
            "orderId": payment.transaction_id,
            "orderInfo": order_info,
            "redirectUrl": return_url,
            "ipnUrl": return_url,
            "extraData": "",
            "requestType": "captureWallet",
            "signature": signature,
            "lang": "vi",
        });

        let response = reqwest::Client::new()
            .post(format!("{}/v2/gateway/api/create", self.config.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::GatewayUnavailable(format!("MoMo API error: {}", e)))?;

        let result: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::GatewayUnavailable(format!("MoMo API error: {}", e)))?;

        if result.get("resultCode").and_then(Value::as_i64) == Some(0) {
            info!(transaction_id = %payment.transaction_id, "MoMo payment created");
            Ok(CheckoutRedirect {
                payment_url: result
                    .get("payUrl")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                transaction_id: payment.transaction_id.clone(),
                gateway: self.code().to_string(),
            })
        } else {
            let message = field_as_string(&result, "message");
            Err(ServiceError::PaymentFailed(format!(
                "MoMo rejected the payment: {}",
                message
            )))
        }
    }

    fn verify_callback(&self, payload: &Value) -> Result<CallbackVerification, CallbackRejection> {
        if !payload.is_object() {
            return Err(CallbackRejection::MalformedPayload(
                "expected object".to_string(),
            ));
        }

        let received_signature = field_as_string(payload, "signature");
        if received_signature.is_empty() {
            return Err(CallbackRejection::MalformedPayload(
                "missing signature".to_string(),
            ));
        }

        let expected = self.sign(&self.callback_raw_signature(payload));
        if !constant_time_eq(&expected, &received_signature) {
            return Err(CallbackRejection::InvalidSignature);
        }

        let transaction_id = field_as_string(payload, "orderId");
        if transaction_id.is_empty() {
            return Err(CallbackRejection::MalformedPayload(
                "missing orderId".to_string(),
            ));
        }

        let result_code = payload.get("resultCode").and_then(Value::as_i64);
        let status = match result_code {
            Some(0) => GatewayStatus::Completed,
            Some(code) => GatewayStatus::Failed {
                reason: format!("MoMo result code {}", code),
            },
            None => {
                return Err(CallbackRejection::MalformedPayload(
                    "missing resultCode".to_string(),
                ))
            }
        };

        let gateway_transaction_id = {
            let trans_id = field_as_string(payload, "transId");
            if trans_id.is_empty() {
                None
            } else {
                Some(trans_id)
            }
        };

        Ok(CallbackVerification {
            transaction_id,
            gateway_transaction_id,
            status,
            raw: payload.clone(),
        })
    }

    #[instrument(skip(self, payment), fields(transaction_id = %payment.transaction_id))]
    async fn query_status(&self, payment: &payment::Model) -> Result<GatewayStatus, ServiceError> {
        let request_id = format!("recon-{}", payment.transaction_id);
        let raw_signature = format!(
            "accessKey={}&orderId={}&partnerCode={}&requestId={}",
            self.config.access_key, payment.transaction_id, self.config.partner_code, request_id,
        );
        let signature = self.sign(&raw_signature);

        let body = json!({
            "partnerCode": self.config.partner_code,
            "requestId": request_id,
            "orderId": payment.transaction_id,
            "signature": signature,
            "lang": "vi",
        });

        let response = reqwest::Client::new()
            .post(format!("{}/v2/gateway/api/query", self.config.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|e| ServiceError::GatewayUnavailable(format!("MoMo API error: {}", e)))?;

        let result: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::GatewayUnavailable(format!("MoMo API error: {}", e)))?;

        match result.get("resultCode").and_then(Value::as_i64) {
            Some(0) => Ok(GatewayStatus::Completed),
            // 1000-series codes mean the customer has not finished paying
            Some(1000..=1003) => Ok(GatewayStatus::Pending),
            Some(code) => Ok(GatewayStatus::Failed {
                reason: format!("MoMo result code {}", code),
            }),
            None => Err(ServiceError::GatewayUnavailable(
                "MoMo query returned no resultCode".to_string(),
            )),
        }
    }

    fn ack_confirm(&self) -> Value {
        json!({"status": "received"})
    }

    fn ack_payment_missing(&self) -> Value {
        json!({"status": "received"})
    }

    fn ack_rejected(&self, rejection: &CallbackRejection) -> Value {
        match rejection {
            CallbackRejection::InvalidSignature => json!({"status": "invalid_signature"}),
            CallbackRejection::MalformedPayload(_) => json!({"status": "invalid_request"}),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> MomoGateway {
        MomoGateway::new(MomoConfig {
            partner_code: "PARTNER".into(),
            access_key: "ACCESS".into(),
            secret_key: "SECRET".into(),
            endpoint: "https://test-payment.momo.vn".into(),
        })
    }

    fn signed_callback(gw: &MomoGateway, result_code: i64) -> Value {
        let mut payload = json!({
            "partnerCode": "PARTNER",
            "orderId": "TXN456",
            "requestId": "TXN456",
            "amount": 180000,
            "orderInfo": "Payment for order ORD1",
            "orderType": "momo_wallet",
            "transId": 2147483647i64,
            "resultCode": result_code,
            "message": "Successful.",
            "payType": "qr",
            "responseTime": 1700000000000i64,
            "extraData": "",
        });
        let signature = gw.sign(&gw.callback_raw_signature(&payload));
        payload["signature"] = Value::String(signature);
        payload
    }

    #[test]
    fn success_code_zero_completes() {
        let gw = gateway();
        let payload = signed_callback(&gw, 0);
        let verified = gw.verify_callback(&payload).expect("verification");
        assert_eq!(verified.transaction_id, "TXN456");
        assert_eq!(verified.status, GatewayStatus::Completed);
        assert_eq!(
            verified.gateway_transaction_id.as_deref(),
            Some("2147483647")
        );
    }

    #[test]
    fn nonzero_code_fails() {
        let gw = gateway();
        let payload = signed_callback(&gw, 1006);
        let verified = gw.verify_callback(&payload).expect("verification");
        assert!(matches!(verified.status, GatewayStatus::Failed { .. }));
    }

    #[test]
    fn amount_tampering_breaks_the_signature() {
        let gw = gateway();
        let mut payload = signed_callback(&gw, 0);
        payload["amount"] = json!(1);
        assert_eq!(
            gw.verify_callback(&payload),
            Err(CallbackRejection::InvalidSignature)
        );
    }

    #[test]
    fn missing_signature_is_malformed() {
        let gw = gateway();
        let payload = json!({"orderId": "TXN456", "resultCode": 0});
        assert!(matches!(
            gw.verify_callback(&payload),
            Err(CallbackRejection::MalformedPayload(_))
        ));
    }
}
