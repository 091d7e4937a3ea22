use super::{
    constant_time_eq, field_as_string, hmac_sha256_hex, CallbackRejection, CallbackVerification,
    CheckoutRedirect, GatewayStatus, PaymentGateway,
};
use crate::{
    config::ZaloPayConfig,
    entities::{order, payment},
    errors::ServiceError,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::instrument;

/// ZaloPay adapter. The MAC is HMAC-SHA256 with `key1` over
/// `app_id|app_trans_id|key1`.
pub struct ZaloPayGateway {
    config: ZaloPayConfig,
}

impl ZaloPayGateway {
    pub fn new(config: ZaloPayConfig) -> Self {
        Self { config }
    }

    fn mac_for(&self, app_trans_id: &str) -> String {
        let data = format!(
            "{}|{}|{}",
            self.config.app_id, app_trans_id, self.config.key1
        );
        hmac_sha256_hex(&self.config.key1, &data)
    }
}

#[async_trait]
impl PaymentGateway for ZaloPayGateway {
    fn code(&self) -> &str {
        "zalopay"
    }

    #[instrument(skip(self, order, payment))]
    async fn build_checkout(
        &self,
        order: &order::Model,
        payment: &payment::Model,
        _return_url: &str,
    ) -> Result<CheckoutRedirect, ServiceError> {
        // ZaloPay opens its checkout from the order token; the gateway URL
        // embeds the app id, transaction reference, and MAC.
        let mac = self.mac_for(&payment.transaction_id);
        let url = reqwest::Url::parse_with_params(
            &format!("{}/pay", self.config.endpoint),
            [
                ("app_id", self.config.app_id.as_str()),
                ("app_trans_id", payment.transaction_id.as_str()),
                ("description", &format!("Payment for order {}", order.order_number)),
                ("mac", mac.as_str()),
            ],
        )
        .map_err(|e| ServiceError::InternalError(format!("invalid ZaloPay endpoint: {}", e)))?;

        Ok(CheckoutRedirect {
            payment_url: Some(url.to_string()),
            transaction_id: payment.transaction_id.clone(),
            gateway: self.code().to_string(),
        })
    }

    fn verify_callback(&self, payload: &Value) -> Result<CallbackVerification, CallbackRejection> {
        if !payload.is_object() {
            return Err(CallbackRejection::MalformedPayload(
                "expected object".to_string(),
            ));
        }

        let app_trans_id = field_as_string(payload, "app_trans_id");
        if app_trans_id.is_empty() {
            return Err(CallbackRejection::MalformedPayload(
                "missing app_trans_id".to_string(),
            ));
        }

        let received_mac = field_as_string(payload, "mac");
        if received_mac.is_empty() {
            return Err(CallbackRejection::MalformedPayload("missing mac".to_string()));
        }

        let expected = self.mac_for(&app_trans_id);
        if !constant_time_eq(&expected, &received_mac) {
            return Err(CallbackRejection::InvalidSignature);
        }

        let status = match payload.get("status").and_then(Value::as_i64) {
            Some(1) => GatewayStatus::Completed,
            Some(code) => GatewayStatus::Failed {
                reason: format!("ZaloPay status {}", code),
            },
            None => {
                return Err(CallbackRejection::MalformedPayload(
                    "missing status".to_string(),
                ))
            }
        };

        let gateway_transaction_id = {
            let zp_trans_id = field_as_string(payload, "zp_trans_id");
            if zp_trans_id.is_empty() {
                None
            } else {
                Some(zp_trans_id)
            }
        };

        Ok(CallbackVerification {
            transaction_id: app_trans_id,
            gateway_transaction_id,
            status,
            raw: payload.clone(),
        })
    }

    #[instrument(skip(self, payment), fields(transaction_id = %payment.transaction_id))]
    async fn query_status(&self, payment: &payment::Model) -> Result<GatewayStatus, ServiceError> {
        let mac = self.mac_for(&payment.transaction_id);
        let params = [
            ("app_id", self.config.app_id.as_str()),
            ("app_trans_id", payment.transaction_id.as_str()),
            ("mac", mac.as_str()),
        ];

        let response = reqwest::Client::new()
            .post(format!("{}/query", self.config.endpoint))
            .form(&params)
            .send()
            .await
            .map_err(|e| ServiceError::GatewayUnavailable(format!("ZaloPay API error: {}", e)))?;

        let result: Value = response
            .json()
            .await
            .map_err(|e| ServiceError::GatewayUnavailable(format!("ZaloPay API error: {}", e)))?;

        match result.get("return_code").and_then(Value::as_i64) {
            Some(1) => Ok(GatewayStatus::Completed),
            Some(2) => Ok(GatewayStatus::Failed {
                reason: "ZaloPay reported failure".to_string(),
            }),
            Some(_) => Ok(GatewayStatus::Pending),
            None => Err(ServiceError::GatewayUnavailable(
                "ZaloPay query returned no return_code".to_string(),
            )),
        }
    }

    fn ack_confirm(&self) -> Value {
        json!({"return_code": 1, "return_message": "success"})
    }

    fn ack_payment_missing(&self) -> Value {
        // Acknowledged so ZaloPay stops retrying; the miss is logged as an
        // operator alert by the webhook handler.
        json!({"return_code": 1, "return_message": "success"})
    }

    fn ack_rejected(&self, rejection: &CallbackRejection) -> Value {
        match rejection {
            CallbackRejection::InvalidSignature => {
                json!({"return_code": -1, "return_message": "mac not equal"})
            }
            CallbackRejection::MalformedPayload(_) => {
                json!({"return_code": -1, "return_message": "invalid request"})
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> ZaloPayGateway {
        ZaloPayGateway::new(ZaloPayConfig {
            app_id: "553".into(),
            key1: "testkey1".into(),
            endpoint: "https://sb-openapi.zalopay.vn/v2".into(),
        })
    }

    fn signed_callback(gw: &ZaloPayGateway, status: i64) -> Value {
        json!({
            "app_trans_id": "TXN789",
            "zp_trans_id": "230309000000001",
            "status": status,
            "mac": gw.mac_for("TXN789"),
        })
    }

    #[test]
    fn status_one_completes() {
        let gw = gateway();
        let verified = gw
            .verify_callback(&signed_callback(&gw, 1))
            .expect("verification");
        assert_eq!(verified.transaction_id, "TXN789");
        assert_eq!(verified.status, GatewayStatus::Completed);
    }

    #[test]
    fn other_status_fails() {
        let gw = gateway();
        let verified = gw
            .verify_callback(&signed_callback(&gw, 2))
            .expect("verification");
        assert!(matches!(verified.status, GatewayStatus::Failed { .. }));
    }

    #[test]
    fn wrong_mac_is_rejected() {
        let gw = gateway();
        let mut payload = signed_callback(&gw, 1);
        payload["mac"] = Value::String("0".repeat(64));
        assert_eq!(
            gw.verify_callback(&payload),
            Err(CallbackRejection::InvalidSignature)
        );
    }

    #[test]
    fn rejection_acks_use_negative_return_code() {
        let gw = gateway();
        assert_eq!(
            gw.ack_rejected(&CallbackRejection::InvalidSignature)["return_code"],
            -1
        );
        assert_eq!(gw.ack_confirm()["return_code"], 1);
    }
}
