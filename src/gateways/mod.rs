use crate::{
    config::AppConfig,
    entities::{order, payment},
    errors::ServiceError,
};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::{Sha256, Sha512};
use std::collections::HashMap;
use std::sync::Arc;

pub mod cod;
pub mod momo;
pub mod vnpay;
pub mod zalopay;

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Payment state as reported by a gateway, mapped from its result codes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    Completed,
    Failed { reason: String },
    Pending,
}

/// A webhook payload whose signature checked out.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackVerification {
    /// Our correlation key (`payments.transaction_id`)
    pub transaction_id: String,
    /// The gateway's own transaction reference, when provided
    pub gateway_transaction_id: Option<String>,
    pub status: GatewayStatus,
    /// Raw payload kept for the payment's audit blob
    pub raw: Value,
}

/// Why a webhook payload was rejected before reaching the payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackRejection {
    InvalidSignature,
    MalformedPayload(String),
}

/// Checkout session handed back to the client after payment creation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckoutRedirect {
    /// Where to send the customer; `None` for offline methods (COD)
    pub payment_url: Option<String>,
    pub transaction_id: String,
    pub gateway: String,
}

/// One payment gateway integration.
///
/// Each adapter owns its signature scheme, its result-code table, and
/// (because every gateway expects its own acknowledgment dialect) the ack
/// bodies the webhook endpoint must answer with.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn code(&self) -> &str;

    /// Creates the gateway-side payment and returns the redirect target.
    async fn build_checkout(
        &self,
        order: &order::Model,
        payment: &payment::Model,
        return_url: &str,
    ) -> Result<CheckoutRedirect, ServiceError>;

    /// Verifies a webhook payload's signature and maps its result codes.
    /// MUST be called before trusting any field of the payload.
    fn verify_callback(&self, payload: &Value) -> Result<CallbackVerification, CallbackRejection>;

    /// Actively queries the gateway's transaction-status API. Transport
    /// failures surface as `GatewayUnavailable` so the reconciliation job
    /// can retry on its next run.
    async fn query_status(&self, payment: &payment::Model) -> Result<GatewayStatus, ServiceError>;

    /// Positive acknowledgment: notification accepted and processed.
    fn ack_confirm(&self) -> Value;

    /// Acknowledgment for a verified payload whose transaction we do not
    /// know. Acknowledged (to stop retry storms) but logged as an alert.
    fn ack_payment_missing(&self) -> Value;

    /// Negative acknowledgment for unverifiable or malformed payloads;
    /// the gateway's retry mechanism stays engaged.
    fn ack_rejected(&self, rejection: &CallbackRejection) -> Value;
}

/// Resolves gateway adapters by code. Built from configuration at startup;
/// tests may register stub gateways through the same interface.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    adapters: HashMap<String, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Builds the registry from configured credentials. COD needs no
    /// credentials and is always available.
    pub fn from_config(cfg: &AppConfig) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(cod::CodGateway::new()));
        if let Some(vnpay_cfg) = &cfg.vnpay {
            registry.register(Arc::new(vnpay::VnpayGateway::new(vnpay_cfg.clone())));
        }
        if let Some(momo_cfg) = &cfg.momo {
            registry.register(Arc::new(momo::MomoGateway::new(momo_cfg.clone())));
        }
        if let Some(zalopay_cfg) = &cfg.zalopay {
            registry.register(Arc::new(zalopay::ZaloPayGateway::new(zalopay_cfg.clone())));
        }
        registry
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        self.adapters.insert(gateway.code().to_string(), gateway);
    }

    pub fn get(&self, code: &str) -> Result<Arc<dyn PaymentGateway>, ServiceError> {
        self.adapters
            .get(code)
            .cloned()
            .ok_or_else(|| ServiceError::BadRequest(format!("Unsupported payment gateway: {}", code)))
    }
}

/// HMAC-SHA256 over `data`, lowercase hex.
pub(crate) fn hmac_sha256_hex(secret: &str, data: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// HMAC-SHA512 over `data`, lowercase hex.
pub(crate) fn hmac_sha512_hex(secret: &str, data: &str) -> String {
    let mut mac =
        HmacSha512::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

/// `k=v&…` over keys sorted ascending, empty values skipped. This is the
/// canonical string VNPay-style signatures are computed over.
pub(crate) fn sorted_query_string(params: &HashMap<String, String>) -> String {
    let mut entries: Vec<(&String, &String)> =
        params.iter().filter(|(_, v)| !v.is_empty()).collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Renders a JSON field the way the gateway rendered it when signing:
/// strings bare, numbers as digits, missing fields empty.
pub(crate) fn field_as_string(payload: &Value, key: &str) -> String {
    match payload.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}
