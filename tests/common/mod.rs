#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use marketplace_api::{
    config::{AppConfig, VnpayConfig},
    db::{self, DbConfig},
    entities::{coupon, payment_method, product, product_variant},
    errors::ServiceError,
    events,
    gateways::{
        CallbackRejection, CallbackVerification, CheckoutRedirect, GatewayRegistry, GatewayStatus,
        PaymentGateway,
    },
    migrator::Migrator,
    services::orders::ShippingAddress,
    AppState,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use sea_orm_migration::MigratorTrait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Everything a test needs: app state plus direct handles for seeding.
pub struct TestCtx {
    pub state: AppState,
    pub db: Arc<DatabaseConnection>,
    pub cfg: Arc<AppConfig>,
    pub gateways: Arc<GatewayRegistry>,
}

pub fn test_vnpay_config() -> VnpayConfig {
    VnpayConfig {
        tmn_code: "TESTTMN".into(),
        hash_secret: "test-hash-secret".into(),
        payment_url: "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".into(),
        api_url: "https://sandbox.vnpayment.vn/merchant_webapi/api/transaction".into(),
    }
}

/// In-memory SQLite with a single pooled connection so every test sees
/// one database, migrated and wired to a drained event channel.
pub async fn setup() -> TestCtx {
    setup_with(|_| {}).await
}

/// Like [`setup`] but lets the test register extra gateways (stubs).
pub async fn setup_with(register: impl FnOnce(&mut GatewayRegistry)) -> TestCtx {
    let mut cfg = AppConfig::test_defaults("sqlite::memory:");
    cfg.vnpay = Some(test_vnpay_config());
    let cfg = Arc::new(cfg);

    let db_config = DbConfig {
        url: cfg.database_url.clone(),
        max_connections: 1,
        min_connections: 1,
        connect_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(600),
        acquire_timeout: Duration::from_secs(30),
    };
    let pool = db::establish_connection_with_config(&db_config)
        .await
        .expect("db connect");
    Migrator::up(&pool, None).await.expect("migrations");

    let db_arc = Arc::new(pool);

    let (event_sender, mut event_rx) = events::channel(256);
    tokio::spawn(async move { while event_rx.recv().await.is_some() {} });

    let mut registry = GatewayRegistry::from_config(&cfg);
    register(&mut registry);
    let gateways = Arc::new(registry);

    let state = AppState::build(db_arc.clone(), cfg.clone(), event_sender, gateways.clone());

    TestCtx {
        state,
        db: db_arc,
        cfg,
        gateways,
    }
}

/// Gateway stub for reconciliation tests: `query_status` replays a canned
/// answer instead of calling a real gateway.
pub struct StubGateway {
    pub gateway_code: String,
    pub canned_status: Result<GatewayStatus, String>,
}

impl StubGateway {
    pub fn completed(code: &str) -> Self {
        Self {
            gateway_code: code.to_string(),
            canned_status: Ok(GatewayStatus::Completed),
        }
    }

    pub fn failed(code: &str, reason: &str) -> Self {
        Self {
            gateway_code: code.to_string(),
            canned_status: Ok(GatewayStatus::Failed {
                reason: reason.to_string(),
            }),
        }
    }

    pub fn unavailable(code: &str) -> Self {
        Self {
            gateway_code: code.to_string(),
            canned_status: Err("stub gateway offline".to_string()),
        }
    }
}

#[async_trait]
impl PaymentGateway for StubGateway {
    fn code(&self) -> &str {
        &self.gateway_code
    }

    async fn build_checkout(
        &self,
        _order: &marketplace_api::entities::order::Model,
        payment: &marketplace_api::entities::payment::Model,
        _return_url: &str,
    ) -> Result<CheckoutRedirect, ServiceError> {
        Ok(CheckoutRedirect {
            payment_url: Some("https://stub.gateway/pay".to_string()),
            transaction_id: payment.transaction_id.clone(),
            gateway: self.gateway_code.clone(),
        })
    }

    fn verify_callback(&self, _payload: &Value) -> Result<CallbackVerification, CallbackRejection> {
        Err(CallbackRejection::MalformedPayload(
            "stub gateway has no callbacks".to_string(),
        ))
    }

    async fn query_status(
        &self,
        _payment: &marketplace_api::entities::payment::Model,
    ) -> Result<GatewayStatus, ServiceError> {
        self.canned_status
            .clone()
            .map_err(ServiceError::GatewayUnavailable)
    }

    fn ack_confirm(&self) -> Value {
        serde_json::json!({"status": "ok"})
    }

    fn ack_payment_missing(&self) -> Value {
        serde_json::json!({"status": "ok"})
    }

    fn ack_rejected(&self, _rejection: &CallbackRejection) -> Value {
        serde_json::json!({"status": "rejected"})
    }
}

pub async fn seed_product(
    db: &DatabaseConnection,
    name: &str,
    price: Decimal,
    stock: i32,
) -> product::Model {
    let now = Utc::now();
    product::ActiveModel {
        id: Set(Uuid::new_v4()),
        vendor_id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        sku: Set(format!("SKU-{}", name.to_uppercase().replace(' ', "-"))),
        price: Set(price),
        currency: Set("VND".to_string()),
        commission_rate: Set(Decimal::new(25, 2)), // 0.25, exact in binary
        stock_quantity: Set(stock),
        track_inventory: Set(true),
        allow_backorder: Set(false),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed product")
}

pub async fn seed_untracked_product(
    db: &DatabaseConnection,
    name: &str,
    price: Decimal,
) -> product::Model {
    let mut model = seed_product(db, name, price, 0).await;
    let mut active: product::ActiveModel = model.clone().into();
    active.track_inventory = Set(false);
    model = active.update(db).await.expect("untrack product");
    model
}

pub async fn seed_variant(
    db: &DatabaseConnection,
    product: &product::Model,
    name: &str,
    price: Decimal,
    stock: i32,
) -> product_variant::Model {
    let now = Utc::now();
    product_variant::ActiveModel {
        id: Set(Uuid::new_v4()),
        product_id: Set(product.id),
        name: Set(name.to_string()),
        sku: Set(format!("{}-{}", product.sku, name.to_uppercase())),
        price: Set(price),
        stock_quantity: Set(stock),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed variant")
}

pub async fn seed_coupon(
    db: &DatabaseConnection,
    code: &str,
    discount_type: coupon::DiscountType,
    value: Decimal,
    min_order_amount: Decimal,
) -> coupon::Model {
    let now = Utc::now();
    coupon::ActiveModel {
        id: Set(Uuid::new_v4()),
        code: Set(code.to_string()),
        name: Set(format!("Coupon {}", code)),
        discount_type: Set(discount_type),
        discount_value: Set(value),
        max_discount: Set(None),
        min_order_amount: Set(min_order_amount),
        usage_limit: Set(None),
        usage_limit_per_user: Set(Some(1)),
        times_used: Set(0),
        starts_at: Set(now - ChronoDuration::days(1)),
        expires_at: Set(Some(now + ChronoDuration::days(30))),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed coupon")
}

pub async fn seed_payment_method(
    db: &DatabaseConnection,
    code: &str,
    gateway: &str,
) -> payment_method::Model {
    let now = Utc::now();
    payment_method::ActiveModel {
        id: Set(Uuid::new_v4()),
        code: Set(code.to_string()),
        name: Set(code.to_uppercase()),
        gateway: Set(gateway.to_string()),
        is_active: Set(true),
        min_amount: Set(Decimal::ZERO),
        max_amount: Set(None),
        fee_type: Set(payment_method::FeeType::Fixed),
        fee_amount: Set(Decimal::ZERO),
        fee_percentage: Set(Decimal::ZERO),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(db)
    .await
    .expect("seed payment method")
}

pub fn shipping_address() -> ShippingAddress {
    ShippingAddress {
        name: "Nguyen Van A".to_string(),
        phone: "0900000001".to_string(),
        address_line: "12 Hang Bai".to_string(),
        city: "Hanoi".to_string(),
        country: "Vietnam".to_string(),
    }
}
