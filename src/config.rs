use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::path::Path;
use thiserror::Error;
use tracing::info;
use validator::Validate;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";

/// Checkout pricing and timeout knobs.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CheckoutConfig {
    /// VAT-style tax rate applied to (subtotal - discount), e.g. 0.10
    #[serde(default = "default_tax_rate")]
    pub tax_rate: f64,

    /// Flat shipping fee charged per order (waived by free-shipping coupons)
    #[serde(default = "default_shipping_flat_fee")]
    pub shipping_flat_fee: f64,

    /// Minutes a pending, unpaid order may live before the auto-cancel
    /// sweep releases its stock
    #[serde(default = "default_unpaid_order_timeout_minutes")]
    pub unpaid_order_timeout_minutes: i64,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            tax_rate: default_tax_rate(),
            shipping_flat_fee: default_shipping_flat_fee(),
            unpaid_order_timeout_minutes: default_unpaid_order_timeout_minutes(),
        }
    }
}

/// Payment reconciliation and expiry windows.
///
/// Webhook delivery is not guaranteed, so payments pending longer than
/// `reconcile_grace_minutes` are actively re-queried at the gateway, and
/// payments pending past `expiry_hours` are force-failed and their stock
/// released.
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct PaymentTimingConfig {
    #[serde(default = "default_reconcile_grace_minutes")]
    pub reconcile_grace_minutes: i64,

    #[serde(default = "default_expiry_hours")]
    pub expiry_hours: i64,

    /// Scheduler tick for the reconciliation poller, in seconds
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Scheduler tick for the expiry sweep, in seconds
    #[serde(default = "default_expiry_interval_secs")]
    pub expiry_interval_secs: u64,

    /// Scheduler tick for the unpaid-order auto-cancel sweep, in seconds
    #[serde(default = "default_autocancel_interval_secs")]
    pub autocancel_interval_secs: u64,

    /// TTL for checkout/payment idempotency keys, in seconds
    #[serde(default = "default_idempotency_ttl_secs")]
    pub idempotency_ttl_secs: u64,
}

impl Default for PaymentTimingConfig {
    fn default() -> Self {
        Self {
            reconcile_grace_minutes: default_reconcile_grace_minutes(),
            expiry_hours: default_expiry_hours(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            expiry_interval_secs: default_expiry_interval_secs(),
            autocancel_interval_secs: default_autocancel_interval_secs(),
            idempotency_ttl_secs: default_idempotency_ttl_secs(),
        }
    }
}

/// VNPay merchant credentials (HMAC-SHA512 signatures).
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct VnpayConfig {
    pub tmn_code: String,
    pub hash_secret: String,
    pub payment_url: String,
    pub api_url: String,
}

/// MoMo partner credentials (HMAC-SHA256 signatures).
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct MomoConfig {
    pub partner_code: String,
    pub access_key: String,
    pub secret_key: String,
    pub endpoint: String,
}

/// ZaloPay app credentials (HMAC-SHA256 MAC over pipe-joined fields).
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ZaloPayConfig {
    pub app_id: String,
    pub key1: String,
    pub endpoint: String,
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    #[serde(default)]
    #[validate]
    pub checkout: CheckoutConfig,

    #[serde(default)]
    #[validate]
    pub payments: PaymentTimingConfig,

    #[serde(default)]
    pub vnpay: Option<VnpayConfig>,

    #[serde(default)]
    pub momo: Option<MomoConfig>,

    #[serde(default)]
    pub zalopay: Option<ZaloPayConfig>,
}

impl AppConfig {
    /// Minimal configuration for integration tests: in-memory database,
    /// zero tax/shipping, short windows.
    pub fn test_defaults(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            environment: "test".to_string(),
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_json: false,
            auto_migrate: true,
            db_max_connections: 1,
            db_min_connections: 1,
            db_connect_timeout_secs: 5,
            db_idle_timeout_secs: 600,
            db_acquire_timeout_secs: 30,
            checkout: CheckoutConfig {
                tax_rate: 0.0,
                shipping_flat_fee: 0.0,
                unpaid_order_timeout_minutes: 30,
            },
            payments: PaymentTimingConfig::default(),
            vnpay: None,
            momo: None,
            zalopay: None,
        }
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_min_connections() -> u32 {
    1
}

fn default_db_connect_timeout_secs() -> u64 {
    30
}

fn default_db_idle_timeout_secs() -> u64 {
    600
}

fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_tax_rate() -> f64 {
    0.10
}

fn default_shipping_flat_fee() -> f64 {
    0.0
}

fn default_unpaid_order_timeout_minutes() -> i64 {
    30
}

fn default_reconcile_grace_minutes() -> i64 {
    15
}

fn default_expiry_hours() -> i64 {
    24
}

fn default_reconcile_interval_secs() -> u64 {
    900
}

fn default_expiry_interval_secs() -> u64 {
    3600
}

fn default_autocancel_interval_secs() -> u64 {
    300
}

fn default_idempotency_ttl_secs() -> u64 {
    86400
}

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

/// Loads configuration from `config/default.toml`, `config/{env}.toml`,
/// then `APP__`-prefixed environment variables (highest precedence).
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let builder = Config::builder()
        .set_default("database_url", "sqlite://marketplace.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"));

    let cfg: AppConfig = builder.build()?.try_deserialize()?;
    cfg.validate()?;

    Ok(cfg)
}

/// Initializes the tracing subscriber. `RUST_LOG` overrides the configured
/// level when present.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let default_directive = format!("marketplace_api={},tower_http=info", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::try_new(filter_directive).unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init();
    }
}
