use anyhow::{Context, Result};
use model::PricingRules;
use serde::Deserialize;
use std::time::Duration;

/// `AppConfig` holds all configuration parameters required by the application.
///
/// The configuration is loaded from environment variables (optionally via a `.env` file)
/// or uses default values if the variable is not set. Fields cover the database, the HTTP
/// server, auth, both payment gateways, pricing and the order lifecycle timers.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    // --- Database settings ---
    /// Database hostname or service name (e.g. "postgres" in Docker Compose, "localhost" for local runs).
    pub db_host: String,
    /// Database port (default: 5432).
    pub db_port: u16,
    /// Database user.
    pub db_user: String,
    /// Database password.
    pub db_password: String,
    /// Database name.
    pub db_name: String,
    /// Maximum number of pooled connections.
    pub db_pool_size: usize,

    // --- HTTP server ---
    /// The port on which the HTTP server will listen.
    pub http_port: u16,
    /// Graceful shutdown timeout (human-friendly format, e.g. "5s", "1m").
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,
    /// `text` or `json` log output.
    pub log_format: String,

    // --- Auth ---
    /// HS256 secret used to verify bearer tokens.
    pub jwt_secret: String,

    // --- MoMo ---
    pub momo_endpoint: String,
    pub momo_partner_code: String,
    pub momo_access_key: String,
    pub momo_secret_key: String,
    pub momo_redirect_url: String,
    pub momo_ipn_url: String,
    pub momo_fee_percent: u32,

    // --- VNPay ---
    pub vnpay_pay_url: String,
    pub vnpay_tmn_code: String,
    pub vnpay_hash_secret: String,
    pub vnpay_return_url: String,
    pub vnpay_fee_percent: u32,

    /// Timeout for a single call to a payment gateway.
    #[serde(deserialize_with = "deserialize_duration")]
    pub gateway_timeout: Duration,

    // --- Pricing ---
    /// Subtotal (VND) from which shipping is free.
    pub free_shipping_threshold: i64,
    /// Flat shipping fee (VND) below the threshold.
    pub shipping_fee: i64,

    // --- Order lifecycle ---
    /// How long a gateway payment may stay pending before the order is cancelled.
    #[serde(deserialize_with = "deserialize_duration")]
    pub pending_order_ttl: Duration,
    /// How often the expiry sweeper runs.
    #[serde(deserialize_with = "deserialize_duration")]
    pub sweep_interval: Duration,
    /// Number of terminal status snapshots kept in memory.
    pub status_cache_capacity: usize,

    // --- Status polling ---
    /// Delay between two status polls.
    #[serde(deserialize_with = "deserialize_duration")]
    pub poll_interval: Duration,
    /// Polls before the watcher gives up.
    pub poll_max_attempts: u32,
}

/// Custom deserializer for durations.
/// Accepts human-readable formats like "5s", "1m", etc.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let val = String::deserialize(deserializer)?;
    humantime::parse_duration(&val)
        .map_err(|e| D::Error::custom(format!("Invalid duration '{val}': {e}")))
}

impl AppConfig {
    /// Loads configuration from environment variables (and optionally from `.env` file).
    ///
    /// Fields not set via env will be filled with default values.
    ///
    /// # Errors
    /// Returns an error if environment variables are invalid or missing required values.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_source(config::Environment::default().try_parsing(true))
    }

    /// Builds the configuration from defaults overlaid with `source`.
    pub fn from_source<S>(source: S) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        // Defaults target local development; Docker Compose overrides the hosts.
        let settings = config::Config::builder()
            // Database
            .set_default("db_host", "localhost")?
            .set_default("db_port", 5432)?
            .set_default("db_user", "shop_user")?
            .set_default("db_password", "securepassword")?
            .set_default("db_name", "shop_db")?
            .set_default("db_pool_size", 16)?
            // HTTP
            .set_default("http_port", 8081)?
            .set_default("shutdown_timeout", "5s")?
            .set_default("log_format", "text")?
            // Auth
            .set_default("jwt_secret", "change-me")?
            // MoMo sandbox
            .set_default("momo_endpoint", "https://test-payment.momo.vn")?
            .set_default("momo_partner_code", "")?
            .set_default("momo_access_key", "")?
            .set_default("momo_secret_key", "")?
            .set_default("momo_redirect_url", "http://localhost:5173/checkout/result")?
            .set_default("momo_ipn_url", "http://localhost:8081/api/payment/momo/ipn")?
            .set_default("momo_fee_percent", 5)?
            // VNPay sandbox
            .set_default("vnpay_pay_url", "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html")?
            .set_default("vnpay_tmn_code", "")?
            .set_default("vnpay_hash_secret", "")?
            .set_default("vnpay_return_url", "http://localhost:8081/api/payment/vnpay/return")?
            .set_default("vnpay_fee_percent", 0)?
            .set_default("gateway_timeout", "15s")?
            // Pricing
            .set_default("free_shipping_threshold", 1_500_000)?
            .set_default("shipping_fee", 15_000)?
            // Lifecycle
            .set_default("pending_order_ttl", "30m")?
            .set_default("sweep_interval", "1m")?
            .set_default("status_cache_capacity", 10_000)?
            // Polling
            .set_default("poll_interval", "3s")?
            .set_default("poll_max_attempts", 100)?
            .add_source(source)
            .build()?;

        settings
            .try_deserialize()
            .context("Failed to load configuration")
    }

    /// Postgres DSN in key/value form.
    pub fn db_dsn(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} sslmode=disable",
            self.db_host, self.db_port, self.db_user, self.db_password, self.db_name
        )
    }

    pub fn pricing_rules(&self) -> PricingRules {
        PricingRules {
            free_shipping_threshold: self.free_shipping_threshold,
            shipping_fee: self.shipping_fee,
            momo_fee_percent: self.momo_fee_percent,
            vnpay_fee_percent: self.vnpay_fee_percent,
        }
    }
}
