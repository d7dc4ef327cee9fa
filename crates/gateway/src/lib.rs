//! Payment gateway adapters.
//!
//! A [`PaymentGateway`] turns a local payment intent into something the
//! customer can pay (redirect URL, QR payload, app deeplink), answers status
//! queries, and authenticates the asynchronous callbacks the gateway sends
//! back. MoMo and VNPay are supported; cash on delivery needs no gateway.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use model::PaymentMethod;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use thiserror::Error;
use uuid::Uuid;

pub mod momo;
pub mod vnpay;

pub use momo::{MomoConfig, MomoGateway};
pub use vnpay::{VnpayConfig, VnpayGateway};

/// Errors raised while talking to a payment gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Credentials for the gateway are missing.
    #[error("{0} gateway is not configured")]
    NotConfigured(&'static str),
    /// The HTTP call failed or timed out.
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The gateway answered but refused the request.
    #[error("gateway rejected the request ({code}): {message}")]
    Rejected { code: String, message: String },
    /// A callback or response carried a signature that does not match.
    #[error("invalid gateway signature")]
    InvalidSignature,
    /// A callback or response is missing fields or has unparsable values.
    #[error("malformed gateway payload: {0}")]
    Malformed(String),
}

/// What the shop asks the gateway to collect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub order_id: Uuid,
    /// Amount in VND, surcharge included.
    pub amount: i64,
    pub description: String,
    /// Customer IP, required by VNPay.
    pub client_ip: Option<String>,
}

/// Something the customer can use to pay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayReference {
    /// Gateway-side request or transaction reference.
    pub reference: String,
    pub pay_url: Option<String>,
    pub qr_code_url: Option<String>,
    pub deeplink: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Paid,
    Failed,
}

/// Definite result of a payment as reported by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayOutcome {
    pub order_id: Uuid,
    pub status: OutcomeStatus,
    /// Amount the gateway says was charged, in VND.
    pub amount: Option<i64>,
    pub transaction_ref: Option<String>,
    pub message: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Registers the intent with the gateway. Not retried on failure.
    async fn create_payment(&self, intent: &PaymentIntent) -> Result<GatewayReference, GatewayError>;

    /// Asks the gateway for a definite outcome. `None` means the payment is
    /// still open or the gateway has no query API.
    async fn query_status(&self, order_id: Uuid) -> Result<Option<GatewayOutcome>, GatewayError>;

    /// Authenticates a callback (webhook or browser return) and extracts its outcome.
    fn verify_callback(&self, params: &BTreeMap<String, String>) -> Result<GatewayOutcome, GatewayError>;
}

/// Gateways indexed by the payment method they serve.
#[derive(Clone, Default)]
pub struct GatewayRegistry {
    gateways: HashMap<PaymentMethod, Arc<dyn PaymentGateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        self.gateways.insert(gateway.method(), gateway);
    }

    pub fn with(mut self, gateway: Arc<dyn PaymentGateway>) -> Self {
        self.register(gateway);
        self
    }

    pub fn get(&self, method: PaymentMethod) -> Option<Arc<dyn PaymentGateway>> {
        self.gateways.get(&method).cloned()
    }
}

pub(crate) fn hmac_sha256_hex(secret: &str, data: &str) -> Result<String, GatewayError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|_| GatewayError::Malformed("invalid HMAC key".into()))?;
    mac.update(data.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub(crate) fn hmac_sha512_hex(secret: &str, data: &str) -> Result<String, GatewayError> {
    let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes())
        .map_err(|_| GatewayError::Malformed("invalid HMAC key".into()))?;
    mac.update(data.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time comparison of a hex signature, ignoring case of `given`.
pub(crate) fn signatures_match(expected: &str, given: &str) -> bool {
    let given = given.to_ascii_lowercase();
    expected.as_bytes().ct_eq(given.as_bytes()).into()
}

pub(crate) fn required<'a>(
    params: &'a BTreeMap<String, String>,
    key: &str,
) -> Result<&'a str, GatewayError> {
    params
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| GatewayError::Malformed(format!("missing field '{key}'")))
}

pub(crate) fn parse_order_id(raw: &str) -> Result<Uuid, GatewayError> {
    Uuid::parse_str(raw).map_err(|_| GatewayError::Malformed(format!("unknown order id '{raw}'")))
}
