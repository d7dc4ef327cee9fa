//! VNPay redirect gateway (v2.1.0).
//!
//! The payment URL carries every `vnp_*` parameter, form-encoded in key order,
//! plus an HMAC-SHA512 of that exact query string. Return and IPN callbacks are
//! signed the same way.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use model::PaymentMethod;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    GatewayError, GatewayOutcome, GatewayReference, OutcomeStatus, PaymentGateway, PaymentIntent,
    hmac_sha512_hex, parse_order_id, required, signatures_match,
};

const VERSION: &str = "2.1.0";
const SUCCESS: &str = "00";
/// Minutes a VNPay payment link stays usable.
const LINK_TTL_MINUTES: i64 = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VnpayConfig {
    /// Hosted payment page, e.g. `https://sandbox.vnpayment.vn/paymentv2/vpcpay.html`.
    pub pay_url: String,
    pub tmn_code: String,
    pub hash_secret: String,
    pub return_url: String,
}

#[derive(Debug, Clone)]
pub struct VnpayGateway {
    config: VnpayConfig,
}

/// VNPay timestamps are local Vietnam time (UTC+7), `yyyyMMddHHmmss`.
fn vn_timestamp(at: DateTime<Utc>) -> String {
    (at.naive_utc() + Duration::hours(7))
        .format("%Y%m%d%H%M%S")
        .to_string()
}

impl VnpayGateway {
    pub fn new(config: VnpayConfig) -> Self {
        Self { config }
    }

    pub fn is_configured(&self) -> bool {
        !self.config.tmn_code.is_empty() && !self.config.hash_secret.is_empty()
    }

    /// Query string (without the hash) for `params`, keys sorted.
    fn sign_data(params: &BTreeMap<String, String>) -> Result<String, GatewayError> {
        serde_urlencoded::to_string(params)
            .map_err(|e| GatewayError::Malformed(format!("cannot encode VNPay params: {e}")))
    }

    fn sign(&self, params: &BTreeMap<String, String>) -> Result<(String, String), GatewayError> {
        let data = Self::sign_data(params)?;
        let hash = hmac_sha512_hex(&self.config.hash_secret, &data)?;
        Ok((data, hash))
    }

    /// Builds the signed redirect URL for `intent` as of `now`.
    pub fn payment_url(&self, intent: &PaymentIntent, now: DateTime<Utc>) -> Result<String, GatewayError> {
        let mut params = BTreeMap::new();
        let mut put = |k: &str, v: String| {
            params.insert(k.to_string(), v);
        };
        put("vnp_Version", VERSION.into());
        put("vnp_Command", "pay".into());
        put("vnp_TmnCode", self.config.tmn_code.clone());
        put("vnp_Locale", "vn".into());
        put("vnp_CurrCode", "VND".into());
        put("vnp_TxnRef", intent.order_id.to_string());
        put("vnp_OrderInfo", intent.description.clone());
        put("vnp_OrderType", "other".into());
        put("vnp_Amount", (intent.amount * 100).to_string());
        put("vnp_ReturnUrl", self.config.return_url.clone());
        put(
            "vnp_IpAddr",
            intent.client_ip.clone().unwrap_or_else(|| "127.0.0.1".into()),
        );
        put("vnp_CreateDate", vn_timestamp(now));
        put(
            "vnp_ExpireDate",
            vn_timestamp(now + Duration::minutes(LINK_TTL_MINUTES)),
        );

        let (data, hash) = self.sign(&params)?;
        Ok(format!("{}?{}&vnp_SecureHash={}", self.config.pay_url, data, hash))
    }
}

#[async_trait]
impl PaymentGateway for VnpayGateway {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Vnpay
    }

    async fn create_payment(&self, intent: &PaymentIntent) -> Result<GatewayReference, GatewayError> {
        if !self.is_configured() {
            return Err(GatewayError::NotConfigured("VNPay"));
        }
        let url = self.payment_url(intent, Utc::now())?;
        info!(order_id = %intent.order_id, amount = intent.amount, "VNPay payment URL issued");
        Ok(GatewayReference {
            reference: intent.order_id.to_string(),
            pay_url: Some(url),
            qr_code_url: None,
            deeplink: None,
        })
    }

    async fn query_status(&self, _order_id: Uuid) -> Result<Option<GatewayOutcome>, GatewayError> {
        // Outcome arrives through the IPN and the browser return.
        Ok(None)
    }

    fn verify_callback(&self, params: &BTreeMap<String, String>) -> Result<GatewayOutcome, GatewayError> {
        let given = required(params, "vnp_SecureHash")?;
        let signed: BTreeMap<String, String> = params
            .iter()
            .filter(|(k, _)| {
                k.starts_with("vnp_") && *k != "vnp_SecureHash" && *k != "vnp_SecureHashType"
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let (_, expected) = self.sign(&signed)?;
        if !signatures_match(&expected, given) {
            warn!(txn_ref = ?params.get("vnp_TxnRef"), "VNPay callback signature mismatch");
            return Err(GatewayError::InvalidSignature);
        }

        let order_id = parse_order_id(required(params, "vnp_TxnRef")?)?;
        let amount = required(params, "vnp_Amount")?
            .parse::<i64>()
            .map_err(|_| GatewayError::Malformed("vnp_Amount is not a number".into()))?
            / 100;
        let response_code = required(params, "vnp_ResponseCode")?;
        let transaction_ok = params
            .get("vnp_TransactionStatus")
            .is_none_or(|s| s == SUCCESS);

        let status = if response_code == SUCCESS && transaction_ok {
            OutcomeStatus::Paid
        } else {
            OutcomeStatus::Failed
        };
        Ok(GatewayOutcome {
            order_id,
            status,
            amount: Some(amount),
            transaction_ref: params.get("vnp_TransactionNo").cloned(),
            message: format!("vnp_ResponseCode={response_code}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const ORDER_ID: &str = "6f1d3a52-9c4e-4d59-9d51-2b4a9a1f3c11";

    fn gateway() -> VnpayGateway {
        VnpayGateway::new(VnpayConfig {
            pay_url: "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".into(),
            tmn_code: "DEMOV210".into(),
            hash_secret: "RAOEXHYVSDDIIENYWSLDIIZTANXUXZFJ".into(),
            return_url: "http://localhost:8081/api/payment/vnpay/return".into(),
        })
    }

    fn intent() -> PaymentIntent {
        PaymentIntent {
            order_id: Uuid::parse_str(ORDER_ID).unwrap(),
            amount: 1_015_000,
            description: "Thanh toan don hang".into(),
            client_ip: Some("10.0.0.1".into()),
        }
    }

    fn callback(response_code: &str) -> BTreeMap<String, String> {
        let mut params: BTreeMap<String, String> = [
            ("vnp_Amount", "101500000"),
            ("vnp_BankCode", "NCB"),
            ("vnp_OrderInfo", "Thanh toan don hang"),
            ("vnp_PayDate", "20250301153000"),
            ("vnp_ResponseCode", response_code),
            ("vnp_TmnCode", "DEMOV210"),
            ("vnp_TransactionNo", "14422574"),
            ("vnp_TransactionStatus", response_code),
            ("vnp_TxnRef", ORDER_ID),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let (_, hash) = gateway().sign(&params).unwrap();
        params.insert("vnp_SecureHashType".into(), "HmacSHA512".into());
        params.insert("vnp_SecureHash".into(), hash);
        params
    }

    #[test]
    fn test_timestamp_is_vietnam_local_time() {
        let at = Utc.with_ymd_and_hms(2025, 3, 1, 20, 30, 0).unwrap();
        assert_eq!(vn_timestamp(at), "20250302033000");
    }

    #[test]
    fn test_payment_url_is_signed() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 8, 30, 0).unwrap();
        let url = gateway().payment_url(&intent(), now).unwrap();

        assert!(url.starts_with("https://sandbox.vnpayment.vn/paymentv2/vpcpay.html?vnp_Amount=101500000&"));
        assert!(url.contains("vnp_CreateDate=20250301153000"));
        assert!(url.contains("vnp_ExpireDate=20250301154500"));
        assert!(url.contains("vnp_OrderInfo=Thanh+toan+don+hang"));
        assert!(url.ends_with("&vnp_SecureHash=51043c2d17c3a686e2a9b88aa285042a0ec500fc6e123996d9ac56572aeb2ec837731bb95c057ac49420315b6b3a3e1ed708d6eee0b5f3e485595949ad5eab70"));
    }

    #[test]
    fn test_successful_callback() {
        let outcome = gateway().verify_callback(&callback("00")).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Paid);
        assert_eq!(outcome.amount, Some(1_015_000));
        assert_eq!(outcome.transaction_ref.as_deref(), Some("14422574"));
    }

    #[test]
    fn test_cancelled_by_customer_is_failure() {
        let outcome = gateway().verify_callback(&callback("24")).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
    }

    #[test]
    fn test_tampered_callback_is_rejected() {
        let mut params = callback("00");
        params.insert("vnp_Amount".into(), "100".into());
        assert!(matches!(
            gateway().verify_callback(&params),
            Err(GatewayError::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn test_query_status_defers_to_callbacks() {
        let order_id = Uuid::parse_str(ORDER_ID).unwrap();
        assert_eq!(gateway().query_status(order_id).await.unwrap(), None);
    }
}
