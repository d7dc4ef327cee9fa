//! MoMo e-wallet client (API v2, `captureWallet`).
//!
//! Every request and IPN is signed with HMAC-SHA256 over a `key=value&...`
//! string whose keys are in alphabetical order.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use model::PaymentMethod;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    GatewayError, GatewayOutcome, GatewayReference, OutcomeStatus, PaymentGateway, PaymentIntent,
    hmac_sha256_hex, parse_order_id, required, signatures_match,
};

const REQUEST_TYPE: &str = "captureWallet";

/// How a MoMo `resultCode` reads for a transaction that exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResultKind {
    Paid,
    /// The customer has not finished paying yet.
    Pending,
    /// The payment itself was declined, cancelled or expired.
    Declined,
    /// MoMo could not serve the request, e.g. during maintenance. Says
    /// nothing about the payment.
    RequestError,
}

fn classify_result(code: i64) -> ResultKind {
    match code {
        0 => ResultKind::Paid,
        1000 | 7000 | 7002 | 9000 => ResultKind::Pending,
        1001..=1007 | 1017 | 1026 | 4001..=4100 => ResultKind::Declined,
        _ => ResultKind::RequestError,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MomoConfig {
    /// Base URL, e.g. `https://test-payment.momo.vn`.
    pub endpoint: String,
    pub partner_code: String,
    pub access_key: String,
    pub secret_key: String,
    pub redirect_url: String,
    pub ipn_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateRequest<'a> {
    partner_code: &'a str,
    access_key: &'a str,
    request_id: String,
    amount: i64,
    order_id: String,
    order_info: &'a str,
    redirect_url: &'a str,
    ipn_url: &'a str,
    extra_data: &'a str,
    request_type: &'a str,
    signature: String,
    lang: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateResponse {
    result_code: i64,
    #[serde(default)]
    message: String,
    #[serde(default)]
    request_id: String,
    pay_url: Option<String>,
    qr_code_url: Option<String>,
    deeplink: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    partner_code: &'a str,
    request_id: String,
    order_id: String,
    signature: String,
    lang: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    result_code: i64,
    #[serde(default)]
    message: String,
    amount: Option<i64>,
    trans_id: Option<i64>,
}

#[derive(Clone)]
pub struct MomoGateway {
    client: Client,
    config: MomoConfig,
}

impl MomoGateway {
    pub fn new(config: MomoConfig) -> Result<Self, GatewayError> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn is_configured(&self) -> bool {
        !self.config.partner_code.is_empty()
            && !self.config.access_key.is_empty()
            && !self.config.secret_key.is_empty()
    }

    fn ensure_configured(&self) -> Result<(), GatewayError> {
        if self.is_configured() {
            Ok(())
        } else {
            Err(GatewayError::NotConfigured("MoMo"))
        }
    }

    fn create_signature(
        &self,
        request_id: &str,
        order_id: &str,
        amount: i64,
        order_info: &str,
        extra_data: &str,
    ) -> Result<String, GatewayError> {
        let raw = format!(
            "accessKey={}&amount={}&extraData={}&ipnUrl={}&orderId={}&orderInfo={}&partnerCode={}&redirectUrl={}&requestId={}&requestType={}",
            self.config.access_key,
            amount,
            extra_data,
            self.config.ipn_url,
            order_id,
            order_info,
            self.config.partner_code,
            self.config.redirect_url,
            request_id,
            REQUEST_TYPE,
        );
        hmac_sha256_hex(&self.config.secret_key, &raw)
    }

    /// Signature MoMo puts on IPN callbacks.
    pub fn ipn_signature(&self, params: &BTreeMap<String, String>) -> Result<String, GatewayError> {
        let field = |key: &str| params.get(key).map(String::as_str).unwrap_or("");
        let raw = format!(
            "accessKey={}&amount={}&extraData={}&message={}&orderId={}&orderInfo={}&orderType={}&partnerCode={}&payType={}&requestId={}&responseTime={}&resultCode={}&transId={}",
            self.config.access_key,
            field("amount"),
            field("extraData"),
            field("message"),
            field("orderId"),
            field("orderInfo"),
            field("orderType"),
            field("partnerCode"),
            field("payType"),
            field("requestId"),
            field("responseTime"),
            field("resultCode"),
            field("transId"),
        );
        hmac_sha256_hex(&self.config.secret_key, &raw)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.endpoint.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl PaymentGateway for MomoGateway {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Momo
    }

    async fn create_payment(&self, intent: &PaymentIntent) -> Result<GatewayReference, GatewayError> {
        self.ensure_configured()?;

        let order_id = intent.order_id.to_string();
        let request_id = Uuid::new_v4().to_string();
        let extra_data = "";
        let signature = self.create_signature(
            &request_id,
            &order_id,
            intent.amount,
            &intent.description,
            extra_data,
        )?;

        let request = CreateRequest {
            partner_code: &self.config.partner_code,
            access_key: &self.config.access_key,
            request_id,
            amount: intent.amount,
            order_id,
            order_info: &intent.description,
            redirect_url: &self.config.redirect_url,
            ipn_url: &self.config.ipn_url,
            extra_data,
            request_type: REQUEST_TYPE,
            signature,
            lang: "vi",
        };

        let response = self
            .client
            .post(self.endpoint("/v2/gateway/api/create"))
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(status = %status, body = %body, "MoMo create response");

        let parsed: CreateResponse = serde_json::from_str(&body).map_err(|e| {
            GatewayError::Malformed(format!("MoMo create response (HTTP {status}): {e}"))
        })?;

        if parsed.result_code != 0 {
            warn!(
                order_id = %intent.order_id,
                result_code = parsed.result_code,
                message = %parsed.message,
                "MoMo refused payment request"
            );
            return Err(GatewayError::Rejected {
                code: parsed.result_code.to_string(),
                message: parsed.message,
            });
        }

        info!(order_id = %intent.order_id, amount = intent.amount, "MoMo payment created");
        Ok(GatewayReference {
            reference: parsed.request_id,
            pay_url: parsed.pay_url,
            qr_code_url: parsed.qr_code_url,
            deeplink: parsed.deeplink,
        })
    }

    async fn query_status(&self, order_id: Uuid) -> Result<Option<GatewayOutcome>, GatewayError> {
        self.ensure_configured()?;

        let order_ref = order_id.to_string();
        let request_id = Uuid::new_v4().to_string();
        let raw = format!(
            "accessKey={}&orderId={}&partnerCode={}&requestId={}",
            self.config.access_key, order_ref, self.config.partner_code, request_id
        );
        let request = QueryRequest {
            partner_code: &self.config.partner_code,
            request_id,
            order_id: order_ref,
            signature: hmac_sha256_hex(&self.config.secret_key, &raw)?,
            lang: "vi",
        };

        let parsed: QueryResponse = self
            .client
            .post(self.endpoint("/v2/gateway/api/query"))
            .json(&request)
            .send()
            .await?
            .json()
            .await?;
        debug!(order_id = %order_id, result_code = parsed.result_code, "MoMo query response");

        let status = match classify_result(parsed.result_code) {
            ResultKind::Paid => OutcomeStatus::Paid,
            ResultKind::Declined => OutcomeStatus::Failed,
            ResultKind::Pending => return Ok(None),
            ResultKind::RequestError => {
                warn!(
                    order_id = %order_id,
                    result_code = parsed.result_code,
                    message = %parsed.message,
                    "MoMo could not answer status query"
                );
                return Err(GatewayError::Rejected {
                    code: parsed.result_code.to_string(),
                    message: parsed.message,
                });
            }
        };
        Ok(Some(GatewayOutcome {
            order_id,
            status,
            amount: parsed.amount,
            transaction_ref: parsed.trans_id.map(|id| id.to_string()),
            message: parsed.message,
        }))
    }

    fn verify_callback(&self, params: &BTreeMap<String, String>) -> Result<GatewayOutcome, GatewayError> {
        let given = required(params, "signature")?;
        let expected = self.ipn_signature(params)?;
        if !signatures_match(&expected, given) {
            warn!(order_id = ?params.get("orderId"), "MoMo IPN signature mismatch");
            return Err(GatewayError::InvalidSignature);
        }

        let order_id = parse_order_id(required(params, "orderId")?)?;
        let result_code: i64 = required(params, "resultCode")?
            .parse()
            .map_err(|_| GatewayError::Malformed("resultCode is not a number".into()))?;
        let amount = required(params, "amount")?
            .parse::<i64>()
            .map_err(|_| GatewayError::Malformed("amount is not a number".into()))?;

        Ok(GatewayOutcome {
            order_id,
            status: if result_code == 0 {
                OutcomeStatus::Paid
            } else {
                OutcomeStatus::Failed
            },
            amount: Some(amount),
            transaction_ref: params.get("transId").cloned(),
            message: params.get("message").cloned().unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ORDER_ID: &str = "6f1d3a52-9c4e-4d59-9d51-2b4a9a1f3c11";

    fn config(endpoint: &str) -> MomoConfig {
        MomoConfig {
            endpoint: endpoint.to_string(),
            partner_code: "MOMOTEST".into(),
            access_key: "F8BBA842ECF85".into(),
            secret_key: "K951B6PE1waDMi640xX08PD3vg6EkVlz".into(),
            redirect_url: "http://localhost:5173/checkout/result".into(),
            ipn_url: "http://localhost:8081/api/payment/momo/ipn".into(),
            timeout: Duration::from_secs(5),
        }
    }

    fn intent() -> PaymentIntent {
        PaymentIntent {
            order_id: Uuid::parse_str(ORDER_ID).unwrap(),
            amount: 1_050_000,
            description: "Thanh toan don hang".into(),
            client_ip: None,
        }
    }

    fn ipn_params(gateway: &MomoGateway, result_code: &str) -> BTreeMap<String, String> {
        let mut params: BTreeMap<String, String> = [
            ("partnerCode", "MOMOTEST"),
            ("orderId", ORDER_ID),
            ("requestId", "req-1"),
            ("amount", "1050000"),
            ("orderInfo", "Thanh toan don hang"),
            ("orderType", "momo_wallet"),
            ("transId", "4088878653"),
            ("resultCode", result_code),
            ("message", "Successful."),
            ("payType", "qr"),
            ("responseTime", "1721720663942"),
            ("extraData", ""),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let signature = gateway.ipn_signature(&params).unwrap();
        params.insert("signature".into(), signature);
        params
    }

    #[test]
    fn test_create_signature_vector() {
        let gateway = MomoGateway::new(config("http://momo.test")).unwrap();
        let signature = gateway
            .create_signature("req-1", ORDER_ID, 1_050_000, "Thanh toan don hang", "")
            .unwrap();
        assert_eq!(
            signature,
            "9690ecf6a426af3d239e3fd295e665adefca159da44672f4f1d32e4a40ab8e53"
        );
    }

    #[test]
    fn test_ipn_with_valid_signature_is_accepted() {
        let gateway = MomoGateway::new(config("http://momo.test")).unwrap();
        let outcome = gateway.verify_callback(&ipn_params(&gateway, "0")).unwrap();
        assert_eq!(outcome.order_id.to_string(), ORDER_ID);
        assert_eq!(outcome.status, OutcomeStatus::Paid);
        assert_eq!(outcome.amount, Some(1_050_000));
        assert_eq!(outcome.transaction_ref.as_deref(), Some("4088878653"));
    }

    #[test]
    fn test_ipn_with_error_code_is_failure() {
        let gateway = MomoGateway::new(config("http://momo.test")).unwrap();
        let outcome = gateway.verify_callback(&ipn_params(&gateway, "1006")).unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
    }

    #[test]
    fn test_tampered_ipn_is_rejected() {
        let gateway = MomoGateway::new(config("http://momo.test")).unwrap();
        let mut params = ipn_params(&gateway, "0");
        params.insert("amount".into(), "1".into());
        assert!(matches!(
            gateway.verify_callback(&params),
            Err(GatewayError::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn test_create_payment_returns_pay_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/gateway/api/create"))
            .and(body_partial_json(serde_json::json!({
                "partnerCode": "MOMOTEST",
                "orderId": ORDER_ID,
                "amount": 1050000,
                "requestType": "captureWallet"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "partnerCode": "MOMOTEST",
                "orderId": ORDER_ID,
                "requestId": "req-from-momo",
                "amount": 1050000,
                "responseTime": 1721720663942i64,
                "message": "Thành công.",
                "resultCode": 0,
                "payUrl": "https://test-payment.momo.vn/v2/gateway/pay?t=abc",
                "qrCodeUrl": "momo://app?action=payWithApp&t=abc"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gateway = MomoGateway::new(config(&server.uri())).unwrap();
        let reference = gateway.create_payment(&intent()).await.unwrap();
        assert_eq!(reference.reference, "req-from-momo");
        assert_eq!(
            reference.pay_url.as_deref(),
            Some("https://test-payment.momo.vn/v2/gateway/pay?t=abc")
        );
        assert!(reference.qr_code_url.is_some());
        assert!(reference.deeplink.is_none());
    }

    #[tokio::test]
    async fn test_create_payment_surfaces_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/gateway/api/create"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "resultCode": 22,
                "message": "Số tiền giao dịch không hợp lệ."
            })))
            .mount(&server)
            .await;

        let gateway = MomoGateway::new(config(&server.uri())).unwrap();
        match gateway.create_payment(&intent()).await {
            Err(GatewayError::Rejected { code, .. }) => assert_eq!(code, "22"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_query_status_maps_result_codes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/gateway/api/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resultCode": 1000,
                "message": "Giao dịch đã được khởi tạo."
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v2/gateway/api/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resultCode": 0,
                "message": "Thành công.",
                "amount": 1050000,
                "transId": 4088878653i64
            })))
            .mount(&server)
            .await;

        let gateway = MomoGateway::new(config(&server.uri())).unwrap();
        let order_id = Uuid::parse_str(ORDER_ID).unwrap();
        assert_eq!(gateway.query_status(order_id).await.unwrap(), None);

        let outcome = gateway.query_status(order_id).await.unwrap().unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Paid);
        assert_eq!(outcome.transaction_ref.as_deref(), Some("4088878653"));
    }

    #[test]
    fn test_result_code_classes() {
        assert_eq!(classify_result(0), ResultKind::Paid);
        assert_eq!(classify_result(1000), ResultKind::Pending);
        assert_eq!(classify_result(7002), ResultKind::Pending);
        assert_eq!(classify_result(1006), ResultKind::Declined);
        assert_eq!(classify_result(4001), ResultKind::Declined);
        for code in [10, 11, 13, 20, 41, 42, 99] {
            assert_eq!(classify_result(code), ResultKind::RequestError, "code {code}");
        }
    }

    #[tokio::test]
    async fn test_query_during_maintenance_is_not_a_failed_payment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/gateway/api/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resultCode": 10,
                "message": "He thong dang duoc bao tri."
            })))
            .mount(&server)
            .await;

        let gateway = MomoGateway::new(config(&server.uri())).unwrap();
        let order_id = Uuid::parse_str(ORDER_ID).unwrap();
        match gateway.query_status(order_id).await {
            Err(GatewayError::Rejected { code, .. }) => assert_eq!(code, "10"),
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_query_reports_declined_payment() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2/gateway/api/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "resultCode": 1006,
                "message": "Giao dich bi tu choi boi nguoi dung.",
                "amount": 1050000
            })))
            .mount(&server)
            .await;

        let gateway = MomoGateway::new(config(&server.uri())).unwrap();
        let order_id = Uuid::parse_str(ORDER_ID).unwrap();
        let outcome = gateway.query_status(order_id).await.unwrap().unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Failed);
        assert_eq!(outcome.amount, Some(1_050_000));
    }

    #[tokio::test]
    async fn test_unconfigured_gateway_refuses() {
        let mut cfg = config("http://momo.test");
        cfg.secret_key.clear();
        let gateway = MomoGateway::new(cfg).unwrap();
        assert!(matches!(
            gateway.create_payment(&intent()).await,
            Err(GatewayError::NotConfigured("MoMo"))
        ));
    }
}
