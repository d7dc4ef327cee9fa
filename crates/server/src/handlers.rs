use std::collections::BTreeMap;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use gateway::GatewayError;
use model::{DiscountKind, OrderStatus, PaymentMethod, Voucher};
use serde::Deserialize;
use serde_json::{Value, json};
use service::{CheckoutRequest, OrderFilter, Page, Reconciled, ServiceError};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    AppState,
    auth::{AdminUser, AuthUser},
    error::{ApiError, ok},
};

fn parse_order_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw).map_err(|_| ApiError::BadRequest(format!("Invalid order id '{raw}'")))
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload
        .map(|Json(body)| body)
        .map_err(|e| ApiError::BadRequest(e.body_text()))
}

/// First hop of `X-Forwarded-For`, else `X-Real-IP`.
fn client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
}

async fn checkout(
    state: AppState,
    user: AuthUser,
    headers: HeaderMap,
    mut request: CheckoutRequest,
    method: Option<PaymentMethod>,
) -> Result<Response, ApiError> {
    if let Some(method) = method {
        request.method = method;
    }
    request.client_ip = client_ip(&headers);
    let receipt = state.service.place_order(&user.caller(), request).await?;
    Ok((StatusCode::CREATED, ok(receipt)).into_response())
}

pub async fn place_order(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    checkout(state, user, headers, json_body(payload)?, None).await
}

pub async fn create_momo_payment(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    checkout(state, user, headers, json_body(payload)?, Some(PaymentMethod::Momo)).await
}

pub async fn create_vnpay_payment(
    State(state): State<AppState>,
    user: AuthUser,
    headers: HeaderMap,
    payload: Result<Json<CheckoutRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    checkout(state, user, headers, json_body(payload)?, Some(PaymentMethod::Vnpay)).await
}

pub async fn payment_status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<String>,
) -> Result<Response, ApiError> {
    let order_id = parse_order_id(&order_id)?;
    let view = state.service.payment_status(&user.caller(), order_id).await?;
    Ok(ok(view).into_response())
}

pub async fn get_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<String>,
) -> Result<Response, ApiError> {
    let order_id = parse_order_id(&order_id)?;
    let details = state.service.get_order(&user.caller(), order_id).await?;
    Ok(ok(details).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct CancelBody {
    #[serde(default)]
    reason: Option<String>,
}

pub async fn cancel_order(
    State(state): State<AppState>,
    user: AuthUser,
    Path(order_id): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let order_id = parse_order_id(&order_id)?;
    let body: CancelBody = if body.is_empty() {
        CancelBody::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?
    };
    let view = state
        .service
        .cancel_order(&user.caller(), order_id, body.reason)
        .await?;
    info!(%order_id, user_id = %user.user_id, "order cancelled");
    Ok(ok(view).into_response())
}

/// Flattens a JSON object into string fields as they appear on the wire.
pub(crate) fn flatten_params(body: &Value) -> BTreeMap<String, String> {
    let Some(object) = body.as_object() else {
        return BTreeMap::new();
    };
    object
        .iter()
        .map(|(key, value)| {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (key.clone(), text)
        })
        .collect()
}

/// MoMo IPN. MoMo stops retrying on 204.
pub async fn momo_ipn(
    State(state): State<AppState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    let params = flatten_params(&json_body(payload)?);
    match state
        .service
        .handle_callback(PaymentMethod::Momo, &params)
        .await
    {
        Ok(reconciled) => {
            let result = if reconciled.changed {
                reconciled.view.order_status.as_str()
            } else {
                "duplicate"
            };
            state.metrics.record_callback("momo", result);
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        // Already final; acknowledge so MoMo stops resending.
        Err(ServiceError::InvalidTransition { from, to }) => {
            warn!(%from, %to, "late MoMo callback ignored");
            state.metrics.record_callback("momo", "ignored");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        // Money arrived for a closed order. It is recorded on the payment for
        // refund; resending would not change anything.
        Err(e @ ServiceError::LatePayment { .. }) => {
            error!(error = %e, "MoMo payment needs a refund");
            state.metrics.record_callback("momo", "late_payment");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        Err(e) => {
            state.metrics.record_callback("momo", "rejected");
            Err(e.into())
        }
    }
}

/// VNPay answers with `RspCode`/`Message` regardless of outcome.
pub(crate) fn vnpay_ack(result: &Result<Reconciled, ServiceError>) -> (&'static str, &'static str) {
    match result {
        Ok(reconciled) if !reconciled.changed => ("02", "Order already confirmed"),
        Ok(_) => ("00", "Confirm Success"),
        Err(ServiceError::Gateway(GatewayError::InvalidSignature)) => ("97", "Invalid Checksum"),
        Err(ServiceError::NotFound) | Err(ServiceError::Gateway(GatewayError::Malformed(_))) => {
            ("01", "Order not found")
        }
        Err(ServiceError::InvalidTransition { .. }) | Err(ServiceError::LatePayment { .. }) => {
            ("02", "Order already confirmed")
        }
        Err(ServiceError::AmountMismatch { .. }) => ("04", "Invalid amount"),
        Err(_) => ("99", "Unknown error"),
    }
}

pub async fn vnpay_ipn(
    State(state): State<AppState>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Json<Value> {
    let result = state
        .service
        .handle_callback(PaymentMethod::Vnpay, &params)
        .await;
    let (code, message) = vnpay_ack(&result);
    match &result {
        Ok(reconciled) if !reconciled.changed => {
            state.metrics.record_callback("vnpay", "duplicate")
        }
        Ok(reconciled) => state
            .metrics
            .record_callback("vnpay", reconciled.view.order_status.as_str()),
        Err(e @ ServiceError::LatePayment { .. }) => {
            error!(error = %e, "VNPay payment needs a refund");
            state.metrics.record_callback("vnpay", "late_payment");
        }
        Err(e) => {
            error!(error = %e, code, "VNPay IPN not applied");
            state.metrics.record_callback("vnpay", "rejected");
        }
    }
    Json(json!({ "RspCode": code, "Message": message }))
}

/// Browser return from VNPay. Reconciles like the IPN and shows the result.
pub async fn vnpay_return(
    State(state): State<AppState>,
    Query(params): Query<BTreeMap<String, String>>,
) -> Result<Response, ApiError> {
    let view = state
        .service
        .handle_callback(PaymentMethod::Vnpay, &params)
        .await?
        .view;
    Ok(ok(view).into_response())
}

#[derive(Debug, Deserialize)]
pub struct AdminOrdersQuery {
    status: Option<String>,
    user_id: Option<String>,
    page: Option<u32>,
    per_page: Option<u32>,
}

pub async fn admin_list_orders(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(query): Query<AdminOrdersQuery>,
) -> Result<Response, ApiError> {
    let status = query
        .status
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(str::parse::<OrderStatus>)
        .transpose()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let filter = OrderFilter {
        status,
        user_id: query.user_id.filter(|u| !u.is_empty()),
    };
    let defaults = Page::default();
    let page = Page {
        page: query.page.unwrap_or(defaults.page),
        per_page: query.per_page.unwrap_or(defaults.per_page),
    };
    let orders = state.service.list_orders(&filter, page).await?;
    Ok(ok(orders).into_response())
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    status: OrderStatus,
    #[serde(default)]
    note: Option<String>,
}

pub async fn admin_set_status(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(order_id): Path<String>,
    payload: Result<Json<StatusUpdate>, JsonRejection>,
) -> Result<Response, ApiError> {
    let order_id = parse_order_id(&order_id)?;
    let update = json_body(payload)?;
    let view = state
        .service
        .set_status(order_id, update.status, update.note)
        .await?;
    info!(%order_id, admin = %admin.user_id, status = %view.order_status, "status set by admin");
    Ok(ok(view).into_response())
}

pub async fn admin_list_vouchers(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> Result<Response, ApiError> {
    Ok(ok(state.service.list_vouchers().await?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct NewVoucher {
    code: String,
    kind: DiscountKind,
    value: i64,
    #[serde(default)]
    max_discount: Option<i64>,
    #[serde(default)]
    min_order_value: i64,
    usage_limit: i32,
    starts_at: DateTime<Utc>,
    ends_at: DateTime<Utc>,
    #[serde(default = "active_by_default")]
    active: bool,
}

fn active_by_default() -> bool {
    true
}

impl From<NewVoucher> for Voucher {
    fn from(v: NewVoucher) -> Self {
        Voucher {
            code: v.code,
            kind: v.kind,
            value: v.value,
            max_discount: v.max_discount,
            min_order_value: v.min_order_value,
            usage_limit: v.usage_limit,
            used_count: 0,
            starts_at: v.starts_at,
            ends_at: v.ends_at,
            active: v.active,
        }
    }
}

pub async fn admin_create_voucher(
    State(state): State<AppState>,
    _admin: AdminUser,
    payload: Result<Json<NewVoucher>, JsonRejection>,
) -> Result<Response, ApiError> {
    let voucher = state
        .service
        .create_voucher(json_body(payload)?.into())
        .await?;
    Ok((StatusCode::CREATED, ok(voucher)).into_response())
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn metrics(State(state): State<AppState>) -> Response {
    match state.metrics.encode() {
        Ok(text) => (StatusCode::OK, text).into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}
