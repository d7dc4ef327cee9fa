//! JSON envelope and error mapping for the HTTP API.
//!
//! Every response body is either `{"success": true, "data": ...}` or
//! `{"success": false, "message": "..."}`.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use gateway::GatewayError;
use serde::Serialize;
use service::ServiceError;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Wraps `data` in a success envelope.
pub fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data: Some(data),
        message: None,
    })
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    BadGateway(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidOrder(msg) => ApiError::BadRequest(msg),
            ServiceError::NotFound => ApiError::NotFound("Order not found".into()),
            e @ ServiceError::OutOfStock { .. } => ApiError::Conflict(e.to_string()),
            e @ ServiceError::InvalidTransition { .. } => ApiError::Conflict(e.to_string()),
            e @ ServiceError::LatePayment { .. } => ApiError::Conflict(e.to_string()),
            ServiceError::Conflict(msg) => ApiError::Conflict(msg),
            e @ ServiceError::VoucherRejected(_) => ApiError::Unprocessable(e.to_string()),
            e @ ServiceError::AmountMismatch { .. } => ApiError::Unprocessable(e.to_string()),
            ServiceError::Gateway(
                e @ (GatewayError::InvalidSignature | GatewayError::Malformed(_)),
            ) => ApiError::BadRequest(e.to_string()),
            ServiceError::Gateway(e) => ApiError::BadGateway(e.to_string()),
            e @ (ServiceError::Db(_) | ServiceError::Pool(_) | ServiceError::Unexpected(_)) => {
                error!(error = %e, "request failed");
                ApiError::Internal("Internal server error".into())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Envelope::<()> {
            success: false,
            data: None,
            message: Some(self.to_string()),
        };
        (status, Json(body)).into_response()
    }
}
