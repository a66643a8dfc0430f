//! API error type and its HTTP mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ideakit_billing::BillingError;
use serde_json::json;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0} is not configured")]
    ServiceUnavailable(String),

    #[error("Payment provider error: {0}")]
    PaymentProvider(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::InvalidInput(msg) => ApiError::BadRequest(msg),
            BillingError::NotFound(msg) => ApiError::NotFound(msg),
            BillingError::WebhookSignatureInvalid => {
                ApiError::BadRequest("Invalid webhook signature".to_string())
            }
            BillingError::WebhookPayloadInvalid(_) => {
                ApiError::BadRequest("Invalid webhook payload".to_string())
            }
            BillingError::StripeApi(msg) => ApiError::PaymentProvider(msg),
            BillingError::NotConfigured(what) => ApiError::ServiceUnavailable(what),
            BillingError::Database(msg) => ApiError::Database(msg),
            BillingError::Config(msg)
            | BillingError::CompensationFailed(msg)
            | BillingError::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            ApiError::ServiceUnavailable(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            ApiError::PaymentProvider(msg) => {
                tracing::error!(error = %msg, "Payment provider request failed");
                (StatusCode::BAD_GATEWAY, "Payment provider unavailable".to_string())
            }
            ApiError::Database(msg) | ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "Request failed with internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = Json(json!({
            "error": message,
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
