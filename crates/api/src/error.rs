//! API error type
//!
//! Every failure leaves the server as `{ "error": <message>, "code": <code> }`.
//! Internal error text is logged, never echoed.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rewritely_billing::BillingError;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("{0}")]
    Validation(String),

    #[error("An active subscription is required")]
    SubscriptionRequired,

    #[error("Daily quota exhausted")]
    QuotaExhausted,

    #[error("Rewrite service unavailable")]
    RewriteUnavailable,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Invalid webhook payload")]
    InvalidPayload,

    #[error("Not found")]
    NotFound,

    #[error("Service temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::SubscriptionRequired => StatusCode::PAYMENT_REQUIRED,
            ApiError::QuotaExhausted => StatusCode::TOO_MANY_REQUESTS,
            ApiError::RewriteUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InvalidSignature | ApiError::InvalidPayload => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::Validation(_) => "invalid_input",
            ApiError::SubscriptionRequired => "subscription_required",
            ApiError::QuotaExhausted => "quota_exhausted",
            ApiError::RewriteUnavailable => "rewrite_unavailable",
            ApiError::InvalidSignature => "invalid_signature",
            ApiError::InvalidPayload => "invalid_payload",
            ApiError::NotFound => "not_found",
            ApiError::Unavailable(_) => "service_unavailable",
            ApiError::Internal(_) => "internal_error",
        }
    }

    fn public_message(&self) -> String {
        match self {
            ApiError::Unavailable(_) => "Service temporarily unavailable, please retry".to_string(),
            ApiError::Internal(_) => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            ApiError::Internal(detail) => tracing::error!(error = %detail, "Request failed"),
            ApiError::Unavailable(detail) => {
                tracing::warn!(error = %detail, "Request failed on a transient error")
            }
            _ => {}
        }

        let status = self.status();
        let body = Json(json!({
            "error": self.public_message(),
            "code": self.code(),
        }));

        (status, body).into_response()
    }
}

impl From<BillingError> for ApiError {
    fn from(e: BillingError) -> Self {
        match e {
            BillingError::WebhookSignatureInvalid => ApiError::InvalidSignature,
            BillingError::WebhookPayloadInvalid(_) => ApiError::InvalidPayload,
            BillingError::InvalidInput(msg) => ApiError::Validation(msg),
            e @ BillingError::SeatMinimum { .. } => ApiError::Validation(e.to_string()),
            BillingError::NotFound(_) => ApiError::NotFound,
            BillingError::QuotaExceeded => ApiError::QuotaExhausted,
            BillingError::SubscriptionMissing => ApiError::SubscriptionRequired,
            e @ (BillingError::Timeout(_)
            | BillingError::StripeApi(_)
            | BillingError::Database(_)) => ApiError::Unavailable(e.to_string()),
            e @ (BillingError::Config(_) | BillingError::Internal(_)) => {
                ApiError::Internal(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_error_mapping() {
        assert_eq!(
            ApiError::from(BillingError::QuotaExceeded).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::from(BillingError::SubscriptionMissing).code(),
            "subscription_required"
        );
        assert_eq!(
            ApiError::from(BillingError::WebhookSignatureInvalid).status(),
            StatusCode::BAD_REQUEST
        );

        let seats = ApiError::from(BillingError::SeatMinimum {
            plan_id: "team".into(),
            minimum: 5,
        });
        assert_eq!(seats.code(), "invalid_input");
        assert_eq!(seats.to_string(), "Plan team requires at least 5 seats");
    }

    #[test]
    fn test_internal_detail_is_not_exposed() {
        let err = ApiError::from(BillingError::Database("password authentication failed".into()));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!err.public_message().contains("password"));

        let err = ApiError::Internal("secret detail".into());
        assert_eq!(err.public_message(), "Internal server error");
    }
}
