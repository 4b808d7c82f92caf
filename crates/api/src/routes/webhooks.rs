//! Inbound Stripe notifications
//!
//! Unauthenticated; trust comes from the signature header. Only a bad
//! signature, an unreadable envelope or a transient failure answers non-2xx.

use axum::{extract::State, http::HeaderMap, Json};
use rewritely_billing::WebhookOutcome;
use serde_json::{json, Value};

use crate::{
    error::{ApiError, ApiResult},
    state::AppState,
};

const SIGNATURE_HEADER: &str = "stripe-signature";

pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook without signature header");
            ApiError::InvalidSignature
        })?;

    let event = state
        .billing
        .webhooks
        .verify_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Rejected Stripe webhook");
            ApiError::from(e)
        })?;

    let event_id = event.id.clone();
    match state.billing.webhooks.handle_event(event).await {
        Ok(WebhookOutcome::Processed) => Ok(Json(json!({ "received": true }))),
        Ok(WebhookOutcome::Duplicate) => Ok(Json(json!({ "received": true, "duplicate": true }))),
        Err(e) => {
            tracing::error!(event_id = %event_id, error = %e, "Webhook processing failed, requesting redelivery");
            Err(ApiError::Internal(e.to_string()))
        }
    }
}
