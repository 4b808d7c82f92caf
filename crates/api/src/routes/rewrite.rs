//! Quota-consuming rewrite route
//!
//! Order of operations: entitlement pre-check, generation, then consume. A
//! generated result is always returned, even when the consume step fails.

use axum::{
    extract::{Extension, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rewritely_billing::{ConsumeResult, UsageSummary};
use serde::{Deserialize, Serialize};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    extract::ApiJson,
    state::AppState,
};

pub const USAGE_UPDATE_FAILED: &str = "usage_update_failed";

#[derive(Debug, Deserialize)]
pub struct RewriteRequest {
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct RewriteResponse {
    pub result: String,
    pub usage: UsageSummary,
}

/// The rewrite succeeded but its bookkeeping did not
#[derive(Debug, Serialize)]
pub struct PartialRewriteResponse {
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageSummary>,
    pub error: String,
    pub code: &'static str,
}

fn summary_from_consume(consumed: ConsumeResult) -> UsageSummary {
    UsageSummary {
        has_subscription: true,
        used: Some(consumed.quota - consumed.remaining),
        plan_id: Some(consumed.plan_id),
        plan_name: Some(consumed.plan_name),
        quota: Some(consumed.quota),
        remaining: Some(consumed.remaining),
        renews_at: Some(consumed.renews_at),
    }
}

pub async fn rewrite(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    ApiJson(req): ApiJson<RewriteRequest>,
) -> ApiResult<Response> {
    let user_id = auth_user.user_id;

    if req.text.trim().is_empty() {
        return Err(ApiError::Validation("Text to rewrite must not be empty".into()));
    }

    let summary = state.billing.usage.summarize(user_id).await?;
    if !summary.has_subscription {
        tracing::info!(user_id = %user_id, "Rewrite refused: no active subscription");
        return Err(ApiError::SubscriptionRequired);
    }
    if summary.is_exhausted() {
        tracing::info!(user_id = %user_id, "Rewrite refused: daily quota exhausted");
        return Err(ApiError::QuotaExhausted);
    }

    let result = state.rewriter.rewrite(&req.text).await.map_err(|e| {
        tracing::warn!(user_id = %user_id, error = %e, "Rewrite generation failed");
        ApiError::RewriteUnavailable
    })?;

    match state.billing.quota.consume(user_id).await {
        Ok(consumed) => {
            let usage = match state.billing.usage.summarize(user_id).await {
                Ok(usage) => usage,
                Err(e) => {
                    tracing::warn!(
                        user_id = %user_id,
                        error = %e,
                        "Usage refresh failed after consume, answering from the consume result"
                    );
                    summary_from_consume(consumed)
                }
            };
            Ok(Json(RewriteResponse { result, usage }).into_response())
        }
        Err(e) => {
            if e.is_entitlement_denial() {
                tracing::info!(user_id = %user_id, error = %e, "Quota consume denied after rewrite");
            } else {
                tracing::error!(user_id = %user_id, error = %e, "Quota consume failed after rewrite");
            }

            let usage = state.billing.usage.summarize(user_id).await.ok();
            let body = PartialRewriteResponse {
                result,
                usage,
                error: "The rewrite succeeded but usage could not be updated".to_string(),
                code: USAGE_UPDATE_FAILED,
            };
            Ok((StatusCode::MULTI_STATUS, Json(body)).into_response())
        }
    }
}
