//! Plan, usage and order routes

use axum::{
    extract::{Extension, State},
    Json,
};
use rewritely_billing::{
    CheckoutResponse, Plan, TeamPaymentRequest, TeamPaymentResponse, UsageSummary,
};
use rewritely_shared::BillingPeriod;
use serde::Deserialize;

use crate::{
    auth::AuthUser,
    error::ApiResult,
    extract::ApiJson,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub plan_id: String,
    pub billing_period: BillingPeriod,
    #[serde(default)]
    pub seat_count: Option<u32>,
}

/// Plans on sale, cheapest first
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<Plan>>> {
    Ok(Json(state.billing.list_plans().await?))
}

/// Entitlement snapshot of the caller
pub async fn get_usage(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
) -> ApiResult<Json<UsageSummary>> {
    Ok(Json(state.billing.usage.summarize(auth_user.user_id).await?))
}

/// Start a payment-link checkout
pub async fn create_order(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    ApiJson(req): ApiJson<CreateOrderRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let checkout = state
        .billing
        .orders
        .create_order(
            auth_user.user_id,
            req.plan_id.trim(),
            req.billing_period,
            req.seat_count,
        )
        .await?;

    Ok(Json(checkout))
}

/// Start or amend a seat-based team payment
pub async fn create_team_payment(
    State(state): State<AppState>,
    Extension(auth_user): Extension<AuthUser>,
    ApiJson(mut req): ApiJson<TeamPaymentRequest>,
) -> ApiResult<Json<TeamPaymentResponse>> {
    req.user_id = auth_user.user_id;
    if req.receipt_email.is_none() {
        req.receipt_email = auth_user.email;
    }

    Ok(Json(state.billing.orders.create_team_payment(req).await?))
}
