//! HTTP routes

mod billing;
mod rewrite;
mod webhooks;

#[cfg(test)]
mod route_tests;

use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};

use crate::{auth::require_auth, state::AppState};

pub use billing::CreateOrderRequest;
pub use rewrite::{PartialRewriteResponse, RewriteRequest, RewriteResponse};

/// Build the application router
pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/v1/usage", get(billing::get_usage))
        .route("/api/v1/rewrite", post(rewrite::rewrite))
        .route("/api/v1/orders", post(billing::create_order))
        .route("/api/v1/team/payment-intent", post(billing::create_team_payment))
        .layer(middleware::from_fn_with_state(state.auth_state(), require_auth));

    let public = Router::new()
        .route("/health", get(health))
        .route("/api/v1/plans", get(billing::list_plans))
        .route("/api/v1/webhooks/stripe", post(webhooks::stripe_webhook));

    public.merge(protected).with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
