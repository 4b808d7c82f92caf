//! Router tests
//!
//! Drive the full router with `oneshot` against the in-memory billing store,
//! an in-memory payment processor and scripted rewriters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use jsonwebtoken::{encode, EncodingKey, Header};
use rewritely_billing::{
    quota::usage_date, signature_header, AnalyticsNotifier, BillingConfig, BillingService,
    BillingStore, CheckoutCatalog, InMemoryBillingStore, InMemoryProcessor, Subscription,
};
use rewritely_shared::{BillingPeriod, SubscriptionStatus};
use serde_json::{json, Value};
use time::{Duration, OffsetDateTime};
use tower::ServiceExt;
use url::Url;
use uuid::Uuid;

use super::create_router;
use crate::auth::{Claims, IdentityVerifier};
use crate::rewrite::{RewriteError, Rewriter};
use crate::state::AppState;

const IDENTITY_SECRET: &str = "route-test-identity";
const WEBHOOK_SECRET: &str = "whsec_routes";

// =============================================================================
// Scripted rewriters
// =============================================================================

#[derive(Default)]
struct EchoRewriter {
    calls: AtomicUsize,
}

#[async_trait]
impl Rewriter for EchoRewriter {
    async fn rewrite(&self, text: &str) -> Result<String, RewriteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("rewritten: {}", text.trim()))
    }
}

struct DownRewriter;

#[async_trait]
impl Rewriter for DownRewriter {
    async fn rewrite(&self, _text: &str) -> Result<String, RewriteError> {
        Err(RewriteError::Timeout)
    }
}

/// Cancels the caller's subscription while generating, so the consume that
/// follows finds no entitlement
struct CancellingRewriter {
    store: InMemoryBillingStore,
    user_id: Uuid,
}

#[async_trait]
impl Rewriter for CancellingRewriter {
    async fn rewrite(&self, text: &str) -> Result<String, RewriteError> {
        if let Ok(Some(mut subscription)) = self.store.find_subscription_by_user(self.user_id).await {
            subscription.status = SubscriptionStatus::Canceled;
            self.store.put_subscription(subscription).await;
        }
        Ok(format!("rewritten: {}", text))
    }
}

// =============================================================================
// Harness
// =============================================================================

struct TestApp {
    router: Router,
    store: InMemoryBillingStore,
}

fn build(rewriter: Arc<dyn Rewriter>, store: InMemoryBillingStore) -> TestApp {
    let mut catalog = CheckoutCatalog::default();
    catalog.insert(
        "starter",
        BillingPeriod::Monthly,
        Url::parse("https://buy.stripe.com/starter_monthly").unwrap(),
    );
    let config = BillingConfig {
        catalog,
        ..BillingConfig::new(WEBHOOK_SECRET)
    };

    let billing = BillingService::new(
        config,
        Arc::new(store.clone()),
        Arc::new(InMemoryProcessor::new()),
        AnalyticsNotifier::disabled(),
    );
    let state = AppState::new(
        Arc::new(billing),
        rewriter,
        IdentityVerifier::new(IDENTITY_SECRET),
    );

    TestApp {
        router: create_router(state),
        store,
    }
}

fn app() -> TestApp {
    build(
        Arc::new(EchoRewriter::default()),
        InMemoryBillingStore::with_default_plans(),
    )
}

fn token(user_id: Uuid) -> String {
    let claims = Claims {
        sub: user_id,
        email: Some("writer@example.com".to_string()),
        exp: OffsetDateTime::now_utc().unix_timestamp() + 600,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(IDENTITY_SECRET.as_bytes()),
    )
    .unwrap()
}

async fn subscribe(store: &InMemoryBillingStore, user_id: Uuid, plan_id: &str) {
    let now = OffsetDateTime::now_utc();
    store
        .put_subscription(Subscription {
            id: Uuid::new_v4(),
            user_id,
            plan_id: plan_id.to_string(),
            billing_period: BillingPeriod::Monthly,
            status: SubscriptionStatus::Active,
            current_period_start: now - Duration::days(1),
            current_period_end: now + Duration::days(29),
            cancel_at_period_end: false,
            processor_subscription_id: None,
            processor_customer_id: None,
            source_event_at: None,
        })
        .await;
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}

fn post_json(uri: &str, user_id: Uuid, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token(user_id)))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str, user_id: Uuid) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token(user_id)))
        .body(Body::empty())
        .unwrap()
}

fn webhook(payload: &str, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/api/v1/webhooks/stripe")
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(signature) = signature {
        builder = builder.header("Stripe-Signature", signature);
    }
    builder.body(Body::from(payload.to_string())).unwrap()
}

// =============================================================================
// Public routes
// =============================================================================

#[tokio::test]
async fn test_health() {
    let app = app();
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_plans_listed_cheapest_first() {
    let app = app();
    let request = Request::builder()
        .uri("/api/v1/plans")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|plan| plan["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["starter", "professional", "team"]);
}

#[tokio::test]
async fn test_protected_routes_require_token() {
    let app = app();
    let request = Request::builder()
        .uri("/api/v1/usage")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app.router, request).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");
}

// =============================================================================
// Usage
// =============================================================================

#[tokio::test]
async fn test_usage_without_subscription() {
    let app = app();
    let (status, body) = send(&app.router, get("/api/v1/usage", Uuid::new_v4())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "hasSubscription": false }));
}

#[tokio::test]
async fn test_usage_with_subscription() {
    let app = app();
    let user = Uuid::new_v4();
    subscribe(&app.store, user, "professional").await;
    app.store
        .set_usage(user, usage_date(OffsetDateTime::now_utc()), 3)
        .await;

    let (status, body) = send(&app.router, get("/api/v1/usage", user)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["hasSubscription"], true);
    assert_eq!(body["planId"], "professional");
    assert_eq!(body["quota"], 20);
    assert_eq!(body["used"], 3);
    assert_eq!(body["remaining"], 17);
}

// =============================================================================
// Rewrite
// =============================================================================

#[tokio::test]
async fn test_rewrite_success_consumes_one_unit() {
    let app = app();
    let user = Uuid::new_v4();
    subscribe(&app.store, user, "starter").await;

    let (status, body) = send(
        &app.router,
        post_json("/api/v1/rewrite", user, json!({ "text": "Hello world" })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "rewritten: Hello world");
    assert_eq!(body["usage"]["remaining"], 4);
    assert_eq!(body["usage"]["used"], 1);
    assert_eq!(
        app.store
            .usage_count(user, usage_date(OffsetDateTime::now_utc()))
            .await
            .unwrap(),
        1
    );
}

#[tokio::test]
async fn test_rewrite_rejects_blank_text() {
    let app = app();
    let user = Uuid::new_v4();
    subscribe(&app.store, user, "starter").await;

    let (status, body) = send(
        &app.router,
        post_json("/api/v1/rewrite", user, json!({ "text": "   \n" })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");
}

#[tokio::test]
async fn test_rewrite_without_subscription_is_402() {
    let rewriter = Arc::new(EchoRewriter::default());
    let app = build(rewriter.clone(), InMemoryBillingStore::with_default_plans());

    let (status, body) = send(
        &app.router,
        post_json("/api/v1/rewrite", Uuid::new_v4(), json!({ "text": "Hello" })),
    )
    .await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "subscription_required");
    assert_eq!(rewriter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rewrite_with_exhausted_quota_is_429() {
    let rewriter = Arc::new(EchoRewriter::default());
    let app = build(rewriter.clone(), InMemoryBillingStore::with_default_plans());
    let user = Uuid::new_v4();
    subscribe(&app.store, user, "starter").await;
    app.store
        .set_usage(user, usage_date(OffsetDateTime::now_utc()), 5)
        .await;

    let (status, body) = send(
        &app.router,
        post_json("/api/v1/rewrite", user, json!({ "text": "Hello" })),
    )
    .await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["code"], "quota_exhausted");
    assert_eq!(rewriter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_rewrite_generation_outage_is_503_and_free() {
    let app = build(Arc::new(DownRewriter), InMemoryBillingStore::with_default_plans());
    let user = Uuid::new_v4();
    subscribe(&app.store, user, "starter").await;

    let (status, body) = send(
        &app.router,
        post_json("/api/v1/rewrite", user, json!({ "text": "Hello" })),
    )
    .await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "rewrite_unavailable");
    assert_eq!(
        app.store
            .usage_count(user, usage_date(OffsetDateTime::now_utc()))
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn test_rewrite_keeps_result_when_consume_fails() {
    let store = InMemoryBillingStore::with_default_plans();
    let user = Uuid::new_v4();
    subscribe(&store, user, "starter").await;
    let app = build(
        Arc::new(CancellingRewriter {
            store: store.clone(),
            user_id: user,
        }),
        store,
    );

    let (status, body) = send(
        &app.router,
        post_json("/api/v1/rewrite", user, json!({ "text": "Keep me" })),
    )
    .await;

    assert_eq!(status, StatusCode::MULTI_STATUS);
    assert_eq!(body["result"], "rewritten: Keep me");
    assert_eq!(body["code"], "usage_update_failed");
    assert_eq!(body["usage"], json!({ "hasSubscription": false }));
}

// =============================================================================
// Orders
// =============================================================================

#[tokio::test]
async fn test_create_order_returns_link_with_correlation_id() {
    let app = app();
    let (status, body) = send(
        &app.router,
        post_json(
            "/api/v1/orders",
            Uuid::new_v4(),
            json!({ "plan_id": "starter", "billing_period": "monthly" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let correlation_id = body["correlation_id"].as_str().unwrap();
    let url = Url::parse(body["url"].as_str().unwrap()).unwrap();
    assert!(url
        .query_pairs()
        .any(|(k, v)| k == "client_reference_id" && v == correlation_id));
}

#[tokio::test]
async fn test_create_order_rejects_unoffered_period_and_team() {
    let app = app();
    let user = Uuid::new_v4();

    let (status, body) = send(
        &app.router,
        post_json(
            "/api/v1/orders",
            user,
            json!({ "plan_id": "starter", "billing_period": "yearly" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");

    let (status, body) = send(
        &app.router,
        post_json(
            "/api/v1/orders",
            user,
            json!({ "plan_id": "team", "billing_period": "monthly", "seat_count": 2 }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Plan team requires at least 5 seats");
}

#[tokio::test]
async fn test_unreadable_bodies_use_error_envelope() {
    let app = app();
    let user = Uuid::new_v4();

    let (status, body) = send(
        &app.router,
        post_json(
            "/api/v1/orders",
            user,
            json!({ "plan_id": "starter", "billing_period": "weekly" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");
    assert!(body["error"].is_string());

    let malformed = Request::builder()
        .method("POST")
        .uri("/api/v1/rewrite")
        .header(header::AUTHORIZATION, format!("Bearer {}", token(user)))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{\"text\": "))
        .unwrap();
    let (status, body) = send(&app.router, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");

    let untyped = Request::builder()
        .method("POST")
        .uri("/api/v1/team/payment-intent")
        .header(header::AUTHORIZATION, format!("Bearer {}", token(user)))
        .body(Body::from(json!({ "seat_count": 6, "billing_period": "monthly" }).to_string()))
        .unwrap();
    let (status, body) = send(&app.router, untyped).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");
}

#[tokio::test]
async fn test_team_payment_intent() {
    let app = app();
    let user = Uuid::new_v4();

    let (status, body) = send(
        &app.router,
        post_json(
            "/api/v1/team/payment-intent",
            user,
            json!({ "seat_count": 6, "billing_period": "monthly" }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["client_secret"], "pi_test_1_secret");
    assert_eq!(body["unit_amount_cents"], 3999);
    assert_eq!(body["total_amount_cents"], 6 * 3999);

    let (status, body) = send(
        &app.router,
        post_json(
            "/api/v1/team/payment-intent",
            user,
            json!({ "seat_count": 4, "billing_period": "monthly" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");
}

// =============================================================================
// Webhooks
// =============================================================================

fn checkout_completed(event_id: &str, correlation_id: &str, created: i64) -> String {
    json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "created": created,
        "data": {
            "object": {
                "id": "cs_test_route",
                "object": "checkout.session",
                "client_reference_id": correlation_id,
                "subscription": null,
                "customer": "cus_route",
                "payment_intent": null
            }
        }
    })
    .to_string()
}

#[tokio::test]
async fn test_webhook_requires_signature() {
    let app = app();
    let payload = checkout_completed("evt_nosig", "missing", 0);

    let (status, body) = send(&app.router, webhook(&payload, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_signature");

    let forged = signature_header("whsec_other", OffsetDateTime::now_utc().unix_timestamp(), &payload)
        .unwrap();
    let (status, _) = send(&app.router, webhook(&payload, Some(forged))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(app.store.event_count().await, 0);
}

#[tokio::test]
async fn test_checkout_webhook_grants_entitlement_once() {
    let app = app();
    let user = Uuid::new_v4();

    let (_, order) = send(
        &app.router,
        post_json(
            "/api/v1/orders",
            user,
            json!({ "plan_id": "starter", "billing_period": "monthly" }),
        ),
    )
    .await;
    let correlation_id = order["correlation_id"].as_str().unwrap();

    let now = OffsetDateTime::now_utc().unix_timestamp();
    let payload = checkout_completed("evt_route_checkout", correlation_id, now);
    let signature = signature_header(WEBHOOK_SECRET, now, &payload).unwrap();

    let (status, body) = send(&app.router, webhook(&payload, Some(signature.clone()))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "received": true }));

    let (status, body) = send(&app.router, webhook(&payload, Some(signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duplicate"], true);

    let (_, usage) = send(&app.router, get("/api/v1/usage", user)).await;
    assert_eq!(usage["hasSubscription"], true);
    assert_eq!(usage["planId"], "starter");
    assert_eq!(usage["remaining"], 5);
}

#[tokio::test]
async fn test_unknown_webhook_kind_is_acknowledged() {
    let app = app();
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let payload = json!({
        "id": "evt_route_unknown",
        "type": "customer.created",
        "created": now,
        "data": { "object": { "id": "cus_new" } }
    })
    .to_string();
    let signature = signature_header(WEBHOOK_SECRET, now, &payload).unwrap();

    let (status, body) = send(&app.router, webhook(&payload, Some(signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["received"], true);
}
