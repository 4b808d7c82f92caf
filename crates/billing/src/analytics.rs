//! Server-side purchase analytics
//!
//! Sends a GA4 measurement-protocol `purchase` event once a subscription has
//! been synced. Delivery is best effort; failures are logged and never reach
//! the webhook response.

use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

const GA_ENDPOINT: &str = "https://www.google-analytics.com/mp/collect";
const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct AnalyticsConfig {
    pub measurement_id: String,
    pub api_secret: String,
    pub endpoint: String,
}

impl AnalyticsConfig {
    /// `None` unless both GA variables are set
    pub fn from_env() -> Option<Self> {
        let measurement_id = std::env::var("GA_MEASUREMENT_ID").ok()?;
        let api_secret = std::env::var("GA4_API_SECRET").ok()?;
        if measurement_id.is_empty() || api_secret.is_empty() {
            return None;
        }
        Some(Self {
            measurement_id,
            api_secret,
            endpoint: GA_ENDPOINT.to_string(),
        })
    }
}

/// A completed purchase
#[derive(Debug, Clone, PartialEq)]
pub struct PurchaseEvent {
    pub user_id: Uuid,
    pub order_id: Uuid,
    pub plan_id: String,
    pub billing_period: String,
    pub value_cents: i64,
    pub currency: String,
}

#[derive(Serialize)]
struct CollectBody {
    client_id: String,
    user_id: String,
    events: Vec<Value>,
}

impl PurchaseEvent {
    fn body(&self) -> CollectBody {
        CollectBody {
            client_id: self.user_id.to_string(),
            user_id: self.user_id.to_string(),
            events: vec![json!({
                "name": "purchase",
                "params": {
                    "transaction_id": self.order_id.to_string(),
                    "value": self.value_cents as f64 / 100.0,
                    "currency": self.currency.to_uppercase(),
                    "plan_id": self.plan_id,
                    "billing_period": self.billing_period,
                    "items": [{ "item_id": self.plan_id, "quantity": 1 }],
                }
            })],
        }
    }
}

#[derive(Clone)]
pub struct AnalyticsNotifier {
    client: reqwest::Client,
    config: Option<AnalyticsConfig>,
}

impl AnalyticsNotifier {
    pub fn new(config: Option<AnalyticsConfig>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn from_env() -> Self {
        let config = AnalyticsConfig::from_env();
        if config.is_none() {
            tracing::info!("GA4 credentials not set, purchase analytics disabled");
        }
        Self::new(config)
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    /// Send the event, retrying with backoff. Never fails the caller.
    pub async fn purchase(&self, event: &PurchaseEvent) {
        let Some(config) = &self.config else {
            return;
        };

        let body = event.body();
        let strategy = ExponentialBackoff::from_millis(200)
            .map(jitter)
            .take(MAX_ATTEMPTS - 1);

        let result = Retry::spawn(strategy, || async {
            let response = self
                .client
                .post(&config.endpoint)
                .query(&[
                    ("measurement_id", config.measurement_id.as_str()),
                    ("api_secret", config.api_secret.as_str()),
                ])
                .json(&body)
                .send()
                .await?;
            response.error_for_status().map(|_| ())
        })
        .await;

        match result {
            Ok(()) => tracing::debug!(order_id = %event.order_id, "Purchase analytics sent"),
            Err(e) => tracing::warn!(
                order_id = %event.order_id,
                error = %e,
                "Failed to send purchase analytics"
            ),
        }
    }
}
