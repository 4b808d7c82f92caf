//! Payment processor seam
//!
//! The billing services only talk to the processor through
//! [`PaymentProcessor`]. [`crate::client::StripeClient`] is the production
//! implementation; [`InMemoryProcessor`] backs the tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::{BillingError, BillingResult};

/// Subscription status as reported by the processor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessorStatus {
    Active,
    Trialing,
    PastDue,
    Unpaid,
    Canceled,
    Incomplete,
    IncompleteExpired,
    Paused,
    Other(String),
}

impl From<&str> for ProcessorStatus {
    fn from(s: &str) -> Self {
        match s {
            "active" => ProcessorStatus::Active,
            "trialing" => ProcessorStatus::Trialing,
            "past_due" => ProcessorStatus::PastDue,
            "unpaid" => ProcessorStatus::Unpaid,
            "canceled" => ProcessorStatus::Canceled,
            "incomplete" => ProcessorStatus::Incomplete,
            "incomplete_expired" => ProcessorStatus::IncompleteExpired,
            "paused" => ProcessorStatus::Paused,
            other => ProcessorStatus::Other(other.to_string()),
        }
    }
}

/// The processor's view of a recurring contract
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorSubscription {
    pub id: String,
    pub customer_id: Option<String>,
    pub status: ProcessorStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

/// A one-shot payment attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentInfo {
    pub id: String,
    pub status: String,
    pub client_secret: Option<String>,
}

impl PaymentIntentInfo {
    /// Only an attempt still waiting for a payment method may be amended
    pub fn accepts_new_payment_method(&self) -> bool {
        self.status == "requires_payment_method"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentRequest {
    pub amount_cents: i64,
    pub currency: String,
    pub receipt_email: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn fetch_subscription(&self, subscription_id: &str)
        -> BillingResult<ProcessorSubscription>;

    async fn retrieve_payment_intent(&self, payment_intent_id: &str)
        -> BillingResult<PaymentIntentInfo>;

    async fn create_payment_intent(
        &self,
        request: PaymentIntentRequest,
    ) -> BillingResult<PaymentIntentInfo>;

    async fn update_payment_intent(
        &self,
        payment_intent_id: &str,
        request: PaymentIntentRequest,
    ) -> BillingResult<PaymentIntentInfo>;
}

#[derive(Default)]
struct FakeState {
    subscriptions: HashMap<String, ProcessorSubscription>,
    intents: HashMap<String, (PaymentIntentInfo, PaymentIntentRequest)>,
    next_intent: u32,
    fail_subscription_fetch: bool,
}

/// Scriptable processor for tests and local runs
#[derive(Clone, Default)]
pub struct InMemoryProcessor {
    state: Arc<Mutex<FakeState>>,
}

impl InMemoryProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_subscription(&self, subscription: ProcessorSubscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.id.clone(), subscription);
    }

    /// Make every `fetch_subscription` call fail like an outage
    pub async fn fail_subscription_fetch(&self, fail: bool) {
        self.state.lock().await.fail_subscription_fetch = fail;
    }

    pub async fn set_intent_status(&self, payment_intent_id: &str, status: &str) {
        if let Some((info, _)) = self.state.lock().await.intents.get_mut(payment_intent_id) {
            info.status = status.to_string();
        }
    }

    /// Last request that created or amended an intent
    pub async fn intent_request(&self, payment_intent_id: &str) -> Option<PaymentIntentRequest> {
        self.state
            .lock()
            .await
            .intents
            .get(payment_intent_id)
            .map(|(_, req)| req.clone())
    }

    pub async fn intent_count(&self) -> usize {
        self.state.lock().await.intents.len()
    }
}

#[async_trait]
impl PaymentProcessor for InMemoryProcessor {
    async fn fetch_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProcessorSubscription> {
        let state = self.state.lock().await;
        if state.fail_subscription_fetch {
            return Err(BillingError::Timeout("subscription lookup".to_string()));
        }
        state
            .subscriptions
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<PaymentIntentInfo> {
        self.state
            .lock()
            .await
            .intents
            .get(payment_intent_id)
            .map(|(info, _)| info.clone())
            .ok_or_else(|| BillingError::NotFound(format!("payment intent {}", payment_intent_id)))
    }

    async fn create_payment_intent(
        &self,
        request: PaymentIntentRequest,
    ) -> BillingResult<PaymentIntentInfo> {
        let mut state = self.state.lock().await;
        state.next_intent += 1;
        let id = format!("pi_test_{}", state.next_intent);
        let info = PaymentIntentInfo {
            id: id.clone(),
            status: "requires_payment_method".to_string(),
            client_secret: Some(format!("{}_secret", id)),
        };
        state.intents.insert(id, (info.clone(), request));
        Ok(info)
    }

    async fn update_payment_intent(
        &self,
        payment_intent_id: &str,
        request: PaymentIntentRequest,
    ) -> BillingResult<PaymentIntentInfo> {
        let mut state = self.state.lock().await;
        let entry = state
            .intents
            .get_mut(payment_intent_id)
            .ok_or_else(|| BillingError::NotFound(format!("payment intent {}", payment_intent_id)))?;
        entry.1 = request;
        Ok(entry.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processor_status_parsing() {
        assert_eq!(ProcessorStatus::from("past_due"), ProcessorStatus::PastDue);
        assert_eq!(
            ProcessorStatus::from("incomplete_expired"),
            ProcessorStatus::IncompleteExpired
        );
        assert_eq!(
            ProcessorStatus::from("something_new"),
            ProcessorStatus::Other("something_new".into())
        );
    }

    #[test]
    fn test_only_unpaid_intents_accept_new_method() {
        let mut intent = PaymentIntentInfo {
            id: "pi_1".into(),
            status: "requires_payment_method".into(),
            client_secret: None,
        };
        assert!(intent.accepts_new_payment_method());

        intent.status = "succeeded".into();
        assert!(!intent.accepts_new_payment_method());
    }
}
