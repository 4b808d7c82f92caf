//! Billing records
//!
//! Plain data types shared by the store implementations and the services.

use rewritely_shared::{BillingPeriod, OrderStatus, SubscriptionStatus};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// A purchasable plan. Reference data, never written by the billing core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub daily_quota: i32,
    pub price_cents: i64,
}

impl Plan {
    pub fn new(id: &str, name: &str, daily_quota: i32, price_cents: i64) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            daily_quota,
            price_cents,
        }
    }
}

/// One purchase attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: String,
    pub billing_period: BillingPeriod,
    pub status: OrderStatus,
    /// Opaque token echoed back by the payment flow
    pub correlation_id: String,
    pub payment_link_url: Option<String>,
    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub processor_subscription_id: Option<String>,
    pub processor_customer_id: Option<String>,
    pub seat_count: Option<i32>,
    pub unit_amount_cents: Option<i64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Input for a new pending order
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: Uuid,
    pub plan_id: String,
    pub billing_period: BillingPeriod,
    pub correlation_id: String,
    pub payment_link_url: Option<String>,
    pub seat_count: Option<i32>,
    pub unit_amount_cents: Option<i64>,
}

/// Identifiers the processor assigned while confirming a payment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessorRefs {
    pub checkout_session_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
}

/// Result of promoting an order to `completed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderCompletion {
    /// The order moved from pending to completed
    Completed(Order),
    /// The order was already completed; nothing changed
    AlreadyCompleted(Order),
    NotFound,
}

/// The single subscription row of a user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: String,
    pub billing_period: BillingPeriod,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub processor_subscription_id: Option<String>,
    pub processor_customer_id: Option<String>,
    /// Creation time of the processor event that produced this state
    #[serde(with = "time::serde::rfc3339::option")]
    pub source_event_at: Option<OffsetDateTime>,
}

impl Subscription {
    /// Entitlement is decided at read time
    pub fn is_entitled_at(&self, now: OffsetDateTime) -> bool {
        self.status.is_entitled() && self.current_period_end > now
    }
}

/// Full-row write for the subscription upsert, keyed on `user_id`
#[derive(Debug, Clone)]
pub struct SubscriptionUpsert {
    pub user_id: Uuid,
    pub plan_id: String,
    pub billing_period: BillingPeriod,
    pub status: SubscriptionStatus,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub processor_subscription_id: Option<String>,
    pub processor_customer_id: Option<String>,
    pub source_event_at: Option<OffsetDateTime>,
}

/// An entitled subscription joined with its plan.
///
/// `plan` is `None` when the join could not resolve the plan row.
#[derive(Debug, Clone)]
pub struct EntitlementRecord {
    pub subscription: Subscription,
    pub plan: Option<Plan>,
}

/// A unit that was successfully consumed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedUnit {
    pub plan_id: String,
    pub plan_name: String,
    pub quota: i32,
    /// Counter value after the increment
    pub used: i32,
    pub renews_at: OffsetDateTime,
}

/// Outcome of the atomic consume operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Consumed(ConsumedUnit),
    QuotaExceeded { quota: i32 },
    NoEntitlement,
}

/// Result of trying to claim a webhook event for processing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventClaim {
    Claimed,
    /// Already handled, or owned by another task. Carries the stored status.
    Duplicate(String),
}

/// Final processing status recorded in the webhook ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventResult {
    Success,
    Error,
}

impl EventResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventResult::Success => "success",
            EventResult::Error => "error",
        }
    }
}
