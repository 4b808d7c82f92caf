//! Persistence seam for the billing core
//!
//! Every mutating method is a single atomic operation in the backing store.
//! Services never read a row, decide, and write it back.

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::PgBillingStore;

use async_trait::async_trait;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::BillingResult;
use crate::models::{
    ConsumeOutcome, EntitlementRecord, EventClaim, EventResult, NewOrder, Order,
    OrderCompletion, Plan, ProcessorRefs, Subscription, SubscriptionUpsert,
};

/// Claims stuck in `processing` longer than this may be taken over
pub const PROCESSING_TIMEOUT: Duration = Duration::minutes(30);

#[async_trait]
pub trait BillingStore: Send + Sync {
    // ---- plans ----

    async fn get_plan(&self, plan_id: &str) -> BillingResult<Option<Plan>>;

    /// All plans, cheapest first
    async fn list_plans(&self) -> BillingResult<Vec<Plan>>;

    // ---- orders ----

    async fn insert_order(&self, order: NewOrder) -> BillingResult<Order>;

    async fn find_order_by_id(&self, order_id: Uuid) -> BillingResult<Option<Order>>;

    async fn find_order_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> BillingResult<Option<Order>>;

    /// Most recently completed order carrying this processor subscription id
    async fn find_latest_completed_order_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<Order>>;

    /// Promote a pending order to completed, storing the processor ids.
    /// A completed order is left untouched.
    async fn complete_order(
        &self,
        order_id: Uuid,
        refs: &ProcessorRefs,
        completed_at: OffsetDateTime,
    ) -> BillingResult<OrderCompletion>;

    /// Attach a payment attempt to a pending order and record its seat pricing
    async fn update_order_payment(
        &self,
        order_id: Uuid,
        payment_intent_id: &str,
        seat_count: i32,
        unit_amount_cents: i64,
    ) -> BillingResult<()>;

    // ---- subscriptions ----

    async fn find_subscription_by_user(&self, user_id: Uuid)
        -> BillingResult<Option<Subscription>>;

    async fn find_subscription_by_processor_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<Subscription>>;

    /// Insert-or-update keyed on `user_id`.
    ///
    /// Returns `None` when the stored row was produced by a newer processor
    /// event than `upsert.source_event_at`; the row is then left unchanged.
    async fn upsert_subscription(
        &self,
        upsert: SubscriptionUpsert,
    ) -> BillingResult<Option<Subscription>>;

    // ---- entitlement and usage ----

    /// The user's subscription if it is entitled at `now`, joined with its plan
    async fn find_entitlement(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<EntitlementRecord>>;

    async fn usage_count(&self, user_id: Uuid, day: Date) -> BillingResult<i32>;

    /// Resolve entitlement and increment today's counter in one atomic step.
    /// The counter never goes past the plan quota.
    async fn consume_unit(&self, user_id: Uuid, now: OffsetDateTime)
        -> BillingResult<ConsumeOutcome>;

    /// Delete counters for days strictly before `day`
    async fn prune_usage_before(&self, day: Date) -> BillingResult<u64>;

    // ---- webhook ledger ----

    /// Atomically claim exclusive processing rights for an event id
    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_at: OffsetDateTime,
    ) -> BillingResult<EventClaim>;

    async fn finish_event(
        &self,
        event_id: &str,
        result: EventResult,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    /// Mark claims stuck in `processing` as `error` so a redelivery can retake them
    async fn release_stuck_events(&self, older_than: Duration) -> BillingResult<u64>;
}
