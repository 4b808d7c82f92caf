//! In-memory billing store
//!
//! Used by the test suites and for running the API without a database.
//! A single lock guards all state, so each trait method is atomic in the
//! same way the Postgres statements are.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::{Date, Duration, OffsetDateTime};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{BillingStore, PROCESSING_TIMEOUT};
use crate::error::BillingResult;
use crate::models::{
    ConsumeOutcome, ConsumedUnit, EntitlementRecord, EventClaim, EventResult, NewOrder, Order,
    OrderCompletion, Plan, ProcessorRefs, Subscription, SubscriptionUpsert,
};
use rewritely_shared::OrderStatus;

#[derive(Debug, Clone)]
struct LedgerEntry {
    event_type: String,
    result: String,
    started_at: OffsetDateTime,
    error_message: Option<String>,
}

#[derive(Default)]
struct State {
    plans: HashMap<String, Plan>,
    orders: HashMap<Uuid, Order>,
    subscriptions: HashMap<Uuid, Subscription>,
    usage: HashMap<(Uuid, Date), i32>,
    events: HashMap<String, LedgerEntry>,
    plan_join_unavailable: bool,
}

impl State {
    fn entitled(&self, user_id: Uuid, now: OffsetDateTime) -> Option<&Subscription> {
        self.subscriptions
            .get(&user_id)
            .filter(|sub| sub.is_entitled_at(now))
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBillingStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with the three catalog plans
    pub fn with_default_plans() -> Self {
        let mut state = State::default();
        for plan in [
            Plan::new("starter", "Starter", 5, 9900),
            Plan::new("professional", "Professional", 20, 24900),
            Plan::new("team", "Team", 60, 59900),
        ] {
            state.plans.insert(plan.id.clone(), plan);
        }
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub async fn insert_plan(&self, plan: Plan) {
        self.state.lock().await.plans.insert(plan.id.clone(), plan);
    }

    /// Make `find_entitlement` return subscriptions without their plan,
    /// as if the join failed to resolve
    pub async fn set_plan_join_unavailable(&self, unavailable: bool) {
        self.state.lock().await.plan_join_unavailable = unavailable;
    }

    /// Write a subscription row directly, bypassing the stale-event guard
    pub async fn put_subscription(&self, subscription: Subscription) {
        self.state
            .lock()
            .await
            .subscriptions
            .insert(subscription.user_id, subscription);
    }

    pub async fn set_usage(&self, user_id: Uuid, day: Date, count: i32) {
        self.state.lock().await.usage.insert((user_id, day), count);
    }

    pub async fn event_result(&self, event_id: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .events
            .get(event_id)
            .map(|e| e.result.clone())
    }

    pub async fn event_count(&self) -> usize {
        self.state.lock().await.events.len()
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    /// Move a ledger claim's start time, to simulate a crashed handler
    pub async fn backdate_event(&self, event_id: &str, by: Duration) {
        if let Some(entry) = self.state.lock().await.events.get_mut(event_id) {
            entry.started_at -= by;
        }
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn get_plan(&self, plan_id: &str) -> BillingResult<Option<Plan>> {
        Ok(self.state.lock().await.plans.get(plan_id).cloned())
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let mut plans: Vec<Plan> = self.state.lock().await.plans.values().cloned().collect();
        plans.sort_by_key(|p| p.price_cents);
        Ok(plans)
    }

    async fn insert_order(&self, order: NewOrder) -> BillingResult<Order> {
        let mut state = self.state.lock().await;
        let order = Order {
            id: Uuid::new_v4(),
            user_id: order.user_id,
            plan_id: order.plan_id,
            billing_period: order.billing_period,
            status: OrderStatus::Pending,
            correlation_id: order.correlation_id,
            payment_link_url: order.payment_link_url,
            checkout_session_id: None,
            payment_intent_id: None,
            processor_subscription_id: None,
            processor_customer_id: None,
            seat_count: order.seat_count,
            unit_amount_cents: order.unit_amount_cents,
            completed_at: None,
            created_at: OffsetDateTime::now_utc(),
        };
        state.orders.insert(order.id, order.clone());
        Ok(order)
    }

    async fn find_order_by_id(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&order_id).cloned())
    }

    async fn find_order_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> BillingResult<Option<Order>> {
        Ok(self
            .state
            .lock()
            .await
            .orders
            .values()
            .find(|o| o.correlation_id == correlation_id)
            .cloned())
    }

    async fn find_latest_completed_order_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<Order>> {
        Ok(self
            .state
            .lock()
            .await
            .orders
            .values()
            .filter(|o| {
                o.status == OrderStatus::Completed
                    && o.processor_subscription_id.as_deref() == Some(subscription_id)
            })
            .max_by_key(|o| (o.completed_at, o.created_at))
            .cloned())
    }

    async fn complete_order(
        &self,
        order_id: Uuid,
        refs: &ProcessorRefs,
        completed_at: OffsetDateTime,
    ) -> BillingResult<OrderCompletion> {
        let mut state = self.state.lock().await;
        let Some(order) = state.orders.get_mut(&order_id) else {
            return Ok(OrderCompletion::NotFound);
        };

        if order.status == OrderStatus::Completed {
            return Ok(OrderCompletion::AlreadyCompleted(order.clone()));
        }

        order.status = OrderStatus::Completed;
        order.completed_at = Some(completed_at);
        if refs.checkout_session_id.is_some() {
            order.checkout_session_id = refs.checkout_session_id.clone();
        }
        if refs.payment_intent_id.is_some() {
            order.payment_intent_id = refs.payment_intent_id.clone();
        }
        if refs.subscription_id.is_some() {
            order.processor_subscription_id = refs.subscription_id.clone();
        }
        if refs.customer_id.is_some() {
            order.processor_customer_id = refs.customer_id.clone();
        }
        Ok(OrderCompletion::Completed(order.clone()))
    }

    async fn update_order_payment(
        &self,
        order_id: Uuid,
        payment_intent_id: &str,
        seat_count: i32,
        unit_amount_cents: i64,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        if let Some(order) = state.orders.get_mut(&order_id) {
            if order.status == OrderStatus::Pending {
                order.payment_intent_id = Some(payment_intent_id.to_string());
                order.seat_count = Some(seat_count);
                order.unit_amount_cents = Some(unit_amount_cents);
            }
        }
        Ok(())
    }

    async fn find_subscription_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self.state.lock().await.subscriptions.get(&user_id).cloned())
    }

    async fn find_subscription_by_processor_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        Ok(self
            .state
            .lock()
            .await
            .subscriptions
            .values()
            .find(|s| s.processor_subscription_id.as_deref() == Some(subscription_id))
            .cloned())
    }

    async fn upsert_subscription(
        &self,
        upsert: SubscriptionUpsert,
    ) -> BillingResult<Option<Subscription>> {
        let mut state = self.state.lock().await;

        let id = match state.subscriptions.get(&upsert.user_id) {
            Some(existing) => {
                if let (Some(stored), Some(incoming)) =
                    (existing.source_event_at, upsert.source_event_at)
                {
                    if incoming < stored {
                        return Ok(None);
                    }
                }
                existing.id
            }
            None => Uuid::new_v4(),
        };

        let row = Subscription {
            id,
            user_id: upsert.user_id,
            plan_id: upsert.plan_id,
            billing_period: upsert.billing_period,
            status: upsert.status,
            current_period_start: upsert.current_period_start,
            current_period_end: upsert.current_period_end,
            cancel_at_period_end: upsert.cancel_at_period_end,
            processor_subscription_id: upsert.processor_subscription_id,
            processor_customer_id: upsert.processor_customer_id,
            source_event_at: upsert.source_event_at,
        };
        state.subscriptions.insert(row.user_id, row.clone());
        Ok(Some(row))
    }

    async fn find_entitlement(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<EntitlementRecord>> {
        let state = self.state.lock().await;
        let Some(subscription) = state.entitled(user_id, now) else {
            return Ok(None);
        };

        let plan = if state.plan_join_unavailable {
            None
        } else {
            state.plans.get(&subscription.plan_id).cloned()
        };

        Ok(Some(EntitlementRecord {
            subscription: subscription.clone(),
            plan,
        }))
    }

    async fn usage_count(&self, user_id: Uuid, day: Date) -> BillingResult<i32> {
        Ok(self
            .state
            .lock()
            .await
            .usage
            .get(&(user_id, day))
            .copied()
            .unwrap_or(0))
    }

    async fn consume_unit(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<ConsumeOutcome> {
        // Lock held across the check and the increment
        let mut state = self.state.lock().await;

        let Some(subscription) = state.entitled(user_id, now) else {
            return Ok(ConsumeOutcome::NoEntitlement);
        };
        let Some(plan) = state.plans.get(&subscription.plan_id) else {
            return Ok(ConsumeOutcome::NoEntitlement);
        };
        if plan.daily_quota <= 0 {
            return Ok(ConsumeOutcome::NoEntitlement);
        }

        let quota = plan.daily_quota;
        let plan_id = plan.id.clone();
        let plan_name = plan.name.clone();
        let renews_at = subscription.current_period_end;

        let counter = state.usage.entry((user_id, now.date())).or_insert(0);
        if *counter >= quota {
            return Ok(ConsumeOutcome::QuotaExceeded { quota });
        }
        *counter += 1;

        Ok(ConsumeOutcome::Consumed(ConsumedUnit {
            plan_id,
            plan_name,
            quota,
            used: *counter,
            renews_at,
        }))
    }

    async fn prune_usage_before(&self, day: Date) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let before = state.usage.len();
        state.usage.retain(|(_, d), _| *d >= day);
        Ok((before - state.usage.len()) as u64)
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        _event_at: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();

        if let Some(entry) = state.events.get_mut(event_id) {
            let stuck = entry.result == "processing" && entry.started_at < now - PROCESSING_TIMEOUT;
            if entry.result == "error" || stuck {
                entry.error_message = Some(format!("Reclaimed from {}", entry.result));
                entry.result = "processing".to_string();
                entry.started_at = now;
                return Ok(EventClaim::Claimed);
            }
            return Ok(EventClaim::Duplicate(entry.result.clone()));
        }

        state.events.insert(
            event_id.to_string(),
            LedgerEntry {
                event_type: event_type.to_string(),
                result: "processing".to_string(),
                started_at: now,
                error_message: None,
            },
        );
        Ok(EventClaim::Claimed)
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: EventResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        if let Some(entry) = self.state.lock().await.events.get_mut(event_id) {
            entry.result = result.as_str().to_string();
            entry.error_message = error_message.map(str::to_string);
        }
        Ok(())
    }

    async fn release_stuck_events(&self, older_than: Duration) -> BillingResult<u64> {
        let mut state = self.state.lock().await;
        let cutoff = OffsetDateTime::now_utc() - older_than;
        let mut released = 0;
        for entry in state.events.values_mut() {
            if entry.result == "processing" && entry.started_at < cutoff {
                entry.result = "error".to_string();
                entry.error_message = Some(format!("Released stuck {} claim", entry.event_type));
                released += 1;
            }
        }
        Ok(released)
    }
}
