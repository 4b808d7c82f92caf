//! Stripe webhook handling
//!
//! Verifies `Stripe-Signature`, claims the event id in the webhook ledger and
//! dispatches to one handler per event kind. Handlers acknowledge events they
//! cannot correlate (missing ids, unknown orders) and only fail on errors a
//! redelivery could fix.

use std::collections::HashMap;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use rewritely_shared::SubscriptionStatus;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::analytics::{AnalyticsNotifier, PurchaseEvent};
use crate::error::{BillingError, BillingResult};
use crate::models::{EventClaim, EventResult, Order, OrderCompletion, ProcessorRefs};
use crate::orders::OrderService;
use crate::processor::PaymentProcessor;
use crate::store::BillingStore;
use crate::subscriptions::{
    map_processor_status, PeriodUpdate, SubscriptionService, SyncOutcome, SyncRequest,
};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed notification
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Event kinds with a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventType {
    CheckoutSessionCompleted,
    PaymentIntentSucceeded,
    InvoicePaid,
    InvoicePaymentFailed,
    SubscriptionDeleted,
    Unhandled(String),
}

impl From<&str> for WebhookEventType {
    fn from(s: &str) -> Self {
        match s {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "payment_intent.succeeded" => Self::PaymentIntentSucceeded,
            // Older API versions send the second name
            "invoice.paid" | "invoice.payment_succeeded" => Self::InvoicePaid,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            other => Self::Unhandled(other.to_string()),
        }
    }
}

/// Event envelope
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: serde_json::Value,
}

impl WebhookEvent {
    pub fn kind(&self) -> WebhookEventType {
        WebhookEventType::from(self.event_type.as_str())
    }

    /// Event creation time; falls back to now for out-of-range values
    pub fn created_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
    }

    fn object<T: DeserializeOwned>(&self) -> Option<T> {
        match serde_json::from_value(self.data.object.clone()) {
            Ok(object) => Some(object),
            Err(e) => {
                tracing::warn!(
                    event_id = %self.id,
                    event_type = %self.event_type,
                    error = %e,
                    "Malformed event object, acknowledging without processing"
                );
                None
            }
        }
    }
}

/// An id field that may also arrive as an expanded object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExpandableId {
    Id(String),
    Object { id: String },
}

impl ExpandableId {
    fn into_id(self) -> String {
        match self {
            ExpandableId::Id(id) | ExpandableId::Object { id } => id,
        }
    }
}

fn expand(id: Option<ExpandableId>) -> Option<String> {
    id.map(ExpandableId::into_id)
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    id: String,
    #[serde(default)]
    client_reference_id: Option<String>,
    #[serde(default)]
    subscription: Option<ExpandableId>,
    #[serde(default)]
    customer: Option<ExpandableId>,
    #[serde(default)]
    payment_intent: Option<ExpandableId>,
}

#[derive(Debug, Deserialize)]
struct PaymentIntentObject {
    id: String,
    #[serde(default)]
    customer: Option<ExpandableId>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct PeriodObject {
    start: i64,
    end: i64,
}

#[derive(Debug, Default, Deserialize)]
struct InvoiceLines {
    #[serde(default)]
    data: Vec<InvoiceLine>,
}

#[derive(Debug, Deserialize)]
struct InvoiceLine {
    #[serde(default)]
    period: Option<PeriodObject>,
}

#[derive(Debug, Default, Deserialize)]
struct InvoiceParent {
    #[serde(default)]
    subscription_details: Option<InvoiceSubscriptionDetails>,
}

#[derive(Debug, Deserialize)]
struct InvoiceSubscriptionDetails {
    #[serde(default)]
    subscription: Option<ExpandableId>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    subscription: Option<ExpandableId>,
    /// Newer API versions move the subscription here
    #[serde(default)]
    parent: Option<InvoiceParent>,
    #[serde(default)]
    customer: Option<ExpandableId>,
    #[serde(default)]
    period_start: Option<i64>,
    #[serde(default)]
    period_end: Option<i64>,
    #[serde(default)]
    lines: Option<InvoiceLines>,
}

impl InvoiceObject {
    fn subscription_id(&mut self) -> Option<String> {
        expand(self.subscription.take()).or_else(|| {
            self.parent
                .take()
                .and_then(|p| p.subscription_details)
                .and_then(|d| expand(d.subscription))
        })
    }

    /// Billing window: the first line item's period, else the invoice's own
    fn window(&self) -> Option<(OffsetDateTime, OffsetDateTime)> {
        let (start, end) = self
            .lines
            .as_ref()
            .and_then(|l| l.data.first())
            .and_then(|line| line.period.as_ref())
            .map(|p| (p.start, p.end))
            .or(match (self.period_start, self.period_end) {
                (Some(s), Some(e)) => Some((s, e)),
                _ => None,
            })?;

        let start = OffsetDateTime::from_unix_timestamp(start).ok()?;
        let end = OffsetDateTime::from_unix_timestamp(end).ok()?;
        (end > start).then_some((start, end))
    }
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    #[serde(default)]
    customer: Option<ExpandableId>,
    #[serde(default)]
    cancel_at_period_end: Option<bool>,
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
}

/// What happened to a delivered event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Already handled or owned by another task
    Duplicate,
}

/// Build a `Stripe-Signature` header value for `payload`
pub fn signature_header(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("Invalid webhook secret".to_string()))?;
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    Ok(format!(
        "t={},v1={}",
        timestamp,
        hex::encode(mac.finalize().into_bytes())
    ))
}

/// Webhook handler for Stripe events
pub struct WebhookHandler {
    webhook_secret: String,
    store: Arc<dyn BillingStore>,
    processor: Arc<dyn PaymentProcessor>,
    orders: Arc<OrderService>,
    subscriptions: Arc<SubscriptionService>,
    analytics: AnalyticsNotifier,
    currency: String,
}

impl WebhookHandler {
    pub fn new(
        webhook_secret: String,
        store: Arc<dyn BillingStore>,
        processor: Arc<dyn PaymentProcessor>,
        orders: Arc<OrderService>,
        subscriptions: Arc<SubscriptionService>,
        analytics: AnalyticsNotifier,
        currency: String,
    ) -> Self {
        Self {
            webhook_secret,
            store,
            processor,
            orders,
            subscriptions,
            analytics,
            currency,
        }
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Verify the signature header and parse the event
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        self.verify_event_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    pub fn verify_event_at(
        &self,
        payload: &str,
        signature: &str,
        now: i64,
    ) -> BillingResult<WebhookEvent> {
        // t=timestamp,v1=signature[,v1=signature...]
        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<Vec<u8>> = Vec::new();

        for part in signature.split(',') {
            let Some((key, value)) = part.trim().split_once('=') else {
                continue;
            };
            match key {
                "t" => timestamp = value.parse().ok(),
                "v1" => {
                    if let Ok(bytes) = hex::decode(value) {
                        candidates.push(bytes);
                    }
                }
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let mut mac = HmacSha256::new_from_slice(self.webhook_secret.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        let computed = mac.finalize().into_bytes();

        let matched = candidates
            .iter()
            .any(|candidate| bool::from(computed.as_slice().ct_eq(candidate.as_slice())));
        if !matched {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        serde_json::from_str(payload).map_err(|e| {
            tracing::warn!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookPayloadInvalid(e.to_string())
        })
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Handle a verified event.
    ///
    /// The event id is claimed in the ledger first, so exact redeliveries and
    /// concurrent deliveries run the business logic once. Only transient
    /// failures are returned; the caller answers them with a non-2xx so the
    /// processor redelivers.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        let event_at = event.created_at();

        match self
            .store
            .claim_event(&event.id, &event.event_type, event_at)
            .await?
        {
            EventClaim::Claimed => {}
            EventClaim::Duplicate(status) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    status = %status,
                    "Duplicate webhook event, skipping"
                );
                return Ok(WebhookOutcome::Duplicate);
            }
        }

        tracing::info!(
            event_id = %event.id,
            event_type = %event.event_type,
            "Processing Stripe webhook event"
        );

        let result = self.dispatch(&event).await;

        let (status, error_message) = match &result {
            Ok(()) => (EventResult::Success, None),
            Err(e) => (EventResult::Error, Some(e.to_string())),
        };
        self.record_result(&event, status, error_message.as_deref())
            .await;

        match result {
            Ok(()) => Ok(WebhookOutcome::Processed),
            Err(e) if e.is_transient() => Err(e),
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    "Webhook handler failed, acknowledging"
                );
                Ok(WebhookOutcome::Processed)
            }
        }
    }

    /// Store the final ledger status, retrying once
    async fn record_result(&self, event: &WebhookEvent, status: EventResult, message: Option<&str>) {
        let Err(first) = self.store.finish_event(&event.id, status, message).await else {
            return;
        };

        tracing::warn!(
            event_id = %event.id,
            error = %first,
            "First attempt to update webhook event failed, retrying"
        );

        if let Err(retry) = self.store.finish_event(&event.id, status, message).await {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                processing_result = status.as_str(),
                first_error = %first,
                retry_error = %retry,
                "CRITICAL: Failed to update webhook ledger after retry. \
                 Event stays in 'processing' until the stuck-claim sweep releases it."
            );
        }
    }

    async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<()> {
        match event.kind() {
            WebhookEventType::CheckoutSessionCompleted => self.handle_checkout_completed(event).await,
            WebhookEventType::PaymentIntentSucceeded => self.handle_payment_succeeded(event).await,
            WebhookEventType::InvoicePaid => self.handle_invoice_paid(event).await,
            WebhookEventType::InvoicePaymentFailed => self.handle_invoice_payment_failed(event).await,
            WebhookEventType::SubscriptionDeleted => self.handle_subscription_deleted(event).await,
            WebhookEventType::Unhandled(kind) => {
                tracing::info!(
                    event_type = %kind,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(())
            }
        }
    }

    // =========================================================================
    // Handlers
    // =========================================================================

    async fn handle_checkout_completed(&self, event: &WebhookEvent) -> BillingResult<()> {
        let Some(session) = event.object::<CheckoutSessionObject>() else {
            return Ok(());
        };
        let event_at = event.created_at();

        let Some(correlation_id) = session.client_reference_id.clone() else {
            tracing::warn!(
                event_id = %event.id,
                session_id = %session.id,
                "checkout.session.completed without client_reference_id"
            );
            return Ok(());
        };

        let Some(order) = self.orders.find_by_correlation_id(&correlation_id).await? else {
            tracing::warn!(
                event_id = %event.id,
                client_reference_id = %correlation_id,
                "No order for client_reference_id, ignoring"
            );
            return Ok(());
        };

        let refs = ProcessorRefs {
            checkout_session_id: Some(session.id.clone()),
            payment_intent_id: expand(session.payment_intent),
            subscription_id: expand(session.subscription),
            customer_id: expand(session.customer),
        };

        let (order, newly_completed) =
            match self.orders.complete_order(order.id, &refs, event_at).await? {
                OrderCompletion::Completed(order) => (order, true),
                OrderCompletion::AlreadyCompleted(order) => (order, false),
                OrderCompletion::NotFound => return Ok(()),
            };

        // Authoritative state from the processor, when there is a contract
        let mut status = SubscriptionStatus::Active;
        let mut period = PeriodUpdate::Set {
            start: event_at,
            end: None,
        };
        let mut cancel_at_period_end = Some(false);
        let mut customer_id = refs.customer_id.clone();

        if let Some(sub_id) = refs.subscription_id.as_deref() {
            match self.processor.fetch_subscription(sub_id).await {
                Ok(live) => {
                    status = map_processor_status(&live.status);
                    period = PeriodUpdate::Set {
                        start: live.current_period_start.unwrap_or(event_at),
                        end: live.current_period_end,
                    };
                    cancel_at_period_end = Some(live.cancel_at_period_end);
                    customer_id = live.customer_id.or(customer_id);
                }
                Err(e) => {
                    tracing::warn!(
                        event_id = %event.id,
                        subscription_id = %sub_id,
                        error = %e,
                        "Could not fetch subscription detail, using order defaults"
                    );
                }
            }
        }

        let request = SyncRequest {
            user_id: order.user_id,
            plan_id: order.plan_id.clone(),
            billing_period: order.billing_period,
            processor_subscription_id: refs.subscription_id.clone(),
            processor_customer_id: customer_id,
            status,
            period,
            cancel_at_period_end,
            event_at: Some(event_at),
        };

        let outcome = self.sync_after_completion(event, &order, request).await?;

        if newly_completed && outcome != SyncOutcome::Stale {
            let value_cents = match self.store.get_plan(&order.plan_id).await {
                Ok(plan) => plan.map(|p| p.price_cents).unwrap_or_default(),
                Err(_) => 0,
            };
            self.notify_purchase(&order, value_cents).await;
        }

        Ok(())
    }

    async fn handle_payment_succeeded(&self, event: &WebhookEvent) -> BillingResult<()> {
        let Some(intent) = event.object::<PaymentIntentObject>() else {
            return Ok(());
        };
        let event_at = event.created_at();

        // Only seat payments carry an order id; other intents are not ours
        let Some(raw_order_id) = intent.metadata.get("order_id") else {
            tracing::debug!(
                event_id = %event.id,
                payment_intent_id = %intent.id,
                "payment_intent.succeeded without order_id metadata, ignoring"
            );
            return Ok(());
        };

        let Ok(order_id) = Uuid::parse_str(raw_order_id) else {
            tracing::warn!(
                event_id = %event.id,
                order_id = %raw_order_id,
                "Invalid order_id in payment metadata"
            );
            return Ok(());
        };

        let refs = ProcessorRefs {
            payment_intent_id: Some(intent.id.clone()),
            customer_id: expand(intent.customer),
            ..Default::default()
        };

        let (order, newly_completed) =
            match self.orders.complete_order(order_id, &refs, event_at).await? {
                OrderCompletion::Completed(order) => (order, true),
                OrderCompletion::AlreadyCompleted(order) => (order, false),
                OrderCompletion::NotFound => return Ok(()),
            };

        let request = SyncRequest {
            user_id: order.user_id,
            plan_id: order.plan_id.clone(),
            billing_period: order.billing_period,
            processor_subscription_id: None,
            processor_customer_id: refs.customer_id.clone(),
            status: SubscriptionStatus::Active,
            period: PeriodUpdate::Set {
                start: event_at,
                end: None,
            },
            cancel_at_period_end: Some(false),
            event_at: Some(event_at),
        };

        let outcome = self.sync_after_completion(event, &order, request).await?;

        if newly_completed && outcome != SyncOutcome::Stale {
            let seats = i64::from(order.seat_count.unwrap_or(1));
            let value_cents = order.unit_amount_cents.unwrap_or_default() * seats;
            self.notify_purchase(&order, value_cents).await;
        }

        Ok(())
    }

    async fn handle_invoice_paid(&self, event: &WebhookEvent) -> BillingResult<()> {
        let Some(mut invoice) = event.object::<InvoiceObject>() else {
            return Ok(());
        };
        let event_at = event.created_at();

        let Some(sub_id) = invoice.subscription_id() else {
            tracing::debug!(
                event_id = %event.id,
                invoice_id = ?invoice.id,
                "Invoice without subscription, ignoring"
            );
            return Ok(());
        };

        let Some(target) = self.locate(&sub_id, event).await? else {
            return Ok(());
        };

        let period = match invoice.window() {
            Some((start, end)) => PeriodUpdate::Set {
                start,
                end: Some(end),
            },
            None => PeriodUpdate::Set {
                start: event_at,
                end: None,
            },
        };

        self.subscriptions
            .sync(SyncRequest {
                user_id: target.user_id,
                plan_id: target.plan_id,
                billing_period: target.billing_period,
                processor_subscription_id: Some(sub_id),
                processor_customer_id: expand(invoice.customer.take()),
                status: SubscriptionStatus::Active,
                period,
                cancel_at_period_end: None,
                event_at: Some(event_at),
            })
            .await?;

        Ok(())
    }

    async fn handle_invoice_payment_failed(&self, event: &WebhookEvent) -> BillingResult<()> {
        let Some(mut invoice) = event.object::<InvoiceObject>() else {
            return Ok(());
        };
        let event_at = event.created_at();

        let Some(sub_id) = invoice.subscription_id() else {
            tracing::debug!(event_id = %event.id, "Failed invoice without subscription, ignoring");
            return Ok(());
        };

        let Some(target) = self.locate(&sub_id, event).await? else {
            return Ok(());
        };

        tracing::warn!(
            user_id = %target.user_id,
            subscription_id = %sub_id,
            "Invoice payment failed, marking subscription past due"
        );

        self.subscriptions
            .sync(SyncRequest {
                user_id: target.user_id,
                plan_id: target.plan_id,
                billing_period: target.billing_period,
                processor_subscription_id: Some(sub_id),
                processor_customer_id: expand(invoice.customer.take()),
                status: SubscriptionStatus::PastDue,
                period: PeriodUpdate::Keep {
                    fallback_start: event_at,
                },
                cancel_at_period_end: None,
                event_at: Some(event_at),
            })
            .await?;

        Ok(())
    }

    async fn handle_subscription_deleted(&self, event: &WebhookEvent) -> BillingResult<()> {
        let Some(subscription) = event.object::<SubscriptionObject>() else {
            return Ok(());
        };
        let event_at = event.created_at();

        let Some(target) = self.locate(&subscription.id, event).await? else {
            return Ok(());
        };

        let window = subscription
            .current_period_start
            .zip(subscription.current_period_end)
            .and_then(|(s, e)| {
                Some((
                    OffsetDateTime::from_unix_timestamp(s).ok()?,
                    OffsetDateTime::from_unix_timestamp(e).ok()?,
                ))
            });
        let period = match window {
            Some((start, end)) => PeriodUpdate::Set {
                start,
                end: Some(end),
            },
            None => PeriodUpdate::Keep {
                fallback_start: event_at,
            },
        };

        self.subscriptions
            .sync(SyncRequest {
                user_id: target.user_id,
                plan_id: target.plan_id,
                billing_period: target.billing_period,
                processor_subscription_id: Some(subscription.id.clone()),
                processor_customer_id: expand(subscription.customer),
                status: SubscriptionStatus::Canceled,
                period,
                cancel_at_period_end: Some(subscription.cancel_at_period_end.unwrap_or(true)),
                event_at: Some(event_at),
            })
            .await?;

        tracing::info!(
            user_id = %target.user_id,
            subscription_id = %subscription.id,
            "Subscription canceled"
        );

        Ok(())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Owner, plan and period behind a processor subscription id: the
    /// newest completed order, else the synced subscription row
    async fn locate(
        &self,
        subscription_id: &str,
        event: &WebhookEvent,
    ) -> BillingResult<Option<SyncTarget>> {
        if let Some(order) = self
            .orders
            .find_latest_completed_by_processor_subscription_id(subscription_id)
            .await?
        {
            return Ok(Some(SyncTarget {
                user_id: order.user_id,
                plan_id: order.plan_id,
                billing_period: order.billing_period,
            }));
        }

        if let Some(sub) = self.subscriptions.find_by_processor_id(subscription_id).await? {
            return Ok(Some(SyncTarget {
                user_id: sub.user_id,
                plan_id: sub.plan_id,
                billing_period: sub.billing_period,
            }));
        }

        tracing::warn!(
            event_id = %event.id,
            event_type = %event.event_type,
            subscription_id = %subscription_id,
            "No order or subscription for processor subscription id, ignoring"
        );
        Ok(None)
    }

    /// Sync after an order was completed. The payment is already captured,
    /// so a failure here is logged for reconciliation and never rolled back.
    async fn sync_after_completion(
        &self,
        event: &WebhookEvent,
        order: &Order,
        request: SyncRequest,
    ) -> BillingResult<SyncOutcome> {
        match self.subscriptions.sync(request).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    order_id = %order.id,
                    user_id = %order.user_id,
                    plan_id = %order.plan_id,
                    error = %e,
                    "RECONCILIATION NEEDED: order completed but subscription sync failed"
                );
                Err(e)
            }
        }
    }

    async fn notify_purchase(&self, order: &Order, value_cents: i64) {
        self.analytics
            .purchase(&PurchaseEvent {
                user_id: order.user_id,
                order_id: order.id,
                plan_id: order.plan_id.clone(),
                billing_period: order.billing_period.to_string(),
                value_cents,
                currency: self.currency.clone(),
            })
            .await;
    }
}

struct SyncTarget {
    user_id: Uuid,
    plan_id: String,
    billing_period: rewritely_shared::BillingPeriod,
}
