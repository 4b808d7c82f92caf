// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::result_large_err)] // BillingError carries owned context strings
#![allow(clippy::too_many_arguments)] // Service constructors wire several collaborators
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Rewritely Billing Module
//!
//! Billing reconciliation and the daily quota ledger.
//!
//! ## Features
//!
//! - **Webhooks**: Verify Stripe notifications, dedupe them in a ledger and
//!   turn them into orders and subscriptions
//! - **Orders**: Payment-link checkout and seat-based team payments
//! - **Subscriptions**: One canonical subscription row per user
//! - **Quota**: Atomic per-day consumption of rewrite units
//! - **Usage**: Read-only entitlement snapshot for clients
//! - **Analytics**: Best-effort purchase events

pub mod analytics;
pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod orders;
pub mod processor;
pub mod quota;
pub mod store;
pub mod subscriptions;
pub mod usage;
pub mod webhooks;


// Analytics
pub use analytics::{AnalyticsConfig, AnalyticsNotifier, PurchaseEvent};

// Client
pub use client::{StripeClient, StripeConfig};

// Config
pub use config::{BillingConfig, CheckoutCatalog, TeamPricing};

// Error
pub use error::{BillingError, BillingResult};

// Models
pub use models::{Order, Plan, ProcessorRefs, Subscription};

// Orders
pub use orders::{CheckoutResponse, OrderService, TeamPaymentRequest, TeamPaymentResponse};

// Processor
pub use processor::{
    InMemoryProcessor, PaymentIntentInfo, PaymentProcessor, ProcessorStatus,
    ProcessorSubscription,
};

// Quota
pub use quota::{ConsumeResult, QuotaLedger};

// Store
pub use store::{BillingStore, InMemoryBillingStore, PgBillingStore, PROCESSING_TIMEOUT};

// Subscriptions
pub use subscriptions::{PeriodUpdate, SubscriptionService, SyncOutcome, SyncRequest};

// Usage
pub use usage::{UsageSummary, UsageSummaryService};

// Webhooks
pub use webhooks::{signature_header, WebhookEvent, WebhookHandler, WebhookOutcome};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub orders: Arc<OrderService>,
    pub subscriptions: Arc<SubscriptionService>,
    pub quota: QuotaLedger,
    pub usage: UsageSummaryService,
    pub webhooks: WebhookHandler,
    store: Arc<dyn BillingStore>,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let config = BillingConfig::from_env()?;
        let stripe = StripeClient::from_env()?;

        Ok(Self::new(
            config,
            Arc::new(PgBillingStore::new(pool)),
            Arc::new(stripe),
            AnalyticsNotifier::from_env(),
        ))
    }

    /// Create a new billing service with explicit collaborators
    pub fn new(
        config: BillingConfig,
        store: Arc<dyn BillingStore>,
        processor: Arc<dyn PaymentProcessor>,
        analytics: AnalyticsNotifier,
    ) -> Self {
        let currency = config.team.currency.clone();
        let orders = Arc::new(OrderService::new(
            store.clone(),
            processor.clone(),
            config.catalog,
            config.team,
        ));
        let subscriptions = Arc::new(SubscriptionService::new(store.clone()));

        Self {
            quota: QuotaLedger::new(store.clone()),
            usage: UsageSummaryService::new(store.clone()),
            webhooks: WebhookHandler::new(
                config.webhook_secret,
                store.clone(),
                processor,
                orders.clone(),
                subscriptions.clone(),
                analytics,
                currency,
            ),
            orders,
            subscriptions,
            store,
        }
    }

    /// Plans on sale, cheapest first
    pub async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        self.store.list_plans().await
    }
}
