//! Stripe client wrapper

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use stripe::{
    CreatePaymentIntent, CreatePaymentIntentAutomaticPaymentMethods, Currency, PaymentIntent,
    PaymentIntentId, Subscription, SubscriptionId, UpdatePaymentIntent,
};
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::processor::{
    PaymentIntentInfo, PaymentIntentRequest, PaymentProcessor, ProcessorStatus,
    ProcessorSubscription,
};

const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Stripe API configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Upper bound on any single processor call
    pub request_timeout: Duration,
}

impl StripeConfig {
    pub fn from_env() -> BillingResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| BillingError::Config("STRIPE_SECRET_KEY not set".to_string()))?;

        let timeout_secs = match std::env::var("PROCESSOR_TIMEOUT_SECS") {
            Ok(raw) => raw.parse::<u64>().map_err(|_| {
                BillingError::Config(format!("PROCESSOR_TIMEOUT_SECS is not a number: {}", raw))
            })?,
            Err(_) => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Self {
            secret_key,
            request_timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// Stripe-backed [`PaymentProcessor`]
#[derive(Clone)]
pub struct StripeClient {
    inner: stripe::Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = stripe::Client::new(&config.secret_key);
        Self { inner, config }
    }

    pub fn from_env() -> BillingResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn inner(&self) -> &stripe::Client {
        &self.inner
    }

    /// Run a Stripe call under the configured deadline
    async fn bounded<T, F>(&self, what: &str, call: F) -> BillingResult<T>
    where
        F: Future<Output = Result<T, stripe::StripeError>>,
    {
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(result) => result.map_err(BillingError::from),
            Err(_) => {
                tracing::warn!(
                    operation = what,
                    timeout_secs = self.config.request_timeout.as_secs(),
                    "Stripe call timed out"
                );
                Err(BillingError::Timeout(what.to_string()))
            }
        }
    }
}

fn parse_currency(code: &str) -> BillingResult<Currency> {
    serde_json::from_value(serde_json::Value::String(code.to_lowercase()))
        .map_err(|_| BillingError::Config(format!("unsupported currency: {}", code)))
}

fn from_unix(ts: i64) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts).ok()
}

fn intent_info(intent: PaymentIntent) -> PaymentIntentInfo {
    PaymentIntentInfo {
        id: intent.id.to_string(),
        status: intent.status.as_str().to_string(),
        client_secret: intent.client_secret,
    }
}

#[async_trait]
impl PaymentProcessor for StripeClient {
    async fn fetch_subscription(
        &self,
        subscription_id: &str,
    ) -> BillingResult<ProcessorSubscription> {
        let sub_id = subscription_id
            .parse::<SubscriptionId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid subscription ID: {}", e)))?;

        let sub = self
            .bounded(
                "subscription lookup",
                Subscription::retrieve(&self.inner, &sub_id, &[]),
            )
            .await?;

        Ok(ProcessorSubscription {
            id: sub.id.to_string(),
            customer_id: Some(sub.customer.id().to_string()),
            status: ProcessorStatus::from(sub.status.as_str()),
            current_period_start: from_unix(sub.current_period_start),
            current_period_end: from_unix(sub.current_period_end),
            cancel_at_period_end: sub.cancel_at_period_end,
        })
    }

    async fn retrieve_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<PaymentIntentInfo> {
        let intent_id = payment_intent_id
            .parse::<PaymentIntentId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid payment intent ID: {}", e)))?;

        let intent = self
            .bounded(
                "payment intent lookup",
                PaymentIntent::retrieve(&self.inner, &intent_id, &[]),
            )
            .await?;

        Ok(intent_info(intent))
    }

    async fn create_payment_intent(
        &self,
        request: PaymentIntentRequest,
    ) -> BillingResult<PaymentIntentInfo> {
        let currency = parse_currency(&request.currency)?;
        let mut params = CreatePaymentIntent::new(request.amount_cents, currency);
        params.automatic_payment_methods = Some(CreatePaymentIntentAutomaticPaymentMethods {
            enabled: true,
            allow_redirects: None,
        });
        params.metadata = Some(request.metadata);
        params.receipt_email = request.receipt_email.as_deref();

        let intent = self
            .bounded(
                "payment intent creation",
                PaymentIntent::create(&self.inner, params),
            )
            .await?;

        Ok(intent_info(intent))
    }

    async fn update_payment_intent(
        &self,
        payment_intent_id: &str,
        request: PaymentIntentRequest,
    ) -> BillingResult<PaymentIntentInfo> {
        let intent_id = payment_intent_id
            .parse::<PaymentIntentId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid payment intent ID: {}", e)))?;

        let mut params = UpdatePaymentIntent::new();
        params.amount = Some(request.amount_cents);
        params.currency = Some(parse_currency(&request.currency)?);
        params.metadata = Some(request.metadata);

        let intent = self
            .bounded(
                "payment intent update",
                PaymentIntent::update(&self.inner, &intent_id, params),
            )
            .await?;

        Ok(intent_info(intent))
    }
}
