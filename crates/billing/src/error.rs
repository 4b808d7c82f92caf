//! Billing error types

use thiserror::Error;

/// Errors raised by the billing core
///
/// Variants line up with how callers must react: authenticity failures are
/// rejected so the processor redelivers, validation failures go back to the
/// user, entitlement denials are structured user-facing answers, and
/// transient failures are safe to retry.
#[derive(Error, Debug)]
pub enum BillingError {
    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook payload could not be parsed: {0}")]
    WebhookPayloadInvalid(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Plan {plan_id} requires at least {minimum} seats")]
    SeatMinimum { plan_id: String, minimum: u32 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Daily quota exhausted")]
    QuotaExceeded,

    #[error("No active subscription")]
    SubscriptionMissing,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Failures that may succeed if the same call is made again later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::StripeApi(_) | Self::Database(_)
        )
    }

    /// The user is not allowed to consume a unit right now
    pub fn is_entitlement_denial(&self) -> bool {
        matches!(self, Self::QuotaExceeded | Self::SubscriptionMissing)
    }

    /// The caller has to correct its input
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::InvalidInput(_) | Self::SeatMinimum { .. })
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl From<stripe::StripeError> for BillingError {
    fn from(e: stripe::StripeError) -> Self {
        BillingError::StripeApi(e.to_string())
    }
}

impl From<rewritely_shared::ParseEnumError> for BillingError {
    fn from(e: rewritely_shared::ParseEnumError) -> Self {
        BillingError::Database(format!("corrupt column value: {}", e))
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
