//! Subscription synchronization
//!
//! Turns processor-reported state into the single local subscription row of
//! a user. Every sync is a full-row upsert keyed on `user_id`; the store drops
//! writes that come from an event older than the one already applied.

use std::sync::Arc;

use rewritely_shared::{BillingPeriod, SubscriptionStatus};
use time::{Date, Month, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::{Subscription, SubscriptionUpsert};
use crate::processor::ProcessorStatus;
use crate::store::BillingStore;

/// How a sync treats the billing window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodUpdate {
    /// Apply this window. A missing end is derived from `start`.
    Set {
        start: OffsetDateTime,
        end: Option<OffsetDateTime>,
    },
    /// Leave the stored window alone. Without a stored row, derive a window
    /// from `fallback_start`.
    Keep { fallback_start: OffsetDateTime },
}

/// Authoritative state to write for one user
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub user_id: Uuid,
    pub plan_id: String,
    pub billing_period: BillingPeriod,
    pub processor_subscription_id: Option<String>,
    pub processor_customer_id: Option<String>,
    pub status: SubscriptionStatus,
    pub period: PeriodUpdate,
    /// `None` keeps the stored flag, or `false` for a new row
    pub cancel_at_period_end: Option<bool>,
    /// Creation time of the processor event behind this sync
    pub event_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Inserted(Subscription),
    Updated(Subscription),
    /// A newer event already shaped the row; nothing was written
    Stale,
}

impl SyncOutcome {
    pub fn subscription(&self) -> Option<&Subscription> {
        match self {
            SyncOutcome::Inserted(sub) | SyncOutcome::Updated(sub) => Some(sub),
            SyncOutcome::Stale => None,
        }
    }
}

/// Map a processor status onto the local status set.
///
/// Total on purpose: statuses this code does not know yet fall through to
/// `Active`, so a paying user is never locked out by a new processor value.
pub fn map_processor_status(status: &ProcessorStatus) -> SubscriptionStatus {
    match status {
        ProcessorStatus::Active => SubscriptionStatus::Active,
        ProcessorStatus::Trialing => SubscriptionStatus::Trialing,
        ProcessorStatus::PastDue | ProcessorStatus::Unpaid | ProcessorStatus::Paused => {
            SubscriptionStatus::PastDue
        }
        ProcessorStatus::Canceled | ProcessorStatus::IncompleteExpired => {
            SubscriptionStatus::Canceled
        }
        ProcessorStatus::Incomplete => SubscriptionStatus::Incomplete,
        ProcessorStatus::Other(raw) => {
            tracing::warn!(status = %raw, "Unknown processor subscription status, treating as active");
            SubscriptionStatus::Active
        }
    }
}

/// Add calendar months, clamping the day to the end of the target month
pub fn add_months(at: OffsetDateTime, months: i32) -> BillingResult<OffsetDateTime> {
    let date = at.date();
    let index = date.year() * 12 + i32::from(u8::from(date.month())) - 1 + months;
    let year = index.div_euclid(12);
    let month = Month::try_from((index.rem_euclid(12) + 1) as u8)
        .map_err(|e| BillingError::Internal(format!("month arithmetic: {}", e)))?;
    let day = date.day().min(time::util::days_in_year_month(year, month));

    let shifted = Date::from_calendar_date(year, month, day)
        .map_err(|e| BillingError::Internal(format!("date arithmetic: {}", e)))?;
    Ok(at.replace_date(shifted))
}

/// End of a billing window that starts at `start`
pub fn period_end(start: OffsetDateTime, period: BillingPeriod) -> BillingResult<OffsetDateTime> {
    match period {
        BillingPeriod::Monthly => add_months(start, 1),
        BillingPeriod::Yearly => add_months(start, 12),
    }
}

pub struct SubscriptionService {
    store: Arc<dyn BillingStore>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn find_by_user(&self, user_id: Uuid) -> BillingResult<Option<Subscription>> {
        self.store.find_subscription_by_user(user_id).await
    }

    pub async fn find_by_processor_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        self.store.find_subscription_by_processor_id(subscription_id).await
    }

    /// Write the subscription row described by `request`
    pub async fn sync(&self, request: SyncRequest) -> BillingResult<SyncOutcome> {
        // Processor id is the strongest key; fall back to the user's row
        let existing = match request.processor_subscription_id.as_deref() {
            Some(sub_id) => match self.store.find_subscription_by_processor_id(sub_id).await? {
                Some(found) => Some(found),
                None => self.store.find_subscription_by_user(request.user_id).await?,
            },
            None => self.store.find_subscription_by_user(request.user_id).await?,
        };

        if let Some(found) = &existing {
            if found.user_id != request.user_id {
                tracing::warn!(
                    user_id = %request.user_id,
                    owner_id = %found.user_id,
                    subscription_id = ?request.processor_subscription_id,
                    "Processor subscription is attached to another user's row"
                );
            }
        }
        // Only the user's own row may donate values to the write
        let own = existing.as_ref().filter(|s| s.user_id == request.user_id);

        let (start, end) = match request.period {
            PeriodUpdate::Set { start, end } => {
                let end = match end {
                    Some(end) => end,
                    None => period_end(start, request.billing_period)?,
                };
                (start, end)
            }
            PeriodUpdate::Keep { fallback_start } => match own {
                Some(row) => (row.current_period_start, row.current_period_end),
                None => (
                    fallback_start,
                    period_end(fallback_start, request.billing_period)?,
                ),
            },
        };

        let cancel_at_period_end = request
            .cancel_at_period_end
            .or_else(|| own.map(|row| row.cancel_at_period_end))
            .unwrap_or(false);

        let processor_customer_id = request
            .processor_customer_id
            .clone()
            .or_else(|| own.and_then(|row| row.processor_customer_id.clone()));

        let upsert = SubscriptionUpsert {
            user_id: request.user_id,
            plan_id: request.plan_id.clone(),
            billing_period: request.billing_period,
            status: request.status,
            current_period_start: start,
            current_period_end: end,
            cancel_at_period_end,
            processor_subscription_id: request.processor_subscription_id.clone(),
            processor_customer_id,
            source_event_at: request.event_at,
        };

        let Some(written) = self.store.upsert_subscription(upsert).await? else {
            tracing::info!(
                user_id = %request.user_id,
                status = %request.status,
                "Skipping subscription sync from an older event"
            );
            return Ok(SyncOutcome::Stale);
        };

        tracing::info!(
            user_id = %written.user_id,
            plan_id = %written.plan_id,
            status = %written.status,
            period_end = %written.current_period_end,
            "Subscription synced"
        );

        Ok(if own.is_some() {
            SyncOutcome::Updated(written)
        } else {
            SyncOutcome::Inserted(written)
        })
    }
}
