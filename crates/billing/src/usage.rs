//! Usage summary
//!
//! Read-only projection of a user's entitlement and today's counter.

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::quota::usage_date;
use crate::store::BillingStore;

/// Client-facing entitlement snapshot.
///
/// Without a subscription only `hasSubscription: false` is serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub has_subscription: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<i32>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub renews_at: Option<OffsetDateTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used: Option<i32>,
}

impl UsageSummary {
    pub fn none() -> Self {
        Self::default()
    }

    /// Entitled but nothing left for today
    pub fn is_exhausted(&self) -> bool {
        self.has_subscription && self.remaining.unwrap_or(0) <= 0
    }
}

pub struct UsageSummaryService {
    store: Arc<dyn BillingStore>,
}

impl UsageSummaryService {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    pub async fn summarize(&self, user_id: Uuid) -> BillingResult<UsageSummary> {
        self.summarize_at(user_id, OffsetDateTime::now_utc()).await
    }

    pub async fn summarize_at(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<UsageSummary> {
        let Some(record) = self.store.find_entitlement(user_id, now).await? else {
            return Ok(UsageSummary::none());
        };

        let plan = match record.plan {
            Some(plan) => plan,
            None => {
                // A join miss must not read as "no subscription"
                tracing::warn!(
                    user_id = %user_id,
                    plan_id = %record.subscription.plan_id,
                    "Plan join returned nothing, looking plan up directly"
                );
                match self.store.get_plan(&record.subscription.plan_id).await? {
                    Some(plan) => plan,
                    None => {
                        tracing::error!(
                            user_id = %user_id,
                            plan_id = %record.subscription.plan_id,
                            "Subscription references a plan that does not exist"
                        );
                        return Ok(UsageSummary::none());
                    }
                }
            }
        };

        if plan.daily_quota <= 0 {
            return Ok(UsageSummary::none());
        }

        let used = self.store.usage_count(user_id, usage_date(now)).await?;

        Ok(UsageSummary {
            has_subscription: true,
            plan_id: Some(plan.id),
            plan_name: Some(plan.name),
            quota: Some(plan.daily_quota),
            remaining: Some((plan.daily_quota - used).max(0)),
            renews_at: Some(record.subscription.current_period_end),
            used: Some(used),
        })
    }
}
