//! Daily quota ledger
//!
//! A user's counter is keyed on the UTC calendar date, so the daily reset
//! needs no job: the first consume of a new day simply starts a new row.

use std::sync::Arc;

use serde::Serialize;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::models::ConsumeOutcome;
use crate::store::BillingStore;

/// Counter day for a point in time
pub fn usage_date(now: OffsetDateTime) -> Date {
    now.to_offset(time::UtcOffset::UTC).date()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResult {
    pub remaining: i32,
    pub quota: i32,
    pub plan_id: String,
    pub plan_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub renews_at: OffsetDateTime,
}

pub struct QuotaLedger {
    store: Arc<dyn BillingStore>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Spend one unit of today's quota
    pub async fn consume(&self, user_id: Uuid) -> BillingResult<ConsumeResult> {
        self.consume_at(user_id, OffsetDateTime::now_utc()).await
    }

    pub async fn consume_at(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<ConsumeResult> {
        let now = now.to_offset(time::UtcOffset::UTC);

        match self.store.consume_unit(user_id, now).await? {
            ConsumeOutcome::Consumed(unit) => {
                let remaining = (unit.quota - unit.used).max(0);
                tracing::debug!(
                    user_id = %user_id,
                    used = unit.used,
                    quota = unit.quota,
                    "Consumed quota unit"
                );
                Ok(ConsumeResult {
                    remaining,
                    quota: unit.quota,
                    plan_id: unit.plan_id,
                    plan_name: unit.plan_name,
                    renews_at: unit.renews_at,
                })
            }
            ConsumeOutcome::QuotaExceeded { quota } => {
                tracing::info!(user_id = %user_id, quota = quota, "Daily quota exhausted");
                Err(BillingError::QuotaExceeded)
            }
            ConsumeOutcome::NoEntitlement => {
                tracing::info!(user_id = %user_id, "Consume without active subscription");
                Err(BillingError::SubscriptionMissing)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Plan, SubscriptionUpsert};
    use crate::store::InMemoryBillingStore;
    use rewritely_shared::{BillingPeriod, SubscriptionStatus};
    use time::macros::{date, datetime, offset};

    async fn subscribed(store: &InMemoryBillingStore, plan: &str) -> Uuid {
        let user = Uuid::new_v4();
        store
            .upsert_subscription(SubscriptionUpsert {
                user_id: user,
                plan_id: plan.into(),
                billing_period: BillingPeriod::Monthly,
                status: SubscriptionStatus::Active,
                current_period_start: datetime!(2024-05-01 0:00 UTC),
                current_period_end: datetime!(2024-06-01 0:00 UTC),
                cancel_at_period_end: false,
                processor_subscription_id: None,
                processor_customer_id: None,
                source_event_at: None,
            })
            .await
            .unwrap();
        user
    }

    #[test]
    fn test_usage_date_is_utc() {
        // 01:30 in Hong Kong is still the previous day in UTC
        let local = datetime!(2024-05-10 1:30 +8);
        assert_eq!(usage_date(local), date!(2024 - 05 - 09));
        assert_eq!(usage_date(local.to_offset(offset!(UTC))), date!(2024 - 05 - 09));
    }

    #[tokio::test]
    async fn test_consume_reports_remaining() {
        let store = InMemoryBillingStore::with_default_plans();
        let user = subscribed(&store, "professional").await;
        let ledger = QuotaLedger::new(Arc::new(store));

        let result = ledger
            .consume_at(user, datetime!(2024-05-10 9:00 UTC))
            .await
            .unwrap();
        assert_eq!(result.quota, 20);
        assert_eq!(result.remaining, 19);
        assert_eq!(result.plan_name, "Professional");
        assert_eq!(result.renews_at, datetime!(2024-06-01 0:00 UTC));
    }

    #[tokio::test]
    async fn test_consume_without_subscription() {
        let ledger = QuotaLedger::new(Arc::new(InMemoryBillingStore::with_default_plans()));
        let err = ledger.consume(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionMissing));
    }

    #[tokio::test]
    async fn test_zero_quota_plan_is_not_entitled() {
        let store = InMemoryBillingStore::with_default_plans();
        store.insert_plan(Plan::new("frozen", "Frozen", 0, 0)).await;
        let user = subscribed(&store, "frozen").await;
        let ledger = QuotaLedger::new(Arc::new(store));

        let err = ledger
            .consume_at(user, datetime!(2024-05-10 9:00 UTC))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SubscriptionMissing));
    }

    #[test]
    fn test_consume_result_shape() {
        let result = ConsumeResult {
            remaining: 3,
            quota: 5,
            plan_id: "starter".into(),
            plan_name: "Starter".into(),
            renews_at: datetime!(2024-06-01 0:00 UTC),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["planId"], "starter");
        assert_eq!(json["renewsAt"], "2024-06-01T00:00:00Z");
    }
}
