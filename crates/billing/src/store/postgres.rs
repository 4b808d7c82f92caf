//! PostgreSQL billing store

use async_trait::async_trait;
use sqlx::PgPool;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

use super::{BillingStore, PROCESSING_TIMEOUT};
use crate::error::BillingResult;
use crate::models::{
    ConsumeOutcome, ConsumedUnit, EntitlementRecord, EventClaim, EventResult, NewOrder, Order,
    OrderCompletion, Plan, ProcessorRefs, Subscription, SubscriptionUpsert,
};

const ORDER_COLUMNS: &str = r#"
    id, user_id, plan_id, billing_period, status, client_reference_id,
    stripe_payment_link_url, stripe_checkout_session_id, stripe_payment_intent_id,
    stripe_subscription_id, stripe_customer_id, seat_count, unit_amount_cents,
    completed_at, created_at
"#;

const SUBSCRIPTION_COLUMNS: &str = r#"
    id, user_id, plan_id, billing_period, status, current_period_start,
    current_period_end, cancel_at_period_end, stripe_subscription_id,
    stripe_customer_id, source_event_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: String,
    name: String,
    description: String,
    daily_quota: i32,
    price_cents: i64,
}

impl From<PlanRow> for Plan {
    fn from(row: PlanRow) -> Self {
        Plan {
            id: row.id,
            name: row.name,
            description: row.description,
            daily_quota: row.daily_quota,
            price_cents: row.price_cents,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OrderRow {
    id: Uuid,
    user_id: Uuid,
    plan_id: String,
    billing_period: String,
    status: String,
    client_reference_id: String,
    stripe_payment_link_url: Option<String>,
    stripe_checkout_session_id: Option<String>,
    stripe_payment_intent_id: Option<String>,
    stripe_subscription_id: Option<String>,
    stripe_customer_id: Option<String>,
    seat_count: Option<i32>,
    unit_amount_cents: Option<i64>,
    completed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl TryFrom<OrderRow> for Order {
    type Error = crate::error::BillingError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        Ok(Order {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            billing_period: row.billing_period.parse()?,
            status: row.status.parse()?,
            correlation_id: row.client_reference_id,
            payment_link_url: row.stripe_payment_link_url,
            checkout_session_id: row.stripe_checkout_session_id,
            payment_intent_id: row.stripe_payment_intent_id,
            processor_subscription_id: row.stripe_subscription_id,
            processor_customer_id: row.stripe_customer_id,
            seat_count: row.seat_count,
            unit_amount_cents: row.unit_amount_cents,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    user_id: Uuid,
    plan_id: String,
    billing_period: String,
    status: String,
    current_period_start: OffsetDateTime,
    current_period_end: OffsetDateTime,
    cancel_at_period_end: bool,
    stripe_subscription_id: Option<String>,
    stripe_customer_id: Option<String>,
    source_event_at: Option<OffsetDateTime>,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = crate::error::BillingError;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        Ok(Subscription {
            id: row.id,
            user_id: row.user_id,
            plan_id: row.plan_id,
            billing_period: row.billing_period.parse()?,
            status: row.status.parse()?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            processor_subscription_id: row.stripe_subscription_id,
            processor_customer_id: row.stripe_customer_id,
            source_event_at: row.source_event_at,
        })
    }
}

/// Subscription joined with a possibly missing plan
#[derive(Debug, sqlx::FromRow)]
struct EntitlementRow {
    #[sqlx(flatten)]
    subscription: SubscriptionRow,
    plan_name: Option<String>,
    plan_description: Option<String>,
    daily_quota: Option<i32>,
    price_cents: Option<i64>,
}

#[derive(Debug, sqlx::FromRow)]
struct ConsumeRow {
    plan_id: String,
    plan_name: String,
    daily_quota: i32,
    current_period_end: OffsetDateTime,
    used_after: Option<i32>,
}

/// Postgres-backed store
#[derive(Clone)]
pub struct PgBillingStore {
    pool: PgPool,
}

impl PgBillingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BillingStore for PgBillingStore {
    async fn get_plan(&self, plan_id: &str) -> BillingResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(
            "SELECT id, name, description, daily_quota, price_cents FROM subscription_plans WHERE id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Plan::from))
    }

    async fn list_plans(&self) -> BillingResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(
            r#"
            SELECT id, name, description, daily_quota, price_cents
            FROM subscription_plans
            ORDER BY price_cents ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Plan::from).collect())
    }

    async fn insert_order(&self, order: NewOrder) -> BillingResult<Order> {
        let row: OrderRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO stripe_orders (
                id, user_id, plan_id, billing_period, status, client_reference_id,
                stripe_payment_link_url, seat_count, unit_amount_cents, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, NOW(), NOW())
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(order.user_id)
        .bind(&order.plan_id)
        .bind(order.billing_period.as_str())
        .bind(&order.correlation_id)
        .bind(&order.payment_link_url)
        .bind(order.seat_count)
        .bind(order.unit_amount_cents)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn find_order_by_id(&self, order_id: Uuid) -> BillingResult<Option<Order>> {
        let row: Option<OrderRow> =
            sqlx::query_as(&format!("SELECT {ORDER_COLUMNS} FROM stripe_orders WHERE id = $1"))
                .bind(order_id)
                .fetch_optional(&self.pool)
                .await?;

        row.map(Order::try_from).transpose()
    }

    async fn find_order_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> BillingResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            "SELECT {ORDER_COLUMNS} FROM stripe_orders WHERE client_reference_id = $1"
        ))
        .bind(correlation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Order::try_from).transpose()
    }

    async fn find_latest_completed_order_by_subscription_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<Order>> {
        let row: Option<OrderRow> = sqlx::query_as(&format!(
            r#"
            SELECT {ORDER_COLUMNS}
            FROM stripe_orders
            WHERE stripe_subscription_id = $1 AND status = 'completed'
            ORDER BY completed_at DESC NULLS LAST, created_at DESC
            LIMIT 1
            "#
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Order::try_from).transpose()
    }

    async fn complete_order(
        &self,
        order_id: Uuid,
        refs: &ProcessorRefs,
        completed_at: OffsetDateTime,
    ) -> BillingResult<OrderCompletion> {
        // Only a pending row matches, so concurrent deliveries complete it once
        let updated: Option<OrderRow> = sqlx::query_as(&format!(
            r#"
            UPDATE stripe_orders SET
                status = 'completed',
                stripe_checkout_session_id = COALESCE($2, stripe_checkout_session_id),
                stripe_payment_intent_id = COALESCE($3, stripe_payment_intent_id),
                stripe_subscription_id = COALESCE($4, stripe_subscription_id),
                stripe_customer_id = COALESCE($5, stripe_customer_id),
                completed_at = $6,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(order_id)
        .bind(&refs.checkout_session_id)
        .bind(&refs.payment_intent_id)
        .bind(&refs.subscription_id)
        .bind(&refs.customer_id)
        .bind(completed_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return Ok(OrderCompletion::Completed(row.try_into()?));
        }

        match self.find_order_by_id(order_id).await? {
            Some(order) => Ok(OrderCompletion::AlreadyCompleted(order)),
            None => Ok(OrderCompletion::NotFound),
        }
    }

    async fn update_order_payment(
        &self,
        order_id: Uuid,
        payment_intent_id: &str,
        seat_count: i32,
        unit_amount_cents: i64,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_orders
            SET stripe_payment_intent_id = $2, seat_count = $3, unit_amount_cents = $4,
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(order_id)
        .bind(payment_intent_id)
        .bind(seat_count)
        .bind(unit_amount_cents)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_subscription_by_user(
        &self,
        user_id: Uuid,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS} FROM user_subscriptions WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn find_subscription_by_processor_id(
        &self,
        subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {SUBSCRIPTION_COLUMNS}
            FROM user_subscriptions
            WHERE stripe_subscription_id = $1
            ORDER BY updated_at DESC
            LIMIT 1
            "#
        ))
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn upsert_subscription(
        &self,
        upsert: SubscriptionUpsert,
    ) -> BillingResult<Option<Subscription>> {
        // ON CONFLICT (user_id) relies on the unique index on user_id.
        // The WHERE clause drops writes older than the stored state.
        let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
            r#"
            INSERT INTO user_subscriptions (
                id, user_id, plan_id, billing_period, status,
                current_period_start, current_period_end, cancel_at_period_end,
                stripe_subscription_id, stripe_customer_id, source_event_at,
                created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                plan_id = EXCLUDED.plan_id,
                billing_period = EXCLUDED.billing_period,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                stripe_customer_id = EXCLUDED.stripe_customer_id,
                source_event_at = EXCLUDED.source_event_at,
                updated_at = NOW()
            WHERE user_subscriptions.source_event_at IS NULL
               OR EXCLUDED.source_event_at IS NULL
               OR EXCLUDED.source_event_at >= user_subscriptions.source_event_at
            RETURNING {SUBSCRIPTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(upsert.user_id)
        .bind(&upsert.plan_id)
        .bind(upsert.billing_period.as_str())
        .bind(upsert.status.as_str())
        .bind(upsert.current_period_start)
        .bind(upsert.current_period_end)
        .bind(upsert.cancel_at_period_end)
        .bind(&upsert.processor_subscription_id)
        .bind(&upsert.processor_customer_id)
        .bind(upsert.source_event_at)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Subscription::try_from).transpose()
    }

    async fn find_entitlement(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<EntitlementRecord>> {
        let row: Option<EntitlementRow> = sqlx::query_as(
            r#"
            SELECT s.id, s.user_id, s.plan_id, s.billing_period, s.status,
                   s.current_period_start, s.current_period_end, s.cancel_at_period_end,
                   s.stripe_subscription_id, s.stripe_customer_id, s.source_event_at,
                   p.name AS plan_name, p.description AS plan_description,
                   p.daily_quota, p.price_cents
            FROM user_subscriptions s
            LEFT JOIN subscription_plans p ON p.id = s.plan_id
            WHERE s.user_id = $1
              AND s.status IN ('active', 'trialing')
              AND s.current_period_end > $2
            ORDER BY s.current_period_end DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let plan = match (row.plan_name, row.daily_quota) {
            (Some(name), Some(daily_quota)) => Some(Plan {
                id: row.subscription.plan_id.clone(),
                name,
                description: row.plan_description.unwrap_or_default(),
                daily_quota,
                price_cents: row.price_cents.unwrap_or_default(),
            }),
            _ => None,
        };

        Ok(Some(EntitlementRecord {
            subscription: row.subscription.try_into()?,
            plan,
        }))
    }

    async fn usage_count(&self, user_id: Uuid, day: Date) -> BillingResult<i32> {
        let count: Option<(i32,)> = sqlx::query_as(
            "SELECT usage_count FROM rewrite_usage WHERE user_id = $1 AND usage_date = $2",
        )
        .bind(user_id)
        .bind(day)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count.map(|(c,)| c).unwrap_or(0))
    }

    async fn consume_unit(
        &self,
        user_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<ConsumeOutcome> {
        // One statement: the conditional upsert only bumps the counter while
        // it is below the quota, so concurrent callers cannot overspend.
        let row: Option<ConsumeRow> = sqlx::query_as(
            r#"
            WITH entitlement AS (
                SELECT s.plan_id, p.name AS plan_name, p.daily_quota, s.current_period_end
                FROM user_subscriptions s
                JOIN subscription_plans p ON p.id = s.plan_id
                WHERE s.user_id = $1
                  AND s.status IN ('active', 'trialing')
                  AND s.current_period_end > $3
                ORDER BY s.current_period_end DESC
                LIMIT 1
            ),
            bumped AS (
                INSERT INTO rewrite_usage (user_id, usage_date, usage_count, updated_at)
                SELECT $1, $2, 1, NOW() FROM entitlement WHERE entitlement.daily_quota > 0
                ON CONFLICT (user_id, usage_date) DO UPDATE
                    SET usage_count = rewrite_usage.usage_count + 1, updated_at = NOW()
                    WHERE rewrite_usage.usage_count < (SELECT daily_quota FROM entitlement)
                RETURNING usage_count
            )
            SELECT e.plan_id, e.plan_name, e.daily_quota, e.current_period_end,
                   (SELECT usage_count FROM bumped) AS used_after
            FROM entitlement e
            "#,
        )
        .bind(user_id)
        .bind(now.date())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(ConsumeOutcome::NoEntitlement);
        };

        if row.daily_quota <= 0 {
            return Ok(ConsumeOutcome::NoEntitlement);
        }

        Ok(match row.used_after {
            Some(used) => ConsumeOutcome::Consumed(ConsumedUnit {
                plan_id: row.plan_id,
                plan_name: row.plan_name,
                quota: row.daily_quota,
                used,
                renews_at: row.current_period_end,
            }),
            None => ConsumeOutcome::QuotaExceeded {
                quota: row.daily_quota,
            },
        })
    }

    async fn prune_usage_before(&self, day: Date) -> BillingResult<u64> {
        let result = sqlx::query("DELETE FROM rewrite_usage WHERE usage_date < $1")
            .bind(day)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn claim_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_at: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        // A fresh id inserts. An id that failed, or is stuck in processing
        // past the timeout, is taken over. Anything else returns no row.
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO stripe_webhook_events
                (stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Reclaimed from ', stripe_webhook_events.processing_result, ' at ', NOW()::TEXT)
            WHERE stripe_webhook_events.processing_result = 'error'
               OR (stripe_webhook_events.processing_result = 'processing'
                   AND stripe_webhook_events.processing_started_at < NOW() - make_interval(secs => $4))
            RETURNING id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_at)
        .bind(PROCESSING_TIMEOUT.as_seconds_f64())
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_some() {
            return Ok(EventClaim::Claimed);
        }

        let status: Option<(String,)> = sqlx::query_as(
            "SELECT processing_result FROM stripe_webhook_events WHERE stripe_event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(EventClaim::Duplicate(
            status.map(|(s,)| s).unwrap_or_else(|| "unknown".to_string()),
        ))
    }

    async fn finish_event(
        &self,
        event_id: &str,
        result: EventResult,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(result.as_str())
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn release_stuck_events(&self, older_than: Duration) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE stripe_webhook_events
            SET processing_result = 'error',
                error_message = CONCAT('Released stuck claim at ', NOW()::TEXT)
            WHERE processing_result = 'processing'
              AND processing_started_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(older_than.as_seconds_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
