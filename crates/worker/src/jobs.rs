//! Storage hygiene jobs
//!
//! Neither job is needed for correctness: the daily quota resets by date and
//! stuck webhook claims expire on their own. They keep tables small and let
//! redeliveries through sooner.

use rewritely_billing::{quota::usage_date, BillingResult, BillingStore, PROCESSING_TIMEOUT};
use time::{Date, Duration, OffsetDateTime};

/// First day whose counters are kept. Today is always kept.
pub fn retention_cutoff(now: OffsetDateTime, retention_days: u32) -> Date {
    let days = i64::from(retention_days.max(1));
    usage_date(now) - Duration::days(days)
}

/// Delete daily usage counters older than the retention window
pub async fn prune_usage(
    store: &dyn BillingStore,
    now: OffsetDateTime,
    retention_days: u32,
) -> BillingResult<u64> {
    let cutoff = retention_cutoff(now, retention_days);
    let pruned = store.prune_usage_before(cutoff).await?;
    tracing::info!(cutoff = %cutoff, pruned = pruned, "Pruned old usage counters");
    Ok(pruned)
}

/// Hand webhook claims stuck in `processing` back to redelivery
pub async fn release_stuck_events(store: &dyn BillingStore) -> BillingResult<u64> {
    let released = store.release_stuck_events(PROCESSING_TIMEOUT).await?;
    if released > 0 {
        tracing::warn!(released = released, "Released stuck webhook claims");
    }
    Ok(released)
}
