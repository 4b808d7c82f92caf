// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Rewritely Background Worker
//!
//! Handles scheduled jobs:
//! - Usage counter retention (daily at 03:00 UTC)
//! - Release of stuck webhook claims (every 15 minutes)

mod config;
mod jobs;

use std::sync::Arc;
use std::time::Duration;

use rewritely_billing::{BillingStore, PgBillingStore};
use rewritely_shared::create_pool;
use time::OffsetDateTime;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Rewritely Worker");

    let config = WorkerConfig::from_env()?;
    let pool = create_pool(&config.database_url).await?;
    let store: Arc<dyn BillingStore> = Arc::new(PgBillingStore::new(pool));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Prune old usage counters
    // Cron: At 03:00 UTC every day
    let prune_store = store.clone();
    let retention_days = config.usage_retention_days;
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let store = prune_store.clone();
            Box::pin(async move {
                info!("Running usage counter retention job");
                if let Err(e) =
                    jobs::prune_usage(store.as_ref(), OffsetDateTime::now_utc(), retention_days)
                        .await
                {
                    error!(error = %e, "Usage counter retention failed");
                }
            })
        })?)
        .await?;
    info!(
        retention_days = retention_days,
        "Scheduled: Usage counter retention (daily at 03:00 UTC)"
    );

    // Job 2: Release stuck webhook claims
    // Cron: Every 15 minutes
    let release_store = store.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let store = release_store.clone();
            Box::pin(async move {
                if let Err(e) = jobs::release_stuck_events(store.as_ref()).await {
                    error!(error = %e, "Releasing stuck webhook claims failed");
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stuck webhook claim release (every 15 minutes)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    info!("Rewritely Worker started successfully with {} scheduled jobs", 2);

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
