#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! CareBill Background Worker
//!
//! Handles scheduled jobs:
//! - Period-end cancellations (every 5 minutes)
//! - Abandoned incomplete subscriptions (hourly)
//! - Stale entitlement cache refresh (hourly)

mod config;
mod jobs;

use std::sync::Arc;
use std::time::Duration;

use carebill_billing::BillingService;
use carebill_shared::{create_pool, run_migrations};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::info;

use crate::config::WorkerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting CareBill Worker");

    let config = WorkerConfig::from_env()?;
    let pool = create_pool(&config.database_url, config.database_max_connections).await?;
    run_migrations(&pool).await?;
    info!("Database pool created");

    let billing = Arc::new(BillingService::from_env(pool, config.redis_url.as_deref()).await?);

    let scheduler = JobScheduler::new().await?;

    let expire_billing = billing.clone();
    scheduler
        .add(Job::new_async(jobs::EXPIRE_SCHEDULE, move |_uuid, _l| {
            let billing = expire_billing.clone();
            Box::pin(async move {
                jobs::expire_scheduled_cancellations(&billing).await;
            })
        })?)
        .await?;
    info!("Scheduled: Period-end cancellations (every 5 minutes)");

    let refresh_billing = billing.clone();
    let batch = config.entitlement_refresh_batch;
    scheduler
        .add(Job::new_async(jobs::REFRESH_SCHEDULE, move |_uuid, _l| {
            let billing = refresh_billing.clone();
            Box::pin(async move {
                jobs::refresh_stale_entitlements(&billing, batch).await;
            })
        })?)
        .await?;
    info!("Scheduled: Stale entitlement refresh (hourly)");

    let incomplete_billing = billing.clone();
    let max_age = time::Duration::hours(config.incomplete_expiry_hours);
    scheduler
        .add(Job::new_async(jobs::REFRESH_SCHEDULE, move |_uuid, _l| {
            let billing = incomplete_billing.clone();
            Box::pin(async move {
                jobs::expire_abandoned_incomplete(&billing, max_age, batch).await;
            })
        })?)
        .await?;
    info!("Scheduled: Abandoned incomplete sweep (hourly)");

    info!("Starting job scheduler");
    scheduler.start().await?;

    // The scheduler runs jobs in background tasks
    loop {
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
