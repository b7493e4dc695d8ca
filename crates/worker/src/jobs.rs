//! Scheduled billing maintenance

use carebill_billing::BillingService;
use time::OffsetDateTime;
use tracing::{error, info};

/// Every five minutes, at second 0
pub const EXPIRE_SCHEDULE: &str = "0 */5 * * * *";
/// Hourly, at minute 0
pub const REFRESH_SCHEDULE: &str = "0 0 * * * *";

/// Cancel subscriptions scheduled to end whose period is over
pub async fn expire_scheduled_cancellations(billing: &BillingService) {
    match billing.lifecycle.expire_period_end(OffsetDateTime::now_utc()).await {
        Ok(0) => {}
        Ok(count) => info!(count, "Period-end cancellations applied"),
        Err(e) => error!(error = %e, "Period-end cancellation run failed"),
    }
}

/// Cancel subscriptions whose first payment was abandoned more than `max_age` ago
pub async fn expire_abandoned_incomplete(billing: &BillingService, max_age: time::Duration, batch: i64) {
    let cutoff = OffsetDateTime::now_utc() - max_age;
    match billing.lifecycle.expire_incomplete(cutoff, batch).await {
        Ok(0) => {}
        Ok(count) => info!(count, "Abandoned incomplete subscriptions expired"),
        Err(e) => error!(error = %e, "Incomplete subscription sweep failed"),
    }
}

/// Rebuild entitlement caches older than the staleness horizon
pub async fn refresh_stale_entitlements(billing: &BillingService, batch: i64) {
    match billing.entitlements.refresh_stale(batch).await {
        Ok(0) => {}
        Ok(count) => info!(count, "Refreshed stale feature access caches"),
        Err(e) => error!(error = %e, "Feature access refresh run failed"),
    }
}
