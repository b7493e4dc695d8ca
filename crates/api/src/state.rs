//! Application state

use std::sync::Arc;

use carebill_billing::BillingService;
use sqlx::PgPool;

use crate::config::Config;
use crate::error::{ApiError, ApiResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    /// Billing engine (absent when `ENABLE_BILLING` is off)
    pub billing: Option<Arc<BillingService>>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config, billing: Option<Arc<BillingService>>) -> Self {
        Self { pool, config, billing }
    }

    pub fn billing(&self) -> ApiResult<&BillingService> {
        self.billing.as_deref().ok_or(ApiError::ServiceUnavailable)
    }
}
