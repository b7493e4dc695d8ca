//! API routes

pub mod audit;
pub mod billing;
pub mod entitlements;
pub mod health;
pub mod plans;
pub mod refunds;
pub mod subscriptions;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::state::AppState;

/// Webhook and purchase payloads are small; anything larger is rejected early
const MAX_BODY_BYTES: usize = 256 * 1024;

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    // Health routes (no billing required)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness));

    let billing_routes = Router::new()
        .route("/plans", get(plans::list_plans))
        .route("/billing/purchase", post(billing::purchase))
        .route("/users/:user_id/entitlements", get(entitlements::user_entitlements))
        .route("/users/:user_id/billing-events", get(audit::user_billing_events))
        .route("/subscriptions/:id/cancel", post(subscriptions::cancel))
        .route("/subscriptions/:id/pause", post(subscriptions::pause))
        .route("/subscriptions/:id/resume", post(subscriptions::resume))
        .route("/subscriptions/:id/change-plan", post(subscriptions::change_plan))
        .route("/subscriptions/:id/refunds", post(refunds::create_refund))
        .route(
            "/refunds/:subscription_id/:refund_id/cancel",
            post(refunds::cancel_refund),
        )
        .route("/refunds/:subscription_id/:refund_id/sync", post(refunds::sync_refund))
        .route("/webhooks/stripe", post(billing::webhook));

    Router::new()
        .merge(health_routes)
        .merge(billing_routes)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(state)
}
