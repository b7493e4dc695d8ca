// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! CareBill Billing Module
//!
//! Subscription billing engine for specialty healthcare plans.
//!
//! ## Features
//!
//! - **Plan Catalog**: Fixed specialty/tier plans with frozen feature snapshots
//! - **Idempotency Guard**: Suppresses double submissions within a short window
//! - **Risk Engine**: Scores purchase attempts from velocity, geo, device and identity signals
//! - **Conflict Resolver**: Blocks duplicate plans and plans covered by a higher tier
//! - **Payment Orchestrator**: Customer and subscription creation with classified retries
//! - **Lifecycle**: Legal status transitions, plan changes and period-end expiry
//! - **Entitlements**: Union of features, max of limits across active subscriptions
//! - **Refunds**: Full, partial and prorated refunds with a per-invoice ceiling
//! - **Webhooks**: Handle Stripe invoice and subscription events

pub mod catalog;
pub mod classifier;
pub mod client;
pub mod config;
pub mod conflict;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod gateway;
pub mod idempotency;
pub mod lifecycle;
pub mod memory;
pub mod notify;
pub mod orchestrator;
pub mod purchase;
pub mod refund;
pub mod risk;
pub mod store;
pub mod stripe_gateway;
pub mod webhooks;

#[cfg(test)]
mod edge_case_tests;
#[cfg(test)]
mod test_support;

// Catalog
pub use catalog::{PlanCatalog, PlanConfig};

// Client
pub use client::{StripeClient, StripeConfig};

// Config
pub use config::BillingConfig;

// Conflicts
pub use conflict::{AccountAge, ConflictDetail, ConflictKind, ConflictResolver};

// Entitlements
pub use entitlement::{aggregate, FeatureAccessAggregator};

// Error
pub use error::{new_error_id, BillingError, BillingResult, ErrorCode, ErrorResponse};

// Events
pub use events::{ActorMeta, ActorType, AuditAction, AuditEntry, AuditLog, AuditSink, PgAuditSink};

// Gateway
pub use gateway::{GatewayError, PaymentGateway};
pub use stripe_gateway::StripeGateway;

// Idempotency
pub use idempotency::{IdempotencyGuard, IdempotencyKey, InMemoryIdempotencyGuard, RedisIdempotencyGuard};

// Lifecycle
pub use lifecycle::{CancelRequest, PlanChange, PlanChangeKind, SubscriptionLifecycle, Transition};

// Storage
pub use memory::{InMemoryAuditSink, InMemoryBillingStore};
pub use store::{BillingStore, PgBillingStore};

// Notifications
pub use notify::{LogNotifier, NotificationEvent, Notifier, Notifications};

// Orchestration
pub use orchestrator::{PaymentOrchestrator, RetryPolicy};

// Purchase
pub use purchase::{PurchaseFailure, PurchaseReceipt, PurchaseRequest, PurchaseService, PurchaseStatus};

// Refunds
pub use refund::{calculate_prorated_amount, RefundOutcome, RefundProcessor, RefundRequest};

// Risk
pub use risk::{GeoResolver, HttpGeoResolver, NoopGeoResolver, PurchaseSignals, RiskAssessment, RiskEngine};

// Webhooks
pub use webhooks::{WebhookEvent, WebhookOutcome, WebhookProcessor};

use std::sync::Arc;

use sqlx::PgPool;

use risk::{RiskSignalCollector, VelocityTracker};

/// Collaborators the engine is wired to
pub struct BillingDeps {
    pub store: Arc<dyn BillingStore>,
    pub gateway: Arc<dyn PaymentGateway>,
    pub audit: Arc<dyn AuditSink>,
    pub notifier: Arc<dyn Notifier>,
    pub idempotency: Arc<dyn IdempotencyGuard>,
    pub geo: Arc<dyn GeoResolver>,
    pub webhook_secret: String,
}

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub config: BillingConfig,
    pub catalog: Arc<PlanCatalog>,
    pub store: Arc<dyn BillingStore>,
    pub purchases: PurchaseService,
    pub lifecycle: Arc<SubscriptionLifecycle>,
    pub refunds: RefundProcessor,
    pub entitlements: Arc<FeatureAccessAggregator>,
    pub conflicts: Arc<ConflictResolver>,
    pub webhooks: WebhookProcessor,
}

impl BillingService {
    /// Create a new billing service with explicit collaborators
    pub fn new(config: BillingConfig, catalog: PlanCatalog, deps: BillingDeps) -> Self {
        let catalog = Arc::new(catalog);
        let audit = AuditLog::new(deps.audit);
        let notifications = Notifications::new(deps.notifier);
        let policy = config.retry_policy();

        let entitlements = Arc::new(FeatureAccessAggregator::new(
            deps.store.clone(),
            audit.clone(),
            config.feature_cache_max_age,
        ));
        let conflicts = Arc::new(ConflictResolver::new(
            deps.store.clone(),
            catalog.clone(),
            config.conflict_grace,
        ));
        let lifecycle = Arc::new(SubscriptionLifecycle::new(
            deps.store.clone(),
            deps.gateway.clone(),
            catalog.clone(),
            conflicts.clone(),
            entitlements.clone(),
            audit.clone(),
            notifications.clone(),
            policy.clone(),
        ));
        let refunds = RefundProcessor::new(
            deps.store.clone(),
            deps.gateway.clone(),
            entitlements.clone(),
            audit.clone(),
            notifications.clone(),
            policy.clone(),
            config.min_refund_cents,
        );
        let signals = RiskSignalCollector::new(
            VelocityTracker::new(config.risk.velocity_window),
            deps.geo,
            config.gateway_timeout,
        );
        let purchases = PurchaseService::new(
            deps.store.clone(),
            deps.gateway.clone(),
            catalog.clone(),
            deps.idempotency,
            signals,
            RiskEngine::new(config.risk.clone()),
            conflicts.clone(),
            PaymentOrchestrator::new(deps.gateway, audit.clone(), policy),
            lifecycle.clone(),
            entitlements.clone(),
            audit,
            notifications,
        );
        let webhooks = WebhookProcessor::new(deps.webhook_secret, deps.store.clone(), lifecycle.clone());

        Self {
            config,
            catalog,
            store: deps.store,
            purchases,
            lifecycle,
            refunds,
            entitlements,
            conflicts,
            webhooks,
        }
    }

    /// Create a billing service backed by Postgres and Stripe, configured from the
    /// environment. `redis_url` enables the shared idempotency guard.
    pub async fn from_env(pool: PgPool, redis_url: Option<&str>) -> BillingResult<Self> {
        let config = BillingConfig::from_env();
        let stripe = StripeClient::from_env()?;
        let catalog = PlanCatalog::standard().with_price_overrides(stripe.config());
        let webhook_secret = stripe.config().webhook_secret.clone();

        let idempotency: Arc<dyn IdempotencyGuard> = match redis_url {
            Some(url) => Arc::new(
                RedisIdempotencyGuard::connect(url, config.idempotency_window, config.idempotency_cleanup).await?,
            ),
            None => {
                tracing::info!("REDIS_URL not set, using in-process idempotency guard");
                Arc::new(InMemoryIdempotencyGuard::new(
                    config.idempotency_window,
                    config.idempotency_cleanup,
                ))
            }
        };
        let geo: Arc<dyn GeoResolver> = match HttpGeoResolver::from_env() {
            Some(resolver) => Arc::new(resolver),
            None => {
                tracing::info!("GEOIP_API_URL not set, geolocation checks disabled");
                Arc::new(NoopGeoResolver)
            }
        };

        let deps = BillingDeps {
            store: Arc::new(PgBillingStore::new(pool.clone())),
            gateway: Arc::new(StripeGateway::new(stripe)),
            audit: Arc::new(PgAuditSink::new(pool)),
            notifier: Arc::new(LogNotifier),
            idempotency,
            geo,
            webhook_secret,
        };
        Ok(Self::new(config, catalog, deps))
    }
}
