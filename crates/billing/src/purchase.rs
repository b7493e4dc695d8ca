//! Purchase flow
//!
//! Strict sequence, each stage committing before the next starts:
//!
//! 1. validate the request
//! 2. idempotency guard (duplicates never reach the gateway)
//! 3. load or create the user, repairing its entitlement cache
//! 4. risk assessment; a `decline` ends the flow
//! 5. per-user lock, held from the conflict check through the lifecycle write
//! 6. conflict check
//! 7. payment orchestration
//! 8. lifecycle: record the subscription, refresh entitlements
//!
//! Every request ends in exactly one of `PURCHASE_REJECTED`, `PURCHASE_COMPLETED`,
//! `PURCHASE_REQUIRES_ACTION` or `PURCHASE_FAILED` in the audit trail.

use std::collections::HashMap;
use std::sync::Arc;

use carebill_shared::{FeatureAccess, Subscription, User};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::catalog::{PlanCatalog, PlanConfig};
use crate::conflict::ConflictResolver;
use crate::entitlement::FeatureAccessAggregator;
use crate::error::{new_error_id, BillingError, BillingResult, ErrorResponse};
use crate::events::{ActorMeta, AuditAction, AuditEntry, AuditLog, AuditOutcome};
use crate::gateway::{GatewaySubscription, PaymentGateway, SubscriptionUpdate};
use crate::idempotency::{IdempotencyGuard, IdempotencyKey};
use crate::lifecycle::SubscriptionLifecycle;
use crate::notify::{NotificationEvent, Notifications};
use crate::orchestrator::{PaymentOrchestrator, PaymentOutcome, PaymentRequest};
use crate::risk::{PurchaseSignals, RiskAssessment, RiskEngine, RiskSignalCollector};
use crate::store::BillingStore;

/// Network identity used for the idempotency key when the caller's ip is unknown
const UNKNOWN_NETWORK_IDENTITY: &str = "unknown";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseRequest {
    pub email: String,
    pub plan_id: String,
    pub payment_method_id: Option<String>,
    /// Device, behaviour and billing details for the risk checks
    #[serde(default)]
    pub signals: PurchaseSignals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PurchaseStatus {
    Completed,
    /// The customer must authenticate the first payment (e.g. 3-D Secure)
    RequiresAction,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurchaseReceipt {
    pub status: PurchaseStatus,
    pub user_id: Uuid,
    pub user_created: bool,
    pub subscription: Subscription,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    pub risk: RiskAssessment,
    pub feature_access: FeatureAccess,
}

/// A purchase that did not complete. Unexpected failures carry an opaque id that
/// support can match against the logs.
#[derive(Debug)]
pub struct PurchaseFailure {
    pub error: BillingError,
    pub error_id: Option<String>,
}

impl PurchaseFailure {
    pub fn to_response(&self) -> ErrorResponse {
        self.error.to_response(self.error_id.clone())
    }
}

impl std::fmt::Display for PurchaseFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error_id {
            Some(id) => write!(f, "{} [{}]", self.error, id),
            None => write!(f, "{}", self.error),
        }
    }
}

impl std::error::Error for PurchaseFailure {}

/// Per-user async locks. Entries nobody holds are dropped on the next acquire.
#[derive(Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl UserLocks {
    pub async fn acquire(&self, user_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.retain(|id, lock| *id == user_id || Arc::strong_count(lock) > 1);
            locks.entry(user_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    pub async fn held(&self) -> usize {
        self.locks.lock().await.len()
    }
}

/// What the flow learned before it ended, for the terminal audit entry
#[derive(Default)]
struct PurchaseTrace {
    user_id: Option<Uuid>,
    stage: &'static str,
    risk: Option<RiskAssessment>,
    gateway_subscription_id: Option<String>,
}

pub struct PurchaseService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<PlanCatalog>,
    idempotency: Arc<dyn IdempotencyGuard>,
    signals: RiskSignalCollector,
    risk: RiskEngine,
    conflicts: Arc<ConflictResolver>,
    orchestrator: PaymentOrchestrator,
    lifecycle: Arc<SubscriptionLifecycle>,
    entitlements: Arc<FeatureAccessAggregator>,
    audit: AuditLog,
    notifications: Notifications,
    locks: UserLocks,
}

impl PurchaseService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<PlanCatalog>,
        idempotency: Arc<dyn IdempotencyGuard>,
        signals: RiskSignalCollector,
        risk: RiskEngine,
        conflicts: Arc<ConflictResolver>,
        orchestrator: PaymentOrchestrator,
        lifecycle: Arc<SubscriptionLifecycle>,
        entitlements: Arc<FeatureAccessAggregator>,
        audit: AuditLog,
        notifications: Notifications,
    ) -> Self {
        Self {
            store,
            gateway,
            catalog,
            idempotency,
            signals,
            risk,
            conflicts,
            orchestrator,
            lifecycle,
            entitlements,
            audit,
            notifications,
            locks: UserLocks::default(),
        }
    }

    pub async fn purchase(
        &self,
        request: &PurchaseRequest,
        actor: &ActorMeta,
    ) -> Result<PurchaseReceipt, PurchaseFailure> {
        let mut trace = PurchaseTrace::default();
        let result = self.run(request, actor, &mut trace).await;

        let risk = trace.risk.as_ref().map(|r| {
            serde_json::json!({ "score": r.score, "level": r.level, "recommendation": r.recommendation })
        });

        match result {
            Ok(receipt) => {
                let action = match receipt.status {
                    PurchaseStatus::Completed => AuditAction::PurchaseCompleted,
                    PurchaseStatus::RequiresAction => AuditAction::PurchaseRequiresAction,
                };
                self.audit
                    .record(
                        AuditEntry::builder(action)
                            .user(receipt.user_id)
                            .subscription(receipt.subscription.id)
                            .gateway_ref(&receipt.subscription.gateway_subscription_id)
                            .actor(actor)
                            .data(serde_json::json!({
                                "planId": receipt.subscription.plan_id,
                                "status": receipt.subscription.status,
                                "userCreated": receipt.user_created,
                                "risk": risk,
                            })),
                    )
                    .await;
                Ok(receipt)
            }
            Err(error) => {
                let error_id = error.is_unexpected().then(new_error_id);
                let (action, outcome) = match &error {
                    BillingError::Payment(_) => (AuditAction::PurchaseFailed, AuditOutcome::Failure),
                    e if e.is_unexpected() => (AuditAction::PurchaseFailed, AuditOutcome::Failure),
                    _ => (AuditAction::PurchaseRejected, AuditOutcome::Rejected),
                };

                if let Some(id) = &error_id {
                    tracing::error!(
                        error_id = %id,
                        user_id = ?trace.user_id,
                        plan_id = %request.plan_id,
                        stage = trace.stage,
                        error = %error,
                        "Unexpected purchase failure"
                    );
                } else {
                    tracing::info!(
                        user_id = ?trace.user_id,
                        plan_id = %request.plan_id,
                        stage = trace.stage,
                        code = %error.code(),
                        "Purchase did not complete"
                    );
                }

                let mut entry = AuditEntry::builder(action)
                    .user_opt(trace.user_id)
                    .actor(actor)
                    .outcome(outcome)
                    .data(serde_json::json!({
                        "planId": request.plan_id,
                        "stage": trace.stage,
                        "code": error.code(),
                        "reason": error.to_string(),
                        "errorId": error_id,
                        "risk": risk,
                    }));
                if let Some(gateway_ref) = &trace.gateway_subscription_id {
                    entry = entry.gateway_ref(gateway_ref);
                }
                self.audit.record(entry).await;

                Err(PurchaseFailure { error, error_id })
            }
        }
    }

    async fn run(
        &self,
        request: &PurchaseRequest,
        actor: &ActorMeta,
        trace: &mut PurchaseTrace,
    ) -> BillingResult<PurchaseReceipt> {
        trace.stage = "validation";
        let email = normalize_email(&request.email)?;
        let plan = self.catalog.require(request.plan_id.trim())?.clone();
        if let Some(pm) = &request.payment_method_id {
            if pm.trim().is_empty() {
                return Err(BillingError::Validation(
                    "paymentMethodId must not be blank".to_string(),
                ));
            }
        }

        trace.stage = "idempotency";
        let network_identity = actor.ip.as_deref().unwrap_or(UNKNOWN_NETWORK_IDENTITY);
        let key = IdempotencyKey::derive(network_identity, &email, &plan.id);
        if !self.idempotency.admit(&key).await? {
            tracing::info!(plan_id = %plan.id, key = %key, "Duplicate purchase suppressed");
            return Err(BillingError::DuplicateRequest);
        }

        trace.stage = "user";
        let (user, user_created) = self.load_or_create_user(&email).await?;
        trace.user_id = Some(user.id);

        trace.stage = "risk";
        let mut signals = request.signals.clone();
        signals.email = email.clone();
        signals.plan_id = plan.id.clone();
        if actor.ip.is_some() {
            signals.ip = actor.ip.clone();
        }
        let context = self
            .signals
            .collect(signals, OffsetDateTime::now_utc() - user.created_at)
            .await;
        let assessment = self.risk.assess(&context);
        tracing::info!(
            user_id = %user.id,
            plan_id = %plan.id,
            score = assessment.score,
            level = assessment.level.as_str(),
            recommendation = assessment.recommendation.as_str(),
            "Risk assessed"
        );
        self.audit
            .record(
                AuditEntry::builder(AuditAction::RiskAssessed)
                    .user(user.id)
                    .actor(actor)
                    .data(serde_json::json!({
                        "planId": plan.id,
                        "score": assessment.score,
                        "level": assessment.level,
                        "factors": assessment.factors,
                        "recommendation": assessment.recommendation,
                    })),
            )
            .await;
        trace.risk = Some(assessment.clone());
        if assessment.is_declined() {
            return Err(BillingError::FraudDeclined {
                score: assessment.score,
                factors: assessment.factors,
            });
        }

        trace.stage = "conflict";
        let _guard = self.locks.acquire(user.id).await;
        if let Some(conflict) = self.conflicts.check_conflict(&user, user_created, &plan.id).await? {
            return Err(conflict.into());
        }

        trace.stage = "payment";
        let existing_customer = self
            .store
            .find_subscriptions(user.id, &[])
            .await?
            .into_iter()
            .rev()
            .map(|s| s.gateway_customer_id)
            .find(|id| !id.is_empty());
        let payment = PaymentRequest {
            user_id: user.id,
            email: &email,
            plan: &plan,
            existing_customer_id: existing_customer.as_deref(),
            payment_method_id: request.payment_method_id.as_deref().map(str::trim),
            risk_level: Some(assessment.level),
            actor,
            attempt_id: Uuid::new_v4(),
        };

        let (remote, client_secret, status) = match self.orchestrator.purchase(&payment).await {
            PaymentOutcome::Succeeded { subscription, .. } => (subscription, None, PurchaseStatus::Completed),
            PaymentOutcome::RequiresAction {
                subscription,
                client_secret,
                ..
            } => (subscription, client_secret, PurchaseStatus::RequiresAction),
            PaymentOutcome::Failed { error, .. } => return Err(BillingError::Payment(error)),
        };
        trace.gateway_subscription_id = Some(remote.id.clone());

        trace.stage = "lifecycle";
        let subscription = match self
            .lifecycle
            .create_from_gateway(user.id, &plan, &remote, actor)
            .await
        {
            Ok(sub) => sub,
            Err(e) => {
                self.compensate(&user, &plan, &remote).await;
                return Err(e);
            }
        };

        if status == PurchaseStatus::RequiresAction {
            self.notifications
                .send(
                    user.id,
                    NotificationEvent::PaymentActionRequired,
                    serde_json::json!({ "planId": plan.id, "subscriptionId": subscription.id }),
                )
                .await;
        }

        trace.stage = "entitlements";
        let feature_access = self.entitlements.current(user.id).await?;

        tracing::info!(
            user_id = %user.id,
            plan_id = %plan.id,
            subscription_id = %subscription.id,
            status = %subscription.status,
            "Purchase finished"
        );

        Ok(PurchaseReceipt {
            status,
            user_id: user.id,
            user_created,
            subscription,
            client_secret,
            risk: assessment,
            feature_access,
        })
    }

    /// Find the user by email or sign them up. A cache that needed repairing is
    /// written back.
    async fn load_or_create_user(&self, email: &str) -> BillingResult<(User, bool)> {
        if let Some(user) = self.store.find_user_by_email(email).await? {
            return Ok((self.normalized(user).await?, false));
        }

        let user = User::new(email);
        match self.store.insert_user(&user).await {
            Ok(()) => {
                tracing::info!(user_id = %user.id, "Created user for purchase");
                Ok((user, true))
            }
            // Lost a race with a concurrent signup for the same email
            Err(BillingError::ConcurrentModification(_)) => {
                let existing = self
                    .store
                    .find_user_by_email(email)
                    .await?
                    .ok_or_else(|| BillingError::Internal(format!("user {} vanished after insert conflict", email)))?;
                Ok((self.normalized(existing).await?, false))
            }
            Err(e) => Err(e),
        }
    }

    async fn normalized(&self, mut user: User) -> BillingResult<User> {
        if let Some(access) = user.feature_access.take() {
            let (changed, access) = access.normalize();
            if changed {
                tracing::debug!(user_id = %user.id, "Repaired malformed feature access cache");
                return self.entitlements.store_access(user.id, &access).await;
            }
            user.feature_access = Some(access);
        }
        Ok(user)
    }

    /// The gateway charged but the subscription could not be recorded: cancel the
    /// remote subscription so no charge exists without a record.
    async fn compensate(&self, user: &User, plan: &PlanConfig, remote: &GatewaySubscription) {
        let update = SubscriptionUpdate {
            cancel_now: true,
            ..Default::default()
        };
        let outcome = self
            .orchestrator
            .policy()
            .run("update_subscription", || {
                self.gateway.update_subscription(&remote.id, &update)
            })
            .await;

        match outcome.result {
            Ok(_) => tracing::warn!(
                user_id = %user.id,
                plan_id = %plan.id,
                gateway_subscription_id = %remote.id,
                "Canceled gateway subscription that could not be recorded"
            ),
            Err(e) => tracing::error!(
                user_id = %user.id,
                plan_id = %plan.id,
                gateway_subscription_id = %remote.id,
                error = %e,
                "Gateway subscription is live but unrecorded; manual reconciliation needed"
            ),
        }
    }
}

fn normalize_email(raw: &str) -> BillingResult<String> {
    let email = raw.trim().to_lowercase();
    let valid = email
        .split_once('@')
        .is_some_and(|(local, domain)| {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        });
    if !valid || email.contains(char::is_whitespace) {
        return Err(BillingError::Validation(format!("'{}' is not a valid email address", raw.trim())));
    }
    Ok(email)
}
