//! Subscription Lifecycle State Machine
//!
//! Owns every status change of a [`Subscription`]:
//!
//! ```text
//! incomplete ─┬─> trialing ─┬─> active <──> past_due ──> canceled
//!             └─> active    └─> paused ──> active
//! ```
//!
//! Writes are read-modify-write on the single record with an optimistic version check.
//! A transition is only applied while the stored status is one of its source states;
//! otherwise it is rejected, never silently overwritten. Every applied transition
//! refreshes the owner's entitlements and appends an audit entry carrying the old and
//! new status.

use std::sync::Arc;

use carebill_shared::{Subscription, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::catalog::{PlanCatalog, PlanConfig};
use crate::classifier::classify;
use crate::conflict::{AccountAge, ConflictResolver};
use crate::entitlement::FeatureAccessAggregator;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorMeta, AuditAction, AuditEntry, AuditLog, AuditOutcome};
use crate::gateway::{CollectionChange, GatewayError, GatewaySubscription, PaymentGateway, SubscriptionUpdate};
use crate::notify::{NotificationEvent, Notifications};
use crate::orchestrator::RetryPolicy;
use crate::store::BillingStore;

/// Version conflicts are retried this many times before surfacing
const SAVE_ATTEMPTS: u32 = 3;

use SubscriptionStatus::{Active, Canceled, Incomplete, Paused, PastDue, Trialing};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    PaymentSucceeded,
    PaymentFailed,
    Cancel,
    ScheduleCancel,
    Pause,
    Resume,
    ChangePlan,
    /// A scheduled cancellation reaching its period end
    ExpirePeriodEnd,
    /// A first payment that was never completed
    ExpireIncomplete,
    GatewayCanceled,
    GatewaySync,
}

impl Transition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PaymentSucceeded => "payment_succeeded",
            Self::PaymentFailed => "payment_failed",
            Self::Cancel => "cancel",
            Self::ScheduleCancel => "schedule_cancel",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::ChangePlan => "change_plan",
            Self::ExpirePeriodEnd => "expire_period_end",
            Self::ExpireIncomplete => "expire_incomplete",
            Self::GatewayCanceled => "gateway_canceled",
            Self::GatewaySync => "gateway_sync",
        }
    }

    fn verb(&self) -> &'static str {
        match self {
            Self::PaymentSucceeded => "record a payment for",
            Self::PaymentFailed => "record a failed payment for",
            Self::Cancel | Self::GatewayCanceled => "cancel",
            Self::ScheduleCancel => "schedule cancellation of",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::ChangePlan => "change the plan of",
            Self::ExpirePeriodEnd | Self::ExpireIncomplete => "expire",
            Self::GatewaySync => "sync",
        }
    }

    /// Statuses this transition may start from
    pub fn sources(&self) -> &'static [SubscriptionStatus] {
        match self {
            Self::PaymentSucceeded => &[Incomplete, Trialing, Active, PastDue],
            Self::PaymentFailed => &[Trialing, Active, PastDue],
            Self::Cancel | Self::GatewayCanceled | Self::GatewaySync => {
                &[Incomplete, Trialing, Active, PastDue, Paused]
            }
            Self::ScheduleCancel | Self::ExpirePeriodEnd => &[Trialing, Active, PastDue],
            Self::Pause | Self::ChangePlan => &[Trialing, Active],
            Self::Resume => &[Paused],
            Self::ExpireIncomplete => &[Incomplete],
        }
    }

    /// Whether the transition may be applied to `sub` as stored
    pub fn permits(&self, sub: &Subscription) -> bool {
        let from_ok = self.sources().contains(&sub.status);
        match self {
            Self::ExpirePeriodEnd => from_ok && sub.cancel_at_period_end,
            _ => from_ok,
        }
    }
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a plan change, by tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanChangeKind {
    Upgrade,
    Downgrade,
    /// Same tier, e.g. a move to another specialty
    Lateral,
}

impl PlanChangeKind {
    pub fn between(from: &PlanConfig, to: &PlanConfig) -> Self {
        match to.tier.cmp(&from.tier) {
            std::cmp::Ordering::Greater => Self::Upgrade,
            std::cmp::Ordering::Less => Self::Downgrade,
            std::cmp::Ordering::Equal => Self::Lateral,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upgrade => "upgrade",
            Self::Downgrade => "downgrade",
            Self::Lateral => "lateral",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanChange {
    pub subscription: Subscription,
    pub previous_plan_id: String,
    pub kind: PlanChangeKind,
}

/// A paid invoice reported by the gateway
#[derive(Debug, Clone, Default)]
pub struct InvoicePayment {
    pub invoice_id: String,
    pub amount_paid_cents: i64,
    /// New billing period, when the invoice opened one
    pub period: Option<(OffsetDateTime, OffsetDateTime)>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CancelRequest {
    /// Keep the subscription until its period ends instead of canceling now
    pub at_period_end: bool,
    pub reason: Option<String>,
}

pub struct SubscriptionLifecycle {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    catalog: Arc<PlanCatalog>,
    conflicts: Arc<ConflictResolver>,
    entitlements: Arc<FeatureAccessAggregator>,
    audit: AuditLog,
    notifications: Notifications,
    policy: RetryPolicy,
}

impl SubscriptionLifecycle {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        catalog: Arc<PlanCatalog>,
        conflicts: Arc<ConflictResolver>,
        entitlements: Arc<FeatureAccessAggregator>,
        audit: AuditLog,
        notifications: Notifications,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            gateway,
            catalog,
            conflicts,
            entitlements,
            audit,
            notifications,
            policy,
        }
    }

    /// Record a subscription the gateway just created. The initial status is whatever
    /// the gateway reported. Recording the same gateway subscription twice returns the
    /// existing record.
    pub async fn create_from_gateway(
        &self,
        user_id: Uuid,
        plan: &PlanConfig,
        remote: &GatewaySubscription,
        actor: &ActorMeta,
    ) -> BillingResult<Subscription> {
        if let Some(existing) = self.store.find_subscription_by_external_id(&remote.id).await? {
            tracing::info!(
                subscription_id = %existing.id,
                gateway_subscription_id = %remote.id,
                "Gateway subscription already recorded"
            );
            return Ok(existing);
        }

        let now = OffsetDateTime::now_utc();
        let invoice = remote.latest_invoice.as_ref();
        let sub = Subscription {
            id: Uuid::new_v4(),
            user_id,
            plan_id: plan.id.clone(),
            gateway_customer_id: remote.customer_id.clone(),
            gateway_subscription_id: remote.id.clone(),
            latest_invoice_id: invoice.map(|i| i.id.clone()),
            status: remote.status,
            amount_cents: plan.price_cents,
            amount_paid_cents: invoice.filter(|i| i.paid).map_or(0, |i| i.amount_paid_cents),
            interval: plan.interval,
            current_period_start: remote.current_period_start,
            current_period_end: remote.current_period_end,
            cancel_at_period_end: remote.cancel_at_period_end,
            canceled_at: None,
            cancel_reason: None,
            paused_at: None,
            resumed_at: None,
            failed_payment_count: 0,
            features: plan.features.iter().cloned().collect(),
            limits: plan.limits,
            refunds: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        };

        self.store.insert_subscription(&sub).await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %sub.id,
            plan_id = %plan.id,
            status = %sub.status,
            "Subscription recorded"
        );
        self.audit
            .record(
                AuditEntry::builder(AuditAction::StatusTransition)
                    .user(user_id)
                    .subscription(sub.id)
                    .gateway_ref(&remote.id)
                    .actor(actor)
                    .data(serde_json::json!({
                        "transition": "created",
                        "from": null,
                        "to": sub.status,
                        "planId": plan.id,
                    })),
            )
            .await;
        self.refresh_entitlements(user_id).await;

        if sub.is_entitled() {
            self.notifications
                .send(
                    user_id,
                    NotificationEvent::SubscriptionActivated,
                    serde_json::json!({ "planId": plan.id, "status": sub.status }),
                )
                .await;
        }
        Ok(sub)
    }

    /// A paid invoice moves the subscription to active and clears the failure counter
    pub async fn record_payment_succeeded(
        &self,
        subscription_id: Uuid,
        payment: &InvoicePayment,
        actor: &ActorMeta,
    ) -> BillingResult<Subscription> {
        let (from, sub) = self
            .apply(
                subscription_id,
                Transition::PaymentSucceeded,
                actor,
                serde_json::json!({ "invoiceId": payment.invoice_id }),
                |sub| {
                    sub.status = Active;
                    sub.failed_payment_count = 0;
                    sub.latest_invoice_id = Some(payment.invoice_id.clone());
                    sub.amount_paid_cents = payment.amount_paid_cents;
                    if let Some((start, end)) = payment.period {
                        sub.current_period_start = start;
                        sub.current_period_end = end;
                    }
                },
            )
            .await?;

        let event = match from {
            PastDue => Some(NotificationEvent::PaymentRecovered),
            Incomplete | Trialing => Some(NotificationEvent::SubscriptionActivated),
            _ => None,
        };
        if let Some(event) = event {
            self.notifications
                .send(
                    sub.user_id,
                    event,
                    serde_json::json!({ "planId": sub.plan_id, "invoiceId": payment.invoice_id }),
                )
                .await;
        }
        Ok(sub)
    }

    /// A failed invoice moves the subscription to past due
    pub async fn record_payment_failed(
        &self,
        subscription_id: Uuid,
        invoice_id: &str,
        actor: &ActorMeta,
    ) -> BillingResult<Subscription> {
        let (_, sub) = self
            .apply(
                subscription_id,
                Transition::PaymentFailed,
                actor,
                serde_json::json!({ "invoiceId": invoice_id }),
                |sub| {
                    sub.status = PastDue;
                    sub.failed_payment_count += 1;
                },
            )
            .await?;

        tracing::warn!(
            subscription_id = %sub.id,
            failed_payments = sub.failed_payment_count,
            "Subscription payment failed"
        );
        self.notifications
            .send(
                sub.user_id,
                NotificationEvent::PaymentFailed,
                serde_json::json!({
                    "planId": sub.plan_id,
                    "invoiceId": invoice_id,
                    "failedPaymentCount": sub.failed_payment_count,
                }),
            )
            .await;
        Ok(sub)
    }

    /// Cancel now, or schedule cancellation at period end. A scheduled cancellation
    /// leaves the status untouched until [`expire_period_end`] flips it.
    ///
    /// [`expire_period_end`]: Self::expire_period_end
    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        request: &CancelRequest,
        actor: &ActorMeta,
    ) -> BillingResult<Subscription> {
        let transition = if request.at_period_end {
            Transition::ScheduleCancel
        } else {
            Transition::Cancel
        };
        let current = self.load_permitted(subscription_id, transition, actor).await?;

        let update = if request.at_period_end {
            SubscriptionUpdate {
                cancel_at_period_end: Some(true),
                ..Default::default()
            }
        } else {
            SubscriptionUpdate {
                cancel_now: true,
                ..Default::default()
            }
        };
        self.update_gateway(&current, transition, &update, actor).await?;

        let reason = request.reason.clone();
        let (_, sub) = self
            .apply(
                subscription_id,
                transition,
                actor,
                serde_json::json!({ "reason": reason, "atPeriodEnd": request.at_period_end }),
                |sub| {
                    sub.cancel_reason = reason.clone();
                    if request.at_period_end {
                        sub.cancel_at_period_end = true;
                    } else {
                        sub.status = Canceled;
                        sub.cancel_at_period_end = false;
                        sub.canceled_at = Some(OffsetDateTime::now_utc());
                    }
                },
            )
            .await?;

        let event = if request.at_period_end {
            NotificationEvent::CancellationScheduled
        } else {
            NotificationEvent::SubscriptionCanceled
        };
        self.notifications
            .send(
                sub.user_id,
                event,
                serde_json::json!({
                    "planId": sub.plan_id,
                    "effectiveAt": sub.canceled_at.unwrap_or(sub.current_period_end).unix_timestamp(),
                }),
            )
            .await;
        Ok(sub)
    }

    /// Suspend collection; entitlements lapse while paused
    pub async fn pause(&self, subscription_id: Uuid, actor: &ActorMeta) -> BillingResult<Subscription> {
        let current = self.load_permitted(subscription_id, Transition::Pause, actor).await?;
        let update = SubscriptionUpdate {
            collection: Some(CollectionChange::Pause),
            ..Default::default()
        };
        self.update_gateway(&current, Transition::Pause, &update, actor).await?;

        let (_, sub) = self
            .apply(subscription_id, Transition::Pause, actor, serde_json::json!({}), |sub| {
                sub.status = Paused;
                sub.paused_at = Some(OffsetDateTime::now_utc());
            })
            .await?;

        self.notifications
            .send(
                sub.user_id,
                NotificationEvent::SubscriptionPaused,
                serde_json::json!({ "planId": sub.plan_id }),
            )
            .await;
        Ok(sub)
    }

    pub async fn resume(&self, subscription_id: Uuid, actor: &ActorMeta) -> BillingResult<Subscription> {
        let current = self.load_permitted(subscription_id, Transition::Resume, actor).await?;
        let update = SubscriptionUpdate {
            collection: Some(CollectionChange::Resume),
            ..Default::default()
        };
        self.update_gateway(&current, Transition::Resume, &update, actor).await?;

        let (_, sub) = self
            .apply(subscription_id, Transition::Resume, actor, serde_json::json!({}), |sub| {
                sub.status = Active;
                sub.resumed_at = Some(OffsetDateTime::now_utc());
            })
            .await?;

        self.notifications
            .send(
                sub.user_id,
                NotificationEvent::SubscriptionResumed,
                serde_json::json!({ "planId": sub.plan_id }),
            )
            .await;
        Ok(sub)
    }

    /// Move the subscription to another plan in place. The plan snapshot (price,
    /// features, limits) is replaced; the status is not.
    pub async fn change_plan(
        &self,
        subscription_id: Uuid,
        new_plan_id: &str,
        actor: &ActorMeta,
    ) -> BillingResult<PlanChange> {
        let target = self.catalog.require(new_plan_id)?.clone();
        let current = self.load_permitted(subscription_id, Transition::ChangePlan, actor).await?;
        if current.plan_id == target.id {
            return Err(BillingError::Validation(format!(
                "Subscription is already on plan {}",
                target.id
            )));
        }
        let previous = self.catalog.require(&current.plan_id)?.clone();
        let kind = PlanChangeKind::between(&previous, &target);

        let others: Vec<Subscription> = self
            .store
            .find_subscriptions(current.user_id, &SubscriptionStatus::ENTITLED)
            .await?
            .into_iter()
            .filter(|s| s.id != current.id)
            .collect();
        if let Some(conflict) = self.conflicts.evaluate(&target, &others, AccountAge::Established) {
            self.audit
                .record(
                    AuditEntry::builder(AuditAction::TransitionRejected)
                        .user(current.user_id)
                        .subscription(current.id)
                        .actor(actor)
                        .outcome(AuditOutcome::Rejected)
                        .data(serde_json::json!({
                            "transition": Transition::ChangePlan,
                            "from": current.status,
                            "conflict": conflict,
                        })),
                )
                .await;
            return Err(conflict.into());
        }

        let update = SubscriptionUpdate {
            price_id: Some(target.gateway_price_id.clone()),
            ..Default::default()
        };
        self.update_gateway(&current, Transition::ChangePlan, &update, actor)
            .await?;

        let (_, sub) = self
            .apply(
                subscription_id,
                Transition::ChangePlan,
                actor,
                serde_json::json!({
                    "fromPlanId": previous.id,
                    "toPlanId": target.id,
                    "kind": kind,
                }),
                |sub| apply_plan(sub, &target),
            )
            .await?;

        tracing::info!(
            subscription_id = %sub.id,
            from_plan = %previous.id,
            to_plan = %target.id,
            kind = kind.as_str(),
            "Plan changed"
        );
        self.notifications
            .send(
                sub.user_id,
                NotificationEvent::PlanChanged,
                serde_json::json!({ "fromPlanId": previous.id, "toPlanId": target.id, "kind": kind }),
            )
            .await;

        Ok(PlanChange {
            subscription: sub,
            previous_plan_id: previous.id,
            kind,
        })
    }

    /// Flip scheduled cancellations whose period has ended. Returns how many were
    /// canceled; individual failures are logged and skipped.
    pub async fn expire_period_end(&self, now: OffsetDateTime) -> BillingResult<usize> {
        let due = self.store.find_subscriptions_due_for_cancellation(now).await?;
        let actor = ActorMeta::system();

        let mut expired = 0;
        for candidate in due {
            let result = self
                .apply(
                    candidate.id,
                    Transition::ExpirePeriodEnd,
                    &actor,
                    serde_json::json!({ "periodEnd": candidate.current_period_end.unix_timestamp() }),
                    |sub| {
                        sub.status = Canceled;
                        sub.canceled_at = Some(sub.current_period_end);
                    },
                )
                .await;

            match result {
                Ok((_, sub)) => {
                    expired += 1;
                    self.notifications
                        .send(
                            sub.user_id,
                            NotificationEvent::SubscriptionCanceled,
                            serde_json::json!({
                                "planId": sub.plan_id,
                                "effectiveAt": sub.current_period_end.unix_timestamp(),
                            }),
                        )
                        .await;
                }
                Err(e) => {
                    tracing::warn!(subscription_id = %candidate.id, error = %e, "Failed to expire subscription")
                }
            }
        }

        if expired > 0 {
            tracing::info!(count = expired, "Expired subscriptions at period end");
        }
        Ok(expired)
    }

    /// Close out subscriptions whose first payment was left waiting on the customer
    /// since before `cutoff`. A subscription the gateway has since moved on (paid, or
    /// expired itself) is synced instead. Returns how many were expired; individual
    /// failures are logged and skipped.
    pub async fn expire_incomplete(&self, cutoff: OffsetDateTime, limit: i64) -> BillingResult<usize> {
        let abandoned = self.store.find_incomplete_subscriptions(cutoff, limit).await?;
        let actor = ActorMeta::system();

        let mut expired = 0;
        for candidate in abandoned {
            match self.expire_one_incomplete(&candidate, &actor).await {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(subscription_id = %candidate.id, error = %e, "Failed to expire incomplete subscription")
                }
            }
        }

        if expired > 0 {
            tracing::info!(count = expired, "Expired abandoned incomplete subscriptions");
        }
        Ok(expired)
    }

    async fn expire_one_incomplete(&self, candidate: &Subscription, actor: &ActorMeta) -> BillingResult<bool> {
        let outcome = self
            .policy
            .run("retrieve_subscription", || {
                self.gateway
                    .retrieve_subscription(&candidate.gateway_subscription_id)
            })
            .await;
        match outcome.result {
            Ok(remote) if remote.status != Incomplete => {
                tracing::info!(
                    subscription_id = %candidate.id,
                    gateway_status = %remote.status,
                    "Incomplete subscription moved on at the gateway, syncing"
                );
                self.sync_from_gateway(candidate.id, &remote, actor).await?;
                return Ok(false);
            }
            Ok(_) => {
                let update = SubscriptionUpdate {
                    cancel_now: true,
                    ..Default::default()
                };
                self.update_gateway(candidate, Transition::ExpireIncomplete, &update, actor)
                    .await?;
            }
            // Already gone on the gateway side
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(self.gateway_failed(candidate, Transition::ExpireIncomplete, actor, e).await),
        }

        self.apply(
            candidate.id,
            Transition::ExpireIncomplete,
            actor,
            serde_json::json!({ "createdAt": candidate.created_at.unix_timestamp() }),
            |sub| {
                sub.status = Canceled;
                sub.canceled_at = Some(OffsetDateTime::now_utc());
                sub.cancel_reason = Some("incomplete_expired".to_string());
            },
        )
        .await?;
        Ok(true)
    }

    /// The gateway ended the subscription on its side
    pub async fn mark_canceled_by_gateway(
        &self,
        subscription_id: Uuid,
        actor: &ActorMeta,
    ) -> BillingResult<Subscription> {
        let (_, sub) = self
            .apply(
                subscription_id,
                Transition::GatewayCanceled,
                actor,
                serde_json::json!({}),
                |sub| {
                    sub.status = Canceled;
                    sub.cancel_at_period_end = false;
                    sub.canceled_at.get_or_insert_with(OffsetDateTime::now_utc);
                    sub.cancel_reason.get_or_insert_with(|| "canceled_by_gateway".to_string());
                },
            )
            .await?;

        self.notifications
            .send(
                sub.user_id,
                NotificationEvent::SubscriptionCanceled,
                serde_json::json!({ "planId": sub.plan_id }),
            )
            .await;
        Ok(sub)
    }

    /// Mirror the gateway's view of the subscription: status, period, scheduled
    /// cancellation and, when the price maps to another catalog plan, the plan itself.
    /// Nothing is written when the two already agree.
    pub async fn sync_from_gateway(
        &self,
        subscription_id: Uuid,
        remote: &GatewaySubscription,
        actor: &ActorMeta,
    ) -> BillingResult<Subscription> {
        let current = self.load(subscription_id).await?;
        let remote_plan = remote
            .price_id
            .as_deref()
            .and_then(|price| self.catalog.by_price_id(price))
            .filter(|plan| plan.id != current.plan_id)
            .cloned();

        let in_sync = current.status == remote.status
            && current.current_period_start == remote.current_period_start
            && current.current_period_end == remote.current_period_end
            && current.cancel_at_period_end == remote.cancel_at_period_end
            && remote_plan.is_none();
        if in_sync {
            tracing::debug!(subscription_id = %subscription_id, "Subscription already in sync");
            return Ok(current);
        }

        let (from, sub) = self
            .apply(
                subscription_id,
                Transition::GatewaySync,
                actor,
                serde_json::json!({
                    "gatewayStatus": remote.status,
                    "planId": remote_plan.as_ref().map(|p| p.id.clone()),
                }),
                |sub| {
                    let now = OffsetDateTime::now_utc();
                    if sub.status != remote.status {
                        match remote.status {
                            Canceled => {
                                sub.canceled_at.get_or_insert(now);
                            }
                            Paused => sub.paused_at = Some(now),
                            Active if sub.status == Paused => sub.resumed_at = Some(now),
                            _ => {}
                        }
                    }
                    sub.status = remote.status;
                    sub.current_period_start = remote.current_period_start;
                    sub.current_period_end = remote.current_period_end;
                    sub.cancel_at_period_end = remote.cancel_at_period_end;
                    if let Some(plan) = &remote_plan {
                        apply_plan(sub, plan);
                    }
                },
            )
            .await?;

        if from != sub.status && sub.status == Canceled {
            self.notifications
                .send(
                    sub.user_id,
                    NotificationEvent::SubscriptionCanceled,
                    serde_json::json!({ "planId": sub.plan_id }),
                )
                .await;
        }
        Ok(sub)
    }

    async fn load(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .find_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))
    }

    /// Load the subscription and reject the transition up front, before any gateway call
    async fn load_permitted(
        &self,
        subscription_id: Uuid,
        transition: Transition,
        actor: &ActorMeta,
    ) -> BillingResult<Subscription> {
        let sub = self.load(subscription_id).await?;
        self.ensure_permitted(&sub, transition, actor).await?;
        Ok(sub)
    }

    async fn ensure_permitted(
        &self,
        sub: &Subscription,
        transition: Transition,
        actor: &ActorMeta,
    ) -> BillingResult<()> {
        if transition.permits(sub) {
            return Ok(());
        }

        tracing::info!(
            subscription_id = %sub.id,
            status = %sub.status,
            transition = transition.as_str(),
            "Rejected lifecycle transition"
        );
        self.audit
            .record(
                AuditEntry::builder(AuditAction::TransitionRejected)
                    .user(sub.user_id)
                    .subscription(sub.id)
                    .actor(actor)
                    .outcome(AuditOutcome::Rejected)
                    .data(serde_json::json!({
                        "transition": transition,
                        "from": sub.status,
                    })),
            )
            .await;
        Err(BillingError::InvalidTransition {
            from: sub.status,
            action: transition.verb(),
        })
    }

    /// Reload, check, mutate and save until the version check passes, then audit and
    /// refresh the owner's entitlements. Returns the status the record had before.
    async fn apply<F>(
        &self,
        subscription_id: Uuid,
        transition: Transition,
        actor: &ActorMeta,
        detail: serde_json::Value,
        mut mutate: F,
    ) -> BillingResult<(SubscriptionStatus, Subscription)>
    where
        F: FnMut(&mut Subscription) + Send,
    {
        let mut attempt = 0;
        let (from, saved) = loop {
            attempt += 1;
            let mut sub = self.load(subscription_id).await?;
            self.ensure_permitted(&sub, transition, actor).await?;

            let from = sub.status;
            mutate(&mut sub);
            match self.store.save_subscription(&sub).await {
                Ok(saved) => break (from, saved),
                Err(BillingError::ConcurrentModification(reason)) if attempt < SAVE_ATTEMPTS => {
                    tracing::debug!(
                        subscription_id = %subscription_id,
                        attempt = attempt,
                        reason = %reason,
                        "Version conflict, reloading subscription"
                    );
                }
                Err(e) => return Err(e),
            }
        };

        let action = match transition {
            Transition::ChangePlan => AuditAction::PlanChanged,
            _ => AuditAction::StatusTransition,
        };
        tracing::info!(
            subscription_id = %saved.id,
            transition = transition.as_str(),
            from = %from,
            to = %saved.status,
            "Subscription transition applied"
        );
        self.audit
            .record(
                AuditEntry::builder(action)
                    .user(saved.user_id)
                    .subscription(saved.id)
                    .gateway_ref(&saved.gateway_subscription_id)
                    .actor(actor)
                    .data(serde_json::json!({
                        "transition": transition,
                        "from": from,
                        "to": saved.status,
                        "detail": detail,
                    })),
            )
            .await;
        self.refresh_entitlements(saved.user_id).await;

        Ok((from, saved))
    }

    async fn update_gateway(
        &self,
        sub: &Subscription,
        transition: Transition,
        update: &SubscriptionUpdate,
        actor: &ActorMeta,
    ) -> BillingResult<GatewaySubscription> {
        let outcome = self
            .policy
            .run("update_subscription", || {
                self.gateway
                    .update_subscription(&sub.gateway_subscription_id, update)
            })
            .await;
        match outcome.result {
            Ok(remote) => Ok(remote),
            Err(e) => Err(self.gateway_failed(sub, transition, actor, e).await),
        }
    }

    async fn gateway_failed(
        &self,
        sub: &Subscription,
        transition: Transition,
        actor: &ActorMeta,
        error: GatewayError,
    ) -> BillingError {
        let classified = classify(&error);
        tracing::warn!(
            subscription_id = %sub.id,
            transition = transition.as_str(),
            code = %classified.code,
            error = %error,
            "Gateway rejected lifecycle change"
        );
        self.audit
            .record(
                AuditEntry::builder(AuditAction::TransitionFailed)
                    .user(sub.user_id)
                    .subscription(sub.id)
                    .gateway_ref(&sub.gateway_subscription_id)
                    .actor(actor)
                    .outcome(AuditOutcome::Failure)
                    .data(serde_json::json!({
                        "transition": transition,
                        "from": sub.status,
                        "code": classified.code,
                        "error": error.message,
                    })),
            )
            .await;

        BillingError::Payment(classified)
    }

    async fn refresh_entitlements(&self, user_id: Uuid) {
        if let Err(e) = self.entitlements.refresh(user_id).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to refresh feature access after transition");
        }
    }
}

fn apply_plan(sub: &mut Subscription, plan: &PlanConfig) {
    sub.plan_id = plan.id.clone();
    sub.amount_cents = plan.price_cents;
    sub.interval = plan.interval;
    sub.features = plan.features.iter().cloned().collect();
    sub.limits = plan.limits;
}
