//! Refund Processor
//!
//! Full, partial and prorated refunds against the subscription's current invoice.
//!
//! ## Ceiling
//!
//! Pending and succeeded refunds against an invoice never add up to more than the
//! amount that invoice captured. Requests that would break the ceiling are rejected
//! before the gateway is called. A refund the gateway refuses is classified and
//! returned; nothing is recorded for it.

use std::collections::HashMap;
use std::sync::Arc;

use carebill_shared::{RefundRecord, RefundStatus, RefundType, Subscription};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::classifier::classify;
use crate::entitlement::FeatureAccessAggregator;
use crate::error::{BillingError, BillingResult};
use crate::events::{ActorMeta, AuditAction, AuditEntry, AuditLog, AuditOutcome};
use crate::gateway::{CreateRefundRequest, GatewayError, PaymentGateway};
use crate::notify::{NotificationEvent, Notifications};
use crate::orchestrator::RetryPolicy;
use crate::store::BillingStore;

const SAVE_ATTEMPTS: u32 = 3;
const SECONDS_PER_DAY: i64 = 86_400;
const DEFAULT_REASON: &str = "requested_by_customer";

/// Whole days in a span, rounded up
fn ceil_days(span: time::Duration) -> i64 {
    let secs = span.whole_seconds().max(0);
    (secs + SECONDS_PER_DAY - 1) / SECONDS_PER_DAY
}

/// `floor(paid × remaining / total)` over whole days of the period
pub fn calculate_prorated_amount(
    paid_cents: i64,
    period_start: OffsetDateTime,
    period_end: OffsetDateTime,
    now: OffsetDateTime,
) -> i64 {
    let total_days = ceil_days(period_end - period_start).max(1);
    let used_days = ceil_days(now - period_start).min(total_days);
    let remaining = total_days - used_days;

    // i128 keeps paid × remaining from overflowing on large amounts
    ((paid_cents.max(0) as i128 * remaining as i128) / total_days as i128) as i64
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RefundRequest {
    pub reason: Option<String>,
    pub admin_note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RefundOutcome {
    Issued {
        #[serde(rename = "subscriptionId")]
        subscription_id: Uuid,
        refund: RefundRecord,
    },
    /// The prorated amount fell under the minimum refundable amount; nothing is owed, so
    /// `calculated_cents` is always 0
    NoRefundNeeded {
        #[serde(rename = "calculatedCents")]
        calculated_cents: i64,
    },
}

pub struct RefundProcessor {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    entitlements: Arc<FeatureAccessAggregator>,
    audit: AuditLog,
    notifications: Notifications,
    /// Refund creation is not retried; a lost response could otherwise refund twice
    policy: RetryPolicy,
    min_refund_cents: i64,
}

impl RefundProcessor {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        entitlements: Arc<FeatureAccessAggregator>,
        audit: AuditLog,
        notifications: Notifications,
        policy: RetryPolicy,
        min_refund_cents: i64,
    ) -> Self {
        Self {
            store,
            gateway,
            entitlements,
            audit,
            notifications,
            policy: RetryPolicy {
                max_attempts: 1,
                ..policy
            },
            min_refund_cents,
        }
    }

    /// Refund everything still refundable on the current invoice
    pub async fn full_refund(
        &self,
        subscription_id: Uuid,
        request: &RefundRequest,
        actor: &ActorMeta,
    ) -> BillingResult<RefundOutcome> {
        self.issue(subscription_id, RefundType::Full, None, request, actor).await
    }

    pub async fn partial_refund(
        &self,
        subscription_id: Uuid,
        amount_cents: i64,
        request: &RefundRequest,
        actor: &ActorMeta,
    ) -> BillingResult<RefundOutcome> {
        self.issue(subscription_id, RefundType::Partial, Some(amount_cents), request, actor)
            .await
    }

    /// Refund the unused share of the current period
    pub async fn prorated_refund(
        &self,
        subscription_id: Uuid,
        request: &RefundRequest,
        actor: &ActorMeta,
    ) -> BillingResult<RefundOutcome> {
        self.issue(subscription_id, RefundType::Prorated, None, request, actor)
            .await
    }

    async fn issue(
        &self,
        subscription_id: Uuid,
        refund_type: RefundType,
        requested_cents: Option<i64>,
        request: &RefundRequest,
        actor: &ActorMeta,
    ) -> BillingResult<RefundOutcome> {
        let sub = match self.store.find_subscription(subscription_id).await? {
            Some(sub) => sub,
            None => {
                let err = BillingError::NotFound(format!("subscription {}", subscription_id));
                return Err(self.reject(subscription_id, None, refund_type, err, actor).await);
            }
        };

        let Some(invoice_id) = sub.latest_invoice_id.clone() else {
            return Err(self
                .reject(sub.id, Some(sub.user_id), refund_type, BillingError::NoRefundableCharge, actor)
                .await);
        };
        let available = sub.amount_paid_cents - sub.refunded_against(&invoice_id);
        if available <= 0 {
            return Err(self
                .reject(sub.id, Some(sub.user_id), refund_type, BillingError::NoRefundableCharge, actor)
                .await);
        }

        let amount = match refund_type {
            RefundType::Full => available,
            RefundType::Partial => {
                let requested = requested_cents.unwrap_or(0);
                if requested <= 0 {
                    let err = BillingError::Validation("Refund amount must be positive".to_string());
                    return Err(self.reject(sub.id, Some(sub.user_id), refund_type, err, actor).await);
                }
                if requested > available {
                    let err = BillingError::RefundAmountExceedsCharge {
                        requested_cents: requested,
                        available_cents: available,
                    };
                    return Err(self.reject(sub.id, Some(sub.user_id), refund_type, err, actor).await);
                }
                requested
            }
            RefundType::Prorated => {
                let calculated = calculate_prorated_amount(
                    sub.amount_paid_cents,
                    sub.current_period_start,
                    sub.current_period_end,
                    OffsetDateTime::now_utc(),
                )
                .min(available);

                if calculated < self.min_refund_cents {
                    tracing::info!(
                        subscription_id = %sub.id,
                        calculated_cents = calculated,
                        "Prorated refund below minimum, skipping"
                    );
                    self.audit
                        .record(
                            AuditEntry::builder(AuditAction::RefundSkipped)
                                .user(sub.user_id)
                                .subscription(sub.id)
                                .actor(actor)
                                .data(serde_json::json!({
                                    "refundType": refund_type,
                                    "calculatedCents": calculated,
                                    "minimumCents": self.min_refund_cents,
                                })),
                        )
                        .await;
                    // The raw amount stays in the audit entry; callers only see that nothing is owed
                    return Ok(RefundOutcome::NoRefundNeeded { calculated_cents: 0 });
                }
                calculated
            }
        };

        let charge_id = match self.charge_for(&invoice_id).await {
            Ok(Some(charge_id)) => charge_id,
            Ok(None) => {
                return Err(self
                    .reject(sub.id, Some(sub.user_id), refund_type, BillingError::NoRefundableCharge, actor)
                    .await)
            }
            Err(e) => return Err(self.failed(&sub, refund_type, amount, e, actor).await),
        };

        let reason = request
            .reason
            .clone()
            .unwrap_or_else(|| DEFAULT_REASON.to_string());
        let mut metadata = HashMap::new();
        metadata.insert("subscription_id".to_string(), sub.id.to_string());
        metadata.insert("refund_type".to_string(), refund_type.as_str().to_string());
        let create = CreateRefundRequest {
            charge_id,
            amount_cents: amount,
            reason: reason.clone(),
            metadata,
        };

        let outcome = self
            .policy
            .run("create_refund", || self.gateway.create_refund(&create))
            .await;
        let remote = match outcome.result {
            Ok(remote) => remote,
            Err(e) => return Err(self.failed(&sub, refund_type, amount, e, actor).await),
        };

        let now = OffsetDateTime::now_utc();
        let record = RefundRecord {
            gateway_refund_id: remote.id.clone(),
            invoice_id: invoice_id.clone(),
            amount_cents: remote.amount_cents,
            reason,
            refund_type,
            status: remote.status,
            created_at: now,
            updated_at: now,
            admin_note: request.admin_note.clone(),
        };

        let pushed = record.clone();
        if let Err(e) = self
            .modify(sub.id, move |s| {
                s.refunds.push(pushed.clone());
                Ok(())
            })
            .await
        {
            tracing::error!(
                subscription_id = %sub.id,
                gateway_refund_id = %remote.id,
                error = %e,
                "Refund issued by gateway but not recorded"
            );
            self.audit
                .record(
                    AuditEntry::builder(AuditAction::RefundFailed)
                        .user(sub.user_id)
                        .subscription(sub.id)
                        .gateway_ref(&remote.id)
                        .actor(actor)
                        .outcome(AuditOutcome::Failure)
                        .data(serde_json::json!({
                            "refundType": refund_type,
                            "amountCents": amount,
                            "error": e.to_string(),
                            "gatewayIssued": true,
                        })),
                )
                .await;
            return Err(e);
        }

        tracing::info!(
            subscription_id = %sub.id,
            gateway_refund_id = %record.gateway_refund_id,
            amount_cents = record.amount_cents,
            refund_type = refund_type.as_str(),
            status = record.status.as_str(),
            "Refund issued"
        );
        self.audit
            .record(
                AuditEntry::builder(AuditAction::RefundIssued)
                    .user(sub.user_id)
                    .subscription(sub.id)
                    .gateway_ref(&record.gateway_refund_id)
                    .actor(actor)
                    .data(serde_json::json!({
                        "refundType": refund_type,
                        "amountCents": record.amount_cents,
                        "invoiceId": invoice_id,
                        "status": record.status,
                        "reason": record.reason,
                    })),
            )
            .await;
        if let Err(e) = self.entitlements.refresh(sub.user_id).await {
            tracing::warn!(user_id = %sub.user_id, error = %e, "Failed to refresh feature access after refund");
        }
        self.notifications
            .send(
                sub.user_id,
                NotificationEvent::RefundIssued,
                serde_json::json!({
                    "planId": sub.plan_id,
                    "amountCents": record.amount_cents,
                    "refundType": refund_type,
                }),
            )
            .await;

        Ok(RefundOutcome::Issued {
            subscription_id: sub.id,
            refund: record,
        })
    }

    /// Cancel a refund the gateway has not settled yet
    pub async fn cancel_refund(
        &self,
        subscription_id: Uuid,
        gateway_refund_id: &str,
        actor: &ActorMeta,
    ) -> BillingResult<RefundRecord> {
        let sub = self.load(subscription_id).await?;
        let record = find_refund(&sub, gateway_refund_id)?;
        if record.status != RefundStatus::Pending {
            return Err(BillingError::Validation(format!(
                "Refund {} is {} and can no longer be canceled",
                gateway_refund_id,
                record.status.as_str()
            )));
        }

        let outcome = self
            .policy
            .run("cancel_refund", || self.gateway.cancel_refund(gateway_refund_id))
            .await;
        let remote = outcome.result.map_err(|e| {
            tracing::warn!(gateway_refund_id = %gateway_refund_id, error = %e, "Gateway refused to cancel refund");
            BillingError::Payment(classify(&e))
        })?;

        let updated = self.set_status(sub.id, gateway_refund_id, remote.status).await?;
        tracing::info!(
            subscription_id = %sub.id,
            gateway_refund_id = %gateway_refund_id,
            "Refund canceled"
        );
        self.audit
            .record(
                AuditEntry::builder(AuditAction::RefundCanceled)
                    .user(sub.user_id)
                    .subscription(sub.id)
                    .gateway_ref(gateway_refund_id)
                    .actor(actor)
                    .data(serde_json::json!({
                        "amountCents": updated.amount_cents,
                        "status": updated.status,
                    })),
            )
            .await;
        Ok(updated)
    }

    /// Pull the refund's current status from the gateway and store it
    pub async fn sync_refund_status(
        &self,
        subscription_id: Uuid,
        gateway_refund_id: &str,
        actor: &ActorMeta,
    ) -> BillingResult<RefundRecord> {
        let sub = self.load(subscription_id).await?;
        let record = find_refund(&sub, gateway_refund_id)?.clone();

        let outcome = self
            .policy
            .run("retrieve_refund", || self.gateway.retrieve_refund(gateway_refund_id))
            .await;
        let remote = outcome
            .result
            .map_err(|e| BillingError::Payment(classify(&e)))?;
        if remote.status == record.status {
            return Ok(record);
        }

        let updated = self.set_status(sub.id, gateway_refund_id, remote.status).await?;
        tracing::info!(
            gateway_refund_id = %gateway_refund_id,
            from = record.status.as_str(),
            to = updated.status.as_str(),
            "Refund status synced"
        );
        self.audit
            .record(
                AuditEntry::builder(AuditAction::RefundSynced)
                    .user(sub.user_id)
                    .subscription(sub.id)
                    .gateway_ref(gateway_refund_id)
                    .actor(actor)
                    .data(serde_json::json!({
                        "from": record.status,
                        "to": updated.status,
                    })),
            )
            .await;
        Ok(updated)
    }

    async fn load(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        self.store
            .find_subscription(subscription_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("subscription {}", subscription_id)))
    }

    async fn charge_for(&self, invoice_id: &str) -> Result<Option<String>, GatewayError> {
        let invoice = self
            .policy
            .run("retrieve_invoice", || self.gateway.retrieve_invoice(invoice_id))
            .await
            .result?;
        Ok(invoice.charge_id.filter(|_| invoice.paid))
    }

    async fn set_status(
        &self,
        subscription_id: Uuid,
        gateway_refund_id: &str,
        status: RefundStatus,
    ) -> BillingResult<RefundRecord> {
        let saved = self
            .modify(subscription_id, |s| {
                let record = s.find_refund_mut(gateway_refund_id).ok_or_else(|| {
                    BillingError::NotFound(format!("refund {}", gateway_refund_id))
                })?;
                record.status = status;
                record.updated_at = OffsetDateTime::now_utc();
                Ok(())
            })
            .await?;
        find_refund(&saved, gateway_refund_id).cloned()
    }

    /// Reload-mutate-save until the version check passes
    async fn modify<F>(&self, subscription_id: Uuid, mut mutate: F) -> BillingResult<Subscription>
    where
        F: FnMut(&mut Subscription) -> BillingResult<()> + Send,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut sub = self.load(subscription_id).await?;
            mutate(&mut sub)?;
            match self.store.save_subscription(&sub).await {
                Ok(saved) => return Ok(saved),
                Err(BillingError::ConcurrentModification(_)) if attempt < SAVE_ATTEMPTS => {
                    tracing::debug!(subscription_id = %subscription_id, attempt = attempt, "Version conflict, retrying refund write");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn reject(
        &self,
        subscription_id: Uuid,
        user_id: Option<Uuid>,
        refund_type: RefundType,
        err: BillingError,
        actor: &ActorMeta,
    ) -> BillingError {
        tracing::info!(
            subscription_id = %subscription_id,
            refund_type = refund_type.as_str(),
            error = %err,
            "Refund rejected"
        );
        self.audit
            .record(
                AuditEntry::builder(AuditAction::RefundRejected)
                    .user_opt(user_id)
                    .subscription(subscription_id)
                    .actor(actor)
                    .outcome(AuditOutcome::Rejected)
                    .data(serde_json::json!({
                        "refundType": refund_type,
                        "code": err.code(),
                        "reason": err.to_string(),
                    })),
            )
            .await;
        err
    }

    async fn failed(
        &self,
        sub: &Subscription,
        refund_type: RefundType,
        amount_cents: i64,
        error: GatewayError,
        actor: &ActorMeta,
    ) -> BillingError {
        let classified = classify(&error);
        tracing::warn!(
            subscription_id = %sub.id,
            refund_type = refund_type.as_str(),
            code = %classified.code,
            error = %error,
            "Gateway refund failed"
        );
        self.audit
            .record(
                AuditEntry::builder(AuditAction::RefundFailed)
                    .user(sub.user_id)
                    .subscription(sub.id)
                    .actor(actor)
                    .outcome(AuditOutcome::Failure)
                    .data(serde_json::json!({
                        "refundType": refund_type,
                        "amountCents": amount_cents,
                        "code": classified.code,
                        "error": error.message,
                    })),
            )
            .await;
        BillingError::Payment(classified)
    }
}

fn find_refund<'a>(sub: &'a Subscription, gateway_refund_id: &str) -> BillingResult<&'a RefundRecord> {
    sub.refunds
        .iter()
        .find(|r| r.gateway_refund_id == gateway_refund_id)
        .ok_or_else(|| BillingError::NotFound(format!("refund {}", gateway_refund_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::test_support::Harness;
    use carebill_shared::SubscriptionStatus;

    async fn setup(plan: &str) -> (Harness, Subscription) {
        let h = Harness::new();
        let user = h.seed_user("morgan@clinic.example", time::Duration::days(40)).await;
        let sub = h.seed_subscription(user.id, plan, SubscriptionStatus::Active).await;
        (h, sub)
    }

    fn issued(outcome: RefundOutcome) -> RefundRecord {
        match outcome {
            RefundOutcome::Issued { refund, .. } => refund,
            other => panic!("expected a refund, got {:?}", other),
        }
    }

    #[test]
    fn test_prorated_ten_of_thirty_days_used() {
        let start = OffsetDateTime::now_utc();
        let end = start + time::Duration::days(30);
        let amount = calculate_prorated_amount(18240, start, end, start + time::Duration::days(10));
        assert_eq!(amount, 12160);
    }

    #[test]
    fn test_prorated_boundaries() {
        let start = OffsetDateTime::now_utc();
        let end = start + time::Duration::days(30);
        assert_eq!(calculate_prorated_amount(18240, start, end, start), 18240);
        assert_eq!(calculate_prorated_amount(18240, start, end, end), 0);
        assert_eq!(
            calculate_prorated_amount(18240, start, end, end + time::Duration::days(3)),
            0
        );
        // Partial days count as used
        assert_eq!(
            calculate_prorated_amount(3000, start, end, start + time::Duration::hours(1)),
            2900
        );
    }

    #[tokio::test]
    async fn test_full_refund_then_nothing_left() {
        let (h, sub) = setup("nursing-pro").await;
        let refunds = &h.service.refunds;
        let actor = ActorMeta::system();

        let refund = issued(
            refunds
                .full_refund(sub.id, &RefundRequest::default(), &actor)
                .await
                .unwrap(),
        );
        assert_eq!(refund.amount_cents, sub.amount_paid_cents);
        assert_eq!(refund.refund_type, RefundType::Full);

        let stored = h.store.find_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.refunds.len(), 1);

        let err = refunds
            .full_refund(sub.id, &RefundRequest::default(), &actor)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::NoRefundableCharge));
        assert_eq!(h.gateway.call_count("create_refund"), 1);
        assert_eq!(h.audit.count(AuditAction::RefundIssued).await, 1);
        assert_eq!(h.audit.count(AuditAction::RefundRejected).await, 1);
    }

    #[tokio::test]
    async fn test_partial_refund_over_ceiling_never_reaches_gateway() {
        let (h, sub) = setup("pt-pro").await;
        let refunds = &h.service.refunds;
        let actor = ActorMeta::system();

        let first = issued(
            refunds
                .partial_refund(sub.id, sub.amount_paid_cents - 100, &RefundRequest::default(), &actor)
                .await
                .unwrap(),
        );
        assert_eq!(first.refund_type, RefundType::Partial);

        let err = refunds
            .partial_refund(sub.id, 101, &RefundRequest::default(), &actor)
            .await
            .unwrap_err();
        match err {
            BillingError::RefundAmountExceedsCharge {
                requested_cents,
                available_cents,
            } => {
                assert_eq!(requested_cents, 101);
                assert_eq!(available_cents, 100);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(h.gateway.call_count("create_refund"), 1);

        assert!(matches!(
            refunds.partial_refund(sub.id, 0, &RefundRequest::default(), &actor).await,
            Err(BillingError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_prorated_refund_below_minimum_is_skipped() {
        let (h, mut sub) = setup("nursing-basic").await;
        sub.current_period_start = OffsetDateTime::now_utc() - time::Duration::days(29) - time::Duration::hours(12);
        sub.current_period_end = sub.current_period_start + time::Duration::days(30);
        let sub = h.store.save_subscription(&sub).await.unwrap();

        let outcome = h
            .service
            .refunds
            .prorated_refund(sub.id, &RefundRequest::default(), &ActorMeta::system())
            .await
            .unwrap();

        assert_eq!(outcome, RefundOutcome::NoRefundNeeded { calculated_cents: 0 });
        assert_eq!(h.gateway.call_count("create_refund"), 0);
        assert_eq!(h.audit.count(AuditAction::RefundSkipped).await, 1);
    }

    #[tokio::test]
    async fn test_nonzero_amount_under_minimum_reports_zero() {
        let (h, mut sub) = setup("nursing-basic").await;
        sub.amount_paid_cents = 1000;
        sub.current_period_start = OffsetDateTime::now_utc() - time::Duration::days(28) - time::Duration::hours(12);
        sub.current_period_end = sub.current_period_start + time::Duration::days(30);
        let sub = h.store.save_subscription(&sub).await.unwrap();
        let raw = calculate_prorated_amount(
            sub.amount_paid_cents,
            sub.current_period_start,
            sub.current_period_end,
            OffsetDateTime::now_utc(),
        );
        assert_eq!(raw, 33);

        let outcome = h
            .service
            .refunds
            .prorated_refund(sub.id, &RefundRequest::default(), &ActorMeta::system())
            .await
            .unwrap();

        assert_eq!(outcome, RefundOutcome::NoRefundNeeded { calculated_cents: 0 });
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            serde_json::json!({ "result": "no_refund_needed", "calculatedCents": 0 })
        );
        assert_eq!(h.gateway.call_count("create_refund"), 0);

        let skipped = h
            .audit
            .entries()
            .await
            .into_iter()
            .find(|e| e.action == AuditAction::RefundSkipped)
            .unwrap();
        assert_eq!(skipped.payload["calculatedCents"], 33);
    }

    #[tokio::test]
    async fn test_prorated_refund_issued() {
        let (h, sub) = setup("provider-pro").await;

        let refund = issued(
            h.service
                .refunds
                .prorated_refund(sub.id, &RefundRequest::default(), &ActorMeta::system())
                .await
                .unwrap(),
        );

        assert_eq!(refund.refund_type, RefundType::Prorated);
        assert!(refund.amount_cents > 0);
        assert!(refund.amount_cents < sub.amount_paid_cents);
    }

    #[tokio::test]
    async fn test_gateway_failure_records_nothing() {
        let (h, sub) = setup("nursing-pro").await;
        h.gateway.always_fail(
            "create_refund",
            GatewayError::new(crate::gateway::GatewayErrorCategory::Processing, "upstream 500"),
        );

        let err = h
            .service
            .refunds
            .full_refund(sub.id, &RefundRequest::default(), &ActorMeta::system())
            .await
            .unwrap_err();

        assert_eq!(err.code(), ErrorCode::ProcessingError);
        // Not retried
        assert_eq!(h.gateway.call_count("create_refund"), 1);
        let stored = h.store.find_subscription(sub.id).await.unwrap().unwrap();
        assert!(stored.refunds.is_empty());
        assert_eq!(h.audit.count(AuditAction::RefundFailed).await, 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_refund_frees_ceiling() {
        let (h, sub) = setup("pt-basic").await;
        let refunds = &h.service.refunds;
        let actor = ActorMeta::system();
        h.gateway.set_refund_status(RefundStatus::Pending);

        let pending = issued(
            refunds
                .full_refund(sub.id, &RefundRequest::default(), &actor)
                .await
                .unwrap(),
        );
        assert_eq!(pending.status, RefundStatus::Pending);

        let canceled = refunds
            .cancel_refund(sub.id, &pending.gateway_refund_id, &actor)
            .await
            .unwrap();
        assert_eq!(canceled.status, RefundStatus::Canceled);

        let stored = h.store.find_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.refunded_against(stored.latest_invoice_id.as_deref().unwrap()), 0);

        // Only pending refunds can be canceled
        assert!(matches!(
            refunds.cancel_refund(sub.id, &pending.gateway_refund_id, &actor).await,
            Err(BillingError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_sync_refund_status() {
        let (h, sub) = setup("nursing-basic").await;
        let refunds = &h.service.refunds;
        let actor = ActorMeta::system();
        h.gateway.set_refund_status(RefundStatus::Pending);

        let pending = issued(
            refunds
                .partial_refund(sub.id, 500, &RefundRequest::default(), &actor)
                .await
                .unwrap(),
        );
        h.gateway.settle_refund(&pending.gateway_refund_id, RefundStatus::Failed);

        let synced = refunds
            .sync_refund_status(sub.id, &pending.gateway_refund_id, &actor)
            .await
            .unwrap();
        assert_eq!(synced.status, RefundStatus::Failed);
        assert_eq!(h.audit.count(AuditAction::RefundSynced).await, 1);

        assert!(matches!(
            refunds.sync_refund_status(sub.id, "re_missing", &actor).await,
            Err(BillingError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_subscription_is_rejected() {
        let h = Harness::new();
        assert!(matches!(
            h.service
                .refunds
                .full_refund(Uuid::new_v4(), &RefundRequest::default(), &ActorMeta::system())
                .await,
            Err(BillingError::NotFound(_))
        ));
        assert_eq!(h.audit.count(AuditAction::RefundRejected).await, 1);
    }
}
