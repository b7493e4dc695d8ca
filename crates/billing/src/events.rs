//! Billing Audit Module
//!
//! Append-only audit trail for every billing decision. Entries answer:
//! - Why was this purchase rejected?
//! - How many gateway attempts did this charge take?
//! - Who canceled this subscription, and from which status?
//!
//! Appending is fire-and-forget: [`AuditLog::record`] logs sink failures and never
//! returns them, so a broken audit store cannot fail a business operation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    // Purchase flow
    RiskAssessed,
    PaymentAttempt,
    PurchaseRejected,
    PurchaseCompleted,
    PurchaseRequiresAction,
    PurchaseFailed,

    // Lifecycle
    StatusTransition,
    PlanChanged,
    TransitionRejected,
    /// The gateway refused a lifecycle change
    TransitionFailed,

    // Refunds
    RefundIssued,
    RefundSkipped,
    RefundRejected,
    RefundFailed,
    RefundCanceled,
    RefundSynced,

    // Entitlements
    FeatureAccessRefreshed,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::RiskAssessed => "RISK_ASSESSED",
            AuditAction::PaymentAttempt => "PAYMENT_ATTEMPT",
            AuditAction::PurchaseRejected => "PURCHASE_REJECTED",
            AuditAction::PurchaseCompleted => "PURCHASE_COMPLETED",
            AuditAction::PurchaseRequiresAction => "PURCHASE_REQUIRES_ACTION",
            AuditAction::PurchaseFailed => "PURCHASE_FAILED",
            AuditAction::StatusTransition => "STATUS_TRANSITION",
            AuditAction::PlanChanged => "PLAN_CHANGED",
            AuditAction::TransitionRejected => "TRANSITION_REJECTED",
            AuditAction::TransitionFailed => "TRANSITION_FAILED",
            AuditAction::RefundIssued => "REFUND_ISSUED",
            AuditAction::RefundSkipped => "REFUND_SKIPPED",
            AuditAction::RefundRejected => "REFUND_REJECTED",
            AuditAction::RefundFailed => "REFUND_FAILED",
            AuditAction::RefundCanceled => "REFUND_CANCELED",
            AuditAction::RefundSynced => "REFUND_SYNCED",
            AuditAction::FeatureAccessRefreshed => "FEATURE_ACCESS_REFRESHED",
        }
    }

    /// Terminal branches of the purchase flow; exactly one is recorded per request
    pub fn ends_purchase(&self) -> bool {
        matches!(
            self,
            AuditAction::PurchaseRejected
                | AuditAction::PurchaseCompleted
                | AuditAction::PurchaseRequiresAction
                | AuditAction::PurchaseFailed
        )
    }

    /// Terminal branches of an administrative lifecycle change
    pub fn ends_transition(&self) -> bool {
        matches!(
            self,
            AuditAction::StatusTransition
                | AuditAction::PlanChanged
                | AuditAction::TransitionRejected
                | AuditAction::TransitionFailed
        )
    }

    /// Terminal branches of a refund request
    pub fn ends_refund(&self) -> bool {
        matches!(
            self,
            AuditAction::RefundIssued
                | AuditAction::RefundSkipped
                | AuditAction::RefundRejected
                | AuditAction::RefundFailed
        )
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who triggered the event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    /// End user through UI
    User,
    /// Support or billing staff
    Admin,
    /// Scheduled jobs and internal automation
    #[default]
    System,
    /// Payment gateway webhook
    Gateway,
}

impl std::fmt::Display for ActorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActorType::User => write!(f, "user"),
            ActorType::Admin => write!(f, "admin"),
            ActorType::System => write!(f, "system"),
            ActorType::Gateway => write!(f, "gateway"),
        }
    }
}

/// Request metadata attached to every audit entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorMeta {
    pub actor_type: ActorType,
    pub actor_id: Option<Uuid>,
    pub ip: Option<String>,
    pub session_id: Option<String>,
}

impl ActorMeta {
    pub fn system() -> Self {
        Self::default()
    }

    pub fn gateway() -> Self {
        Self {
            actor_type: ActorType::Gateway,
            ..Self::default()
        }
    }

    pub fn user(actor_id: Option<Uuid>, ip: Option<String>, session_id: Option<String>) -> Self {
        Self {
            actor_type: ActorType::User,
            actor_id,
            ip,
            session_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    Failure,
    Rejected,
}

impl AuditOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditOutcome::Success => "success",
            AuditOutcome::Failure => "failure",
            AuditOutcome::Rejected => "rejected",
        }
    }
}

/// An audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub action: AuditAction,
    pub user_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub gateway_ref: Option<String>,
    pub actor: ActorMeta,
    pub outcome: AuditOutcome,
    pub payload: serde_json::Value,
    pub created_at: OffsetDateTime,
}

impl AuditEntry {
    pub fn builder(action: AuditAction) -> AuditEntryBuilder {
        AuditEntryBuilder::new(action)
    }
}

/// Builder for audit entries
pub struct AuditEntryBuilder {
    action: AuditAction,
    user_id: Option<Uuid>,
    subscription_id: Option<Uuid>,
    gateway_ref: Option<String>,
    actor: ActorMeta,
    outcome: AuditOutcome,
    payload: serde_json::Value,
}

impl AuditEntryBuilder {
    pub fn new(action: AuditAction) -> Self {
        Self {
            action,
            user_id: None,
            subscription_id: None,
            gateway_ref: None,
            actor: ActorMeta::system(),
            outcome: AuditOutcome::Success,
            payload: serde_json::json!({}),
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn user_opt(mut self, user_id: Option<Uuid>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn subscription(mut self, subscription_id: Uuid) -> Self {
        self.subscription_id = Some(subscription_id);
        self
    }

    /// Set the gateway-side reference (subscription, refund or event id)
    pub fn gateway_ref(mut self, reference: impl Into<String>) -> Self {
        self.gateway_ref = Some(reference.into());
        self
    }

    pub fn actor(mut self, actor: &ActorMeta) -> Self {
        self.actor = actor.clone();
        self
    }

    pub fn outcome(mut self, outcome: AuditOutcome) -> Self {
        self.outcome = outcome;
        self
    }

    pub fn data(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn build(self) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4(),
            action: self.action,
            user_id: self.user_id,
            subscription_id: self.subscription_id,
            gateway_ref: self.gateway_ref,
            actor: self.actor,
            outcome: self.outcome,
            payload: self.payload,
            created_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Append-only audit store
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: AuditEntry) -> BillingResult<()>;
}

/// Fire-and-forget front for an [`AuditSink`]
#[derive(Clone)]
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub async fn record(&self, builder: AuditEntryBuilder) {
        let entry = builder.build();
        let action = entry.action;
        if let Err(e) = self.sink.append(entry).await {
            tracing::warn!(action = %action, error = %e, "Failed to append audit entry");
        }
    }
}

/// Audit sink backed by the `billing_events` table
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Most recent entries for a user, newest first
    pub async fn entries_for_user(&self, user_id: Uuid, limit: i64) -> BillingResult<Vec<serde_json::Value>> {
        let rows: Vec<(Uuid, String, String, serde_json::Value, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT id, action, outcome, payload, created_at
            FROM billing_events
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, action, outcome, payload, created_at)| {
                serde_json::json!({
                    "id": id,
                    "action": action,
                    "outcome": outcome,
                    "payload": payload,
                    "createdAt": created_at.unix_timestamp(),
                })
            })
            .collect())
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn append(&self, entry: AuditEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events (
                id,
                action,
                user_id,
                subscription_id,
                gateway_ref,
                actor_type,
                actor_id,
                ip,
                session_id,
                outcome,
                payload,
                created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.id)
        .bind(entry.action.as_str())
        .bind(entry.user_id)
        .bind(entry.subscription_id)
        .bind(&entry.gateway_ref)
        .bind(entry.actor.actor_type.to_string())
        .bind(entry.actor.actor_id)
        .bind(&entry.actor.ip)
        .bind(&entry.actor.session_id)
        .bind(entry.outcome.as_str())
        .bind(&entry.payload)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
