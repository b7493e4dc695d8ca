//! Persisted records owned by the billing engine

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::types::{BillingInterval, FeatureAccess, FeatureLimits, SubscriptionStatus};

/// A user and their denormalized entitlement cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Derived from active subscriptions; `None` means never computed
    pub feature_access: Option<FeatureAccess>,
    /// Optimistic concurrency token, bumped on every successful save
    pub version: i64,
}

impl User {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            created_at: OffsetDateTime::now_utc(),
            feature_access: None,
            version: 0,
        }
    }
}

/// How a refund amount was determined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundType {
    Full,
    Partial,
    Prorated,
}

impl RefundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Partial => "partial",
            Self::Prorated => "prorated",
        }
    }
}

impl std::fmt::Display for RefundType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Gateway-side refund state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Succeeded,
    Failed,
    Canceled,
}

impl RefundStatus {
    /// Pending and succeeded refunds both consume the refundable amount
    pub fn counts_toward_ceiling(&self) -> bool {
        matches!(self, Self::Pending | Self::Succeeded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

/// Refund sub-record of a [`Subscription`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRecord {
    pub gateway_refund_id: String,
    /// Invoice the refund was issued against; ties the refund to a billing period
    pub invoice_id: String,
    pub amount_cents: i64,
    pub reason: String,
    pub refund_type: RefundType,
    pub status: RefundStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub admin_note: Option<String>,
}

/// The durable record of a purchased entitlement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub user_id: Uuid,
    pub plan_id: String,
    pub gateway_customer_id: String,
    pub gateway_subscription_id: String,
    pub latest_invoice_id: Option<String>,
    pub status: SubscriptionStatus,
    pub amount_cents: i64,
    /// Amount captured by `latest_invoice_id`; the ceiling for refunds in the current period
    pub amount_paid_cents: i64,
    pub interval: BillingInterval,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    pub cancel_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paused_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resumed_at: Option<OffsetDateTime>,
    pub failed_payment_count: i32,
    /// Snapshot of the plan at creation (or last plan change)
    pub features: BTreeSet<String>,
    pub limits: FeatureLimits,
    pub refunds: Vec<RefundRecord>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub version: i64,
}

impl Subscription {
    pub fn is_entitled(&self) -> bool {
        self.status.is_entitled()
    }

    /// Refunds already issued against the given invoice that still hold money back
    pub fn refunded_against(&self, invoice_id: &str) -> i64 {
        self.refunds
            .iter()
            .filter(|r| r.invoice_id == invoice_id && r.status.counts_toward_ceiling())
            .map(|r| r.amount_cents)
            .sum()
    }

    pub fn find_refund_mut(&mut self, gateway_refund_id: &str) -> Option<&mut RefundRecord> {
        self.refunds
            .iter_mut()
            .find(|r| r.gateway_refund_id == gateway_refund_id)
    }
}
