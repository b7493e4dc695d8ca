//! Outbound user notifications
//!
//! Delivery (email, in-app) lives outside the engine. The engine only announces what
//! happened; a failed notification never fails the operation that triggered it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BillingResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    SubscriptionActivated,
    PaymentActionRequired,
    PaymentFailed,
    PaymentRecovered,
    SubscriptionCanceled,
    CancellationScheduled,
    SubscriptionPaused,
    SubscriptionResumed,
    PlanChanged,
    RefundIssued,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubscriptionActivated => "subscription_activated",
            Self::PaymentActionRequired => "payment_action_required",
            Self::PaymentFailed => "payment_failed",
            Self::PaymentRecovered => "payment_recovered",
            Self::SubscriptionCanceled => "subscription_canceled",
            Self::CancellationScheduled => "cancellation_scheduled",
            Self::SubscriptionPaused => "subscription_paused",
            Self::SubscriptionResumed => "subscription_resumed",
            Self::PlanChanged => "plan_changed",
            Self::RefundIssued => "refund_issued",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: Uuid, event: NotificationEvent, payload: serde_json::Value) -> BillingResult<()>;
}

/// Writes notifications to the log; used until a delivery service is wired in
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, user_id: Uuid, event: NotificationEvent, payload: serde_json::Value) -> BillingResult<()> {
        tracing::info!(user_id = %user_id, event = event.as_str(), payload = %payload, "Billing notification");
        Ok(())
    }
}

/// Best-effort wrapper around a [`Notifier`]
#[derive(Clone)]
pub struct Notifications {
    inner: Arc<dyn Notifier>,
}

impl Notifications {
    pub fn new(inner: Arc<dyn Notifier>) -> Self {
        Self { inner }
    }

    pub async fn send(&self, user_id: Uuid, event: NotificationEvent, payload: serde_json::Value) {
        if let Err(e) = self.inner.notify(user_id, event, payload).await {
            tracing::warn!(user_id = %user_id, event = event.as_str(), error = %e, "Failed to send notification");
        }
    }
}
