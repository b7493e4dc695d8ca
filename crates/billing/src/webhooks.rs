//! Stripe webhook handling
//!
//! Verifies the `Stripe-Signature` header, de-duplicates deliveries by event id and
//! feeds invoice and subscription events into the lifecycle state machine.

use std::sync::Arc;

use carebill_shared::SubscriptionStatus;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::events::ActorMeta;
use crate::gateway::GatewaySubscription;
use crate::lifecycle::{InvoicePayment, SubscriptionLifecycle};
use crate::store::BillingStore;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed delivery, in seconds
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// A parsed webhook delivery
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: WebhookData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookData {
    pub object: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Already handled in an earlier delivery
    Duplicate,
    /// Acknowledged without changes
    Ignored(String),
}

pub struct WebhookProcessor {
    secret: String,
    store: Arc<dyn BillingStore>,
    lifecycle: Arc<SubscriptionLifecycle>,
}

impl WebhookProcessor {
    pub fn new(secret: impl Into<String>, store: Arc<dyn BillingStore>, lifecycle: Arc<SubscriptionLifecycle>) -> Self {
        Self {
            secret: secret.into(),
            store,
            lifecycle,
        }
    }

    /// Verify and parse a webhook payload
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<WebhookEvent> {
        self.verify_event_at(payload, signature, OffsetDateTime::now_utc().unix_timestamp())
    }

    fn verify_event_at(&self, payload: &str, signature: &str, now: i64) -> BillingResult<WebhookEvent> {
        if self.secret.is_empty() {
            return Err(BillingError::Config("webhook secret is not configured".to_string()));
        }

        // t=timestamp,v1=signature[,v1=signature...]
        let mut timestamp: Option<i64> = None;
        let mut candidates = Vec::new();
        for part in signature.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Missing timestamp in webhook signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        if candidates.is_empty() {
            tracing::warn!("Missing v1 signature in webhook signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        }
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(timestamp, now, "Webhook timestamp outside tolerance");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let signed_payload = format!("{}.{}", timestamp, payload);
        let verified = candidates.iter().any(|candidate| {
            let Ok(expected) = hex::decode(candidate) else {
                return false;
            };
            let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.as_bytes()) else {
                return false;
            };
            mac.update(signed_payload.as_bytes());
            mac.verify_slice(&expected).is_ok()
        });
        if !verified {
            tracing::warn!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        serde_json::from_str(payload).map_err(|e| BillingError::Validation(format!("malformed webhook payload: {}", e)))
    }

    /// Apply a verified event. Each event id is processed at most once; a failed
    /// attempt releases its claim so the gateway's redelivery can retry it.
    pub async fn handle_event(&self, event: WebhookEvent) -> BillingResult<WebhookOutcome> {
        if !self.store.claim_webhook_event(&event.id, &event.event_type).await? {
            tracing::info!(event_id = %event.id, event_type = %event.event_type, "Duplicate webhook delivery");
            return Ok(WebhookOutcome::Duplicate);
        }

        match self.dispatch(&event).await {
            Ok(outcome) => {
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    outcome = ?outcome,
                    "Processed webhook"
                );
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(event_id = %event.id, event_type = %event.event_type, error = %e, "Webhook processing failed");
                if let Err(release) = self.store.release_webhook_event(&event.id).await {
                    tracing::error!(event_id = %event.id, error = %release, "Failed to release webhook claim");
                }
                Err(e)
            }
        }
    }

    async fn dispatch(&self, event: &WebhookEvent) -> BillingResult<WebhookOutcome> {
        let object = &event.data.object;
        let actor = ActorMeta::gateway();

        match event.event_type.as_str() {
            "invoice.payment_succeeded" | "invoice.paid" => {
                let invoice = parse_invoice(object)?;
                let Some(sub_id) = self.local_subscription(invoice.subscription.as_deref()).await? else {
                    return Ok(WebhookOutcome::Ignored("unknown subscription".to_string()));
                };
                let payment = InvoicePayment {
                    invoice_id: invoice.id,
                    amount_paid_cents: invoice.amount_paid,
                    period: invoice.period,
                };
                acknowledge(self.lifecycle.record_payment_succeeded(sub_id, &payment, &actor).await)
            }
            "invoice.payment_failed" => {
                let invoice = parse_invoice(object)?;
                let Some(sub_id) = self.local_subscription(invoice.subscription.as_deref()).await? else {
                    return Ok(WebhookOutcome::Ignored("unknown subscription".to_string()));
                };
                acknowledge(self.lifecycle.record_payment_failed(sub_id, &invoice.id, &actor).await)
            }
            "customer.subscription.updated" => {
                let remote = parse_subscription(object)?;
                let Some(sub_id) = self.local_subscription(Some(&remote.id)).await? else {
                    return Ok(WebhookOutcome::Ignored("unknown subscription".to_string()));
                };
                acknowledge(self.lifecycle.sync_from_gateway(sub_id, &remote, &actor).await)
            }
            "customer.subscription.deleted" => {
                let remote_id = string_field(object, "id")
                    .ok_or_else(|| BillingError::Validation("subscription event without id".to_string()))?;
                let Some(sub_id) = self.local_subscription(Some(&remote_id)).await? else {
                    return Ok(WebhookOutcome::Ignored("unknown subscription".to_string()));
                };
                acknowledge(self.lifecycle.mark_canceled_by_gateway(sub_id, &actor).await)
            }
            other => {
                tracing::debug!(event_type = %other, "Unhandled webhook type");
                Ok(WebhookOutcome::Ignored(format!("unhandled type {}", other)))
            }
        }
    }

    async fn local_subscription(&self, gateway_id: Option<&str>) -> BillingResult<Option<uuid::Uuid>> {
        let Some(gateway_id) = gateway_id else {
            return Ok(None);
        };
        let found = self.store.find_subscription_by_external_id(gateway_id).await?;
        if found.is_none() {
            tracing::info!(gateway_subscription_id = %gateway_id, "Webhook for unknown subscription");
        }
        Ok(found.map(|s| s.id))
    }
}

/// Events that arrive out of order (e.g. a payment for an already canceled
/// subscription) are acknowledged rather than retried forever.
fn acknowledge<T>(result: BillingResult<T>) -> BillingResult<WebhookOutcome> {
    match result {
        Ok(_) => Ok(WebhookOutcome::Processed),
        Err(BillingError::InvalidTransition { from, action }) => {
            Ok(WebhookOutcome::Ignored(format!("cannot {} a {} subscription", action, from)))
        }
        Err(BillingError::NotFound(what)) => Ok(WebhookOutcome::Ignored(format!("{} not found", what))),
        Err(e) => Err(e),
    }
}

struct InvoiceObject {
    id: String,
    subscription: Option<String>,
    amount_paid: i64,
    period: Option<(OffsetDateTime, OffsetDateTime)>,
}

fn parse_invoice(object: &serde_json::Value) -> BillingResult<InvoiceObject> {
    let id = string_field(object, "id")
        .ok_or_else(|| BillingError::Validation("invoice event without id".to_string()))?;

    // Newer API versions move the subscription under parent.subscription_details
    let subscription = string_field(object, "subscription").or_else(|| {
        object
            .pointer("/parent/subscription_details/subscription")
            .and_then(id_of)
    });

    let line_period = object.pointer("/lines/data/0/period");
    let period = line_period.and_then(|p| {
        let start = timestamp(p.get("start")?)?;
        let end = timestamp(p.get("end")?)?;
        Some((start, end))
    });

    Ok(InvoiceObject {
        id,
        subscription,
        amount_paid: object.get("amount_paid").and_then(|v| v.as_i64()).unwrap_or(0),
        period,
    })
}

fn parse_subscription(object: &serde_json::Value) -> BillingResult<GatewaySubscription> {
    let invalid = |what: &str| BillingError::Validation(format!("subscription event without {}", what));

    let id = string_field(object, "id").ok_or_else(|| invalid("id"))?;
    let paused = object.get("pause_collection").is_some_and(|v| !v.is_null());
    let raw_status = object
        .get("status")
        .and_then(|v| v.as_str())
        .ok_or_else(|| invalid("status"))?;
    let status = gateway_status(raw_status, paused).ok_or_else(|| invalid("known status"))?;

    let item = object.pointer("/items/data/0");
    let period_field = |name: &str| {
        object
            .get(name)
            .and_then(timestamp)
            .or_else(|| item.and_then(|i| i.get(name)).and_then(timestamp))
    };

    Ok(GatewaySubscription {
        id,
        customer_id: object.get("customer").and_then(id_of).unwrap_or_default(),
        status,
        price_id: item.and_then(|i| i.pointer("/price/id")).and_then(id_of),
        current_period_start: period_field("current_period_start").ok_or_else(|| invalid("period start"))?,
        current_period_end: period_field("current_period_end").ok_or_else(|| invalid("period end"))?,
        cancel_at_period_end: object
            .get("cancel_at_period_end")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        latest_invoice: None,
    })
}

fn gateway_status(raw: &str, paused_collection: bool) -> Option<SubscriptionStatus> {
    if paused_collection {
        return Some(SubscriptionStatus::Paused);
    }
    match raw {
        "unpaid" => Some(SubscriptionStatus::PastDue),
        "incomplete_expired" => Some(SubscriptionStatus::Canceled),
        other => other.parse().ok(),
    }
}

fn string_field(object: &serde_json::Value, name: &str) -> Option<String> {
    object.get(name).and_then(id_of)
}

/// An expandable field is either an id string or an object with an `id`
fn id_of(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Object(map) => map.get("id").and_then(|v| v.as_str()).map(str::to_string),
        _ => None,
    }
}

fn timestamp(value: &serde_json::Value) -> Option<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(value.as_i64()?).ok()
}
