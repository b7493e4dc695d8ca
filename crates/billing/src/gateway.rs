//! Payment gateway capability
//!
//! The engine talks to the remote payment service exclusively through [`PaymentGateway`].
//! Adapters translate their native errors into [`GatewayError`], which the
//! [`crate::classifier`] turns into user-facing failures.

use std::collections::HashMap;

use async_trait::async_trait;
use carebill_shared::{RefundStatus, SubscriptionStatus};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Raw error category reported by a gateway adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayErrorCategory {
    /// The card was declined by the issuer
    Card,
    RateLimit,
    InvalidRequest,
    /// The gateway rejected our credentials or the payment needs customer authentication
    Authentication,
    /// Gateway-side failure (5xx)
    Processing,
    /// Transport failure or per-call timeout
    Network,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayError {
    pub category: GatewayErrorCategory,
    pub message: String,
    pub decline_code: Option<String>,
    pub http_status: Option<u16>,
}

impl GatewayError {
    pub fn new(category: GatewayErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
            decline_code: None,
            http_status: None,
        }
    }

    pub fn card_declined(decline_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: GatewayErrorCategory::Card,
            message: message.into(),
            decline_code: Some(decline_code.into()),
            http_status: Some(402),
        }
    }

    pub fn timeout(operation: &str) -> Self {
        Self::new(
            GatewayErrorCategory::Network,
            format!("Gateway call '{}' timed out", operation),
        )
    }

    pub fn not_found(what: &str, id: &str) -> Self {
        Self {
            category: GatewayErrorCategory::InvalidRequest,
            message: format!("No such {}: {}", what, id),
            decline_code: None,
            http_status: Some(404),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.http_status == Some(404)
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.category, self.message)?;
        if let Some(code) = &self.decline_code {
            write!(f, " (decline_code={})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for GatewayError {}

pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCustomer {
    pub id: String,
    pub email: Option<String>,
    pub deleted: bool,
}

/// Outcome of the first payment attempted for a new subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PaymentState {
    Succeeded,
    /// Customer interaction (e.g. 3-D Secure) is needed before the charge can complete
    RequiresAction { client_secret: Option<String> },
    /// The charge was declined; a different payment method is needed
    RequiresPaymentMethod {
        decline_code: Option<String>,
        message: Option<String>,
    },
    Processing,
    /// No payment was due (trials, zero-amount invoices)
    NotRequired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInvoice {
    pub id: String,
    pub subscription_id: Option<String>,
    pub amount_paid_cents: i64,
    pub paid: bool,
    pub charge_id: Option<String>,
    pub payment_state: PaymentState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewaySubscription {
    pub id: String,
    pub customer_id: String,
    pub status: SubscriptionStatus,
    pub price_id: Option<String>,
    pub current_period_start: OffsetDateTime,
    pub current_period_end: OffsetDateTime,
    pub cancel_at_period_end: bool,
    pub latest_invoice: Option<GatewayInvoice>,
}

impl GatewaySubscription {
    /// Payment state of the latest invoice, `NotRequired` when there is none
    pub fn payment_state(&self) -> PaymentState {
        self.latest_invoice
            .as_ref()
            .map(|i| i.payment_state.clone())
            .unwrap_or(PaymentState::NotRequired)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRefund {
    pub id: String,
    pub amount_cents: i64,
    pub status: RefundStatus,
}

#[derive(Debug, Clone, Default)]
pub struct CreateCustomerRequest {
    pub email: String,
    pub metadata: HashMap<String, String>,
    /// Replays of the same key return the customer created by the first call
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Default)]
pub struct CreateSubscriptionRequest {
    pub customer_id: String,
    pub price_id: String,
    pub payment_method_id: Option<String>,
    pub metadata: HashMap<String, String>,
    /// Replays of the same key return the subscription created by the first call
    pub idempotency_key: String,
}

/// Whether collection on a subscription is suspended or restored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionChange {
    /// Void invoices while paused
    Pause,
    Resume,
}

#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub price_id: Option<String>,
    pub cancel_at_period_end: Option<bool>,
    /// Cancel immediately instead of updating
    pub cancel_now: bool,
    pub collection: Option<CollectionChange>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateRefundRequest {
    pub charge_id: String,
    pub amount_cents: i64,
    pub reason: String,
    pub metadata: HashMap<String, String>,
}

/// Customer, payment-method, subscription, invoice and refund operations on a remote
/// payment service
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_customer(&self, request: &CreateCustomerRequest) -> GatewayResult<GatewayCustomer>;

    async fn retrieve_customer(&self, customer_id: &str) -> GatewayResult<GatewayCustomer>;

    async fn attach_payment_method(&self, customer_id: &str, payment_method_id: &str) -> GatewayResult<()>;

    async fn create_subscription(
        &self,
        request: &CreateSubscriptionRequest,
    ) -> GatewayResult<GatewaySubscription>;

    async fn retrieve_subscription(&self, subscription_id: &str) -> GatewayResult<GatewaySubscription>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: &SubscriptionUpdate,
    ) -> GatewayResult<GatewaySubscription>;

    async fn retrieve_invoice(&self, invoice_id: &str) -> GatewayResult<GatewayInvoice>;

    async fn create_refund(&self, request: &CreateRefundRequest) -> GatewayResult<GatewayRefund>;

    async fn cancel_refund(&self, refund_id: &str) -> GatewayResult<GatewayRefund>;

    async fn retrieve_refund(&self, refund_id: &str) -> GatewayResult<GatewayRefund>;
}
