//! Billing error types
//!
//! Every failure the engine surfaces to a caller maps onto the closed [`ErrorCode`]
//! taxonomy. Gateway failures arrive already classified (see [`crate::classifier`]).

use carebill_shared::SubscriptionStatus;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::classifier::ClassifiedError;

/// Closed set of error codes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationFailed,
    DuplicateRequest,
    SubscriptionConflict,
    FraudDeclined,
    CardDeclined,
    RateLimit,
    InvalidRequest,
    AuthRequired,
    ProcessingError,
    NetworkError,
    PaymentVerificationFailed,
    UnknownError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::DuplicateRequest => "DUPLICATE_REQUEST",
            Self::SubscriptionConflict => "SUBSCRIPTION_CONFLICT",
            Self::FraudDeclined => "FRAUD_DECLINED",
            Self::CardDeclined => "CARD_DECLINED",
            Self::RateLimit => "RATE_LIMIT",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::ProcessingError => "PROCESSING_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::PaymentVerificationFailed => "PAYMENT_VERIFICATION_FAILED",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// HTTP-style status code
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ValidationFailed | Self::InvalidRequest => 400,
            Self::AuthRequired => 401,
            Self::CardDeclined | Self::PaymentVerificationFailed => 402,
            Self::FraudDeclined => 403,
            Self::DuplicateRequest | Self::SubscriptionConflict => 409,
            Self::RateLimit => 429,
            Self::UnknownError => 500,
            Self::ProcessingError => 502,
            Self::NetworkError => 503,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::ValidationFailed => "Invalid request details",
            Self::DuplicateRequest => "Request already in progress",
            Self::SubscriptionConflict => "Subscription conflict",
            Self::FraudDeclined => "Purchase declined",
            Self::CardDeclined => "Card declined",
            Self::RateLimit => "Too many requests",
            Self::InvalidRequest => "Request could not be processed",
            Self::AuthRequired => "Verification required",
            Self::ProcessingError => "Payment processing error",
            Self::NetworkError => "Connection problem",
            Self::PaymentVerificationFailed => "Payment could not be verified",
            Self::UnknownError => "Something went wrong",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::ProcessingError | Self::NetworkError
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable hint telling the client what to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryAction {
    Retry,
    ChangePaymentMethod,
    ContactSupport,
    WaitAndRetry,
    VerifyIdentity,
}

/// User-facing error body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_action: Option<RecoveryAction>,
    pub retryable: bool,
    pub status_code: u16,
    pub contact_support: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_id: Option<String>,
}

/// Billing-specific errors
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Duplicate request: an identical purchase was submitted moments ago")]
    DuplicateRequest,

    #[error("Subscription conflict: {reason}")]
    SubscriptionConflict {
        reason: String,
        suggestions: Vec<String>,
    },

    #[error("Purchase declined by risk assessment (score {score})")]
    FraudDeclined { score: i32, factors: Vec<String> },

    #[error("Payment failed: {0}")]
    Payment(ClassifiedError),

    #[error("Cannot {action} a subscription in status {from}")]
    InvalidTransition {
        from: SubscriptionStatus,
        action: &'static str,
    },

    #[error("Plan not found: {0}")]
    PlanNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("No refundable charge found for this subscription")]
    NoRefundableCharge,

    #[error("Refund amount ({requested_cents} cents) exceeds refundable amount ({available_cents} cents)")]
    RefundAmountExceedsCharge {
        requested_cents: i64,
        available_cents: i64,
    },

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Map onto the closed taxonomy
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation(_)
            | Self::PlanNotFound(_)
            | Self::RefundAmountExceedsCharge { .. } => ErrorCode::ValidationFailed,
            Self::DuplicateRequest => ErrorCode::DuplicateRequest,
            Self::SubscriptionConflict { .. } | Self::ConcurrentModification(_) => {
                ErrorCode::SubscriptionConflict
            }
            Self::FraudDeclined { .. } => ErrorCode::FraudDeclined,
            Self::Payment(classified) => classified.code,
            Self::InvalidTransition { .. }
            | Self::NotFound(_)
            | Self::NoRefundableCharge
            | Self::WebhookSignatureInvalid => ErrorCode::InvalidRequest,
            Self::Config(_)
            | Self::Database(_)
            | Self::Cache(_)
            | Self::Http(_)
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorCode::UnknownError,
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::InvalidTransition { .. } => 409,
            Self::Payment(classified) => classified.status_code,
            other => other.code().status_code(),
        }
    }

    /// Failures that indicate a bug or an infrastructure outage rather than a bad request
    pub fn is_unexpected(&self) -> bool {
        self.code() == ErrorCode::UnknownError
    }

    /// Render as a user-facing response. Unexpected errors never leak their internals.
    pub fn to_response(&self, error_id: Option<String>) -> ErrorResponse {
        let code = self.code();

        if let Self::Payment(classified) = self {
            return classified.to_response(error_id);
        }

        let (message, suggestions, recovery_action) = match self {
            Self::Validation(msg) => (msg.clone(), Vec::new(), None),
            Self::PlanNotFound(plan) => (
                format!("The plan '{}' does not exist.", plan),
                vec!["Choose a plan from the current catalog".to_string()],
                None,
            ),
            Self::DuplicateRequest => (
                "This purchase is already being processed. Please wait a few seconds before trying again."
                    .to_string(),
                vec!["Check your subscriptions before submitting again".to_string()],
                Some(RecoveryAction::WaitAndRetry),
            ),
            Self::SubscriptionConflict {
                reason,
                suggestions,
            } => (reason.clone(), suggestions.clone(), None),
            Self::ConcurrentModification(_) => (
                "Your subscriptions changed while this request was processed.".to_string(),
                vec!["Refresh and review your subscriptions".to_string()],
                Some(RecoveryAction::Retry),
            ),
            Self::FraudDeclined { .. } => (
                "We were unable to complete this purchase.".to_string(),
                vec!["Contact support if you believe this is a mistake".to_string()],
                Some(RecoveryAction::ContactSupport),
            ),
            Self::RefundAmountExceedsCharge { .. } | Self::NoRefundableCharge => {
                (self.to_string(), Vec::new(), None)
            }
            Self::InvalidTransition { .. } | Self::NotFound(_) | Self::WebhookSignatureInvalid => {
                (self.to_string(), Vec::new(), None)
            }
            _ => (
                "An unexpected error occurred. Our team has been notified.".to_string(),
                vec!["Try again in a few minutes".to_string()],
                Some(RecoveryAction::ContactSupport),
            ),
        };

        ErrorResponse {
            code,
            title: code.title().to_string(),
            message,
            suggestions,
            recovery_action,
            retryable: code.retryable(),
            status_code: self.status_code(),
            contact_support: matches!(code, ErrorCode::UnknownError | ErrorCode::FraudDeclined),
            error_id,
        }
    }
}

/// Opaque id that ties a user-facing error to its log line
pub fn new_error_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
    format!("ERR-{}", &id[..12])
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        BillingError::Database(err.to_string())
    }
}

impl From<redis::RedisError> for BillingError {
    fn from(err: redis::RedisError) -> Self {
        BillingError::Cache(err.to_string())
    }
}

impl From<reqwest::Error> for BillingError {
    fn from(err: reqwest::Error) -> Self {
        BillingError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Serialization(err.to_string())
    }
}

impl From<carebill_shared::SharedError> for BillingError {
    fn from(err: carebill_shared::SharedError) -> Self {
        BillingError::Validation(err.to_string())
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
