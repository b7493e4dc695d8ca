//! Error Classifier
//!
//! Maps raw gateway failures onto the closed error taxonomy. Callers never see a raw
//! [`GatewayError`]: every gateway exception passes through [`classify`] first.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, ErrorResponse, RecoveryAction};
use crate::gateway::{GatewayError, GatewayErrorCategory, PaymentState};

/// A gateway failure normalized for callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    pub code: ErrorCode,
    pub message: String,
    pub suggestions: Vec<String>,
    pub recovery_action: RecoveryAction,
    pub retryable: bool,
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decline_code: Option<String>,
}

impl ClassifiedError {
    fn new(code: ErrorCode, message: impl Into<String>, recovery_action: RecoveryAction) -> Self {
        Self {
            code,
            message: message.into(),
            suggestions: Vec::new(),
            recovery_action,
            retryable: code.retryable(),
            status_code: code.status_code(),
            decline_code: None,
        }
    }

    fn suggest(mut self, suggestion: &str) -> Self {
        self.suggestions.push(suggestion.to_string());
        self
    }

    /// A subscription was created but its first payment cannot be confirmed
    pub fn verification_failed(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::PaymentVerificationFailed,
            message,
            RecoveryAction::ContactSupport,
        )
        .suggest("Check your subscriptions in a few minutes before trying again")
    }

    pub fn to_response(&self, error_id: Option<String>) -> ErrorResponse {
        ErrorResponse {
            code: self.code,
            title: self.code.title().to_string(),
            message: self.message.clone(),
            suggestions: self.suggestions.clone(),
            recovery_action: Some(self.recovery_action),
            retryable: self.retryable,
            status_code: self.status_code,
            contact_support: self.recovery_action == RecoveryAction::ContactSupport,
            error_id,
        }
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {}", self.code, self.message)
    }
}

/// Classify a raw gateway error
pub fn classify(err: &GatewayError) -> ClassifiedError {
    match err.category {
        GatewayErrorCategory::Card => classify_decline(err.decline_code.as_deref()),
        GatewayErrorCategory::RateLimit => ClassifiedError::new(
            ErrorCode::RateLimit,
            "Our payment provider is busy right now. Please wait a moment and try again.",
            RecoveryAction::WaitAndRetry,
        ),
        GatewayErrorCategory::InvalidRequest => ClassifiedError::new(
            ErrorCode::InvalidRequest,
            "The payment request could not be processed.",
            RecoveryAction::ContactSupport,
        )
        .suggest("Double-check your billing details"),
        GatewayErrorCategory::Authentication => ClassifiedError::new(
            ErrorCode::AuthRequired,
            "Additional verification is required to complete this payment.",
            RecoveryAction::VerifyIdentity,
        )
        .suggest("Complete the verification step with your bank"),
        GatewayErrorCategory::Processing => ClassifiedError::new(
            ErrorCode::ProcessingError,
            "The payment provider had trouble processing this request.",
            RecoveryAction::Retry,
        )
        .suggest("Try again in a few minutes"),
        GatewayErrorCategory::Network => ClassifiedError::new(
            ErrorCode::NetworkError,
            "We could not reach the payment provider.",
            RecoveryAction::Retry,
        )
        .suggest("Check your subscriptions before retrying; the charge may have gone through"),
        GatewayErrorCategory::Unknown => ClassifiedError::new(
            ErrorCode::UnknownError,
            "An unexpected payment error occurred.",
            RecoveryAction::ContactSupport,
        ),
    }
}

/// Classify the payment state of a freshly created subscription. `None` means the
/// payment went through (or was not needed).
pub fn classify_payment_state(state: &PaymentState) -> Option<ClassifiedError> {
    match state {
        PaymentState::Succeeded | PaymentState::NotRequired => None,
        PaymentState::RequiresAction { .. } => Some(classify(&GatewayError::new(
            GatewayErrorCategory::Authentication,
            "payment requires customer action",
        ))),
        PaymentState::RequiresPaymentMethod { decline_code, .. } => {
            Some(classify_decline(decline_code.as_deref()))
        }
        PaymentState::Processing => Some(ClassifiedError::verification_failed(
            "Your payment is still being processed. We'll activate your plan as soon as it clears.",
        )),
    }
}

fn classify_decline(decline_code: Option<&str>) -> ClassifiedError {
    if decline_code == Some("authentication_required") {
        let mut classified = classify(&GatewayError::new(
            GatewayErrorCategory::Authentication,
            "authentication required",
        ));
        classified.decline_code = decline_code.map(str::to_string);
        return classified;
    }

    let (message, suggestion) = match decline_code {
        Some("insufficient_funds") => (
            "Your card has insufficient funds.",
            "Use a different card or add funds to this one",
        ),
        Some("expired_card") => (
            "Your card has expired.",
            "Update your card's expiry date or use a different card",
        ),
        Some("incorrect_cvc") | Some("invalid_cvc") => (
            "Your card's security code is incorrect.",
            "Re-enter the security code on the back of your card",
        ),
        Some("incorrect_number") | Some("invalid_number") => (
            "Your card number is incorrect.",
            "Re-enter your card number",
        ),
        Some("lost_card") | Some("stolen_card") | Some("pickup_card") => (
            "Your card was declined.",
            "Contact your bank or use a different card",
        ),
        Some("card_velocity_exceeded") => (
            "Your card has exceeded its spending limit.",
            "Use a different card or contact your bank",
        ),
        Some("processing_error") => (
            "Your bank could not process this card right now.",
            "Try again or use a different card",
        ),
        _ => (
            "Your card was declined.",
            "Try a different payment method",
        ),
    };

    let mut classified = ClassifiedError::new(
        ErrorCode::CardDeclined,
        message,
        RecoveryAction::ChangePaymentMethod,
    )
    .suggest(suggestion);
    classified.decline_code = decline_code.map(str::to_string);
    classified
}
