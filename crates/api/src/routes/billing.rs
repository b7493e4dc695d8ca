//! Purchase flow and Stripe webhooks

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use carebill_billing::{PurchaseReceipt, PurchaseRequest, PurchaseStatus, WebhookOutcome};
use serde_json::json;

use crate::{
    actor::Actor,
    error::{ApiError, ApiResult},
    state::AppState,
};

/// Purchase a plan. Returns 201 once the subscription is active, or 202 when the
/// card needs customer action (the receipt carries the client secret).
pub async fn purchase(
    State(state): State<AppState>,
    Actor(actor): Actor,
    Json(request): Json<PurchaseRequest>,
) -> ApiResult<(StatusCode, Json<PurchaseReceipt>)> {
    let billing = state.billing()?;
    let receipt = billing.purchases.purchase(&request, &actor).await?;

    let status = match receipt.status {
        PurchaseStatus::Completed => StatusCode::CREATED,
        PurchaseStatus::RequiresAction => StatusCode::ACCEPTED,
    };
    Ok((status, Json(receipt)))
}

/// Handle Stripe webhook
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<serde_json::Value>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("Missing Stripe signature".to_string()))?;

    let billing = state.billing()?;
    let event = billing.webhooks.verify_event(&body, signature)?;
    let outcome = billing.webhooks.handle_event(event).await?;

    let outcome = match outcome {
        WebhookOutcome::Processed => json!({ "received": true, "outcome": "processed" }),
        WebhookOutcome::Duplicate => json!({ "received": true, "outcome": "duplicate" }),
        WebhookOutcome::Ignored(reason) => {
            json!({ "received": true, "outcome": "ignored", "reason": reason })
        }
    };
    Ok(Json(outcome))
}
