//! Refund issuance and follow-up

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use carebill_billing::{RefundOutcome, RefundRequest};
use carebill_shared::RefundRecord;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    actor::Actor,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefundKind {
    Full,
    Partial,
    Prorated,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRefundRequest {
    #[serde(rename = "type")]
    pub kind: RefundKind,
    /// Required for partial refunds
    pub amount_cents: Option<i64>,
    pub reason: Option<String>,
    pub admin_note: Option<String>,
}

/// Issue a refund against the subscription's current invoice
pub async fn create_refund(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
    Actor(actor): Actor,
    Json(body): Json<CreateRefundRequest>,
) -> ApiResult<(StatusCode, Json<RefundOutcome>)> {
    let billing = state.billing()?;
    let request = RefundRequest {
        reason: body.reason,
        admin_note: body.admin_note,
    };

    let outcome = match body.kind {
        RefundKind::Full => billing.refunds.full_refund(subscription_id, &request, &actor).await?,
        RefundKind::Prorated => {
            billing
                .refunds
                .prorated_refund(subscription_id, &request, &actor)
                .await?
        }
        RefundKind::Partial => {
            let amount = body.amount_cents.ok_or_else(|| {
                ApiError::BadRequest("amountCents is required for partial refunds".to_string())
            })?;
            billing
                .refunds
                .partial_refund(subscription_id, amount, &request, &actor)
                .await?
        }
    };

    let status = match outcome {
        RefundOutcome::Issued { .. } => StatusCode::CREATED,
        RefundOutcome::NoRefundNeeded { .. } => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

pub async fn cancel_refund(
    State(state): State<AppState>,
    Path((subscription_id, refund_id)): Path<(Uuid, String)>,
    Actor(actor): Actor,
) -> ApiResult<Json<RefundRecord>> {
    let billing = state.billing()?;
    let record = billing
        .refunds
        .cancel_refund(subscription_id, &refund_id, &actor)
        .await?;
    Ok(Json(record))
}

/// Pull the refund's settlement status from Stripe
pub async fn sync_refund(
    State(state): State<AppState>,
    Path((subscription_id, refund_id)): Path<(Uuid, String)>,
    Actor(actor): Actor,
) -> ApiResult<Json<RefundRecord>> {
    let billing = state.billing()?;
    let record = billing
        .refunds
        .sync_refund_status(subscription_id, &refund_id, &actor)
        .await?;
    Ok(Json(record))
}
