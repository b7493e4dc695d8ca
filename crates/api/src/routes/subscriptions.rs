//! Subscription lifecycle transitions

use axum::{
    extract::{Path, State},
    Json,
};
use carebill_billing::{CancelRequest, PlanChange};
use carebill_shared::Subscription;
use serde::Deserialize;
use uuid::Uuid;

use crate::{actor::Actor, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangePlanRequest {
    pub plan_id: String,
}

/// Cancel now, or at period end when `atPeriodEnd` is set. The body is optional.
pub async fn cancel(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
    Actor(actor): Actor,
    body: Option<Json<CancelRequest>>,
) -> ApiResult<Json<Subscription>> {
    let billing = state.billing()?;
    let request = body.map(|Json(r)| r).unwrap_or_default();
    Ok(Json(billing.lifecycle.cancel(subscription_id, &request, &actor).await?))
}

pub async fn pause(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
    Actor(actor): Actor,
) -> ApiResult<Json<Subscription>> {
    let billing = state.billing()?;
    Ok(Json(billing.lifecycle.pause(subscription_id, &actor).await?))
}

pub async fn resume(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
    Actor(actor): Actor,
) -> ApiResult<Json<Subscription>> {
    let billing = state.billing()?;
    Ok(Json(billing.lifecycle.resume(subscription_id, &actor).await?))
}

pub async fn change_plan(
    State(state): State<AppState>,
    Path(subscription_id): Path<Uuid>,
    Actor(actor): Actor,
    Json(request): Json<ChangePlanRequest>,
) -> ApiResult<Json<PlanChange>> {
    let billing = state.billing()?;
    let change = billing
        .lifecycle
        .change_plan(subscription_id, &request.plan_id, &actor)
        .await?;
    Ok(Json(change))
}
