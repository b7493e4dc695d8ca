//! Combined feature access per user

use axum::{
    extract::{Path, State},
    Json,
};
use carebill_shared::FeatureAccess;
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

pub async fn user_entitlements(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
) -> ApiResult<Json<FeatureAccess>> {
    let billing = state.billing()?;
    Ok(Json(billing.entitlements.current(user_id).await?))
}
