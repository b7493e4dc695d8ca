//! Plan catalog

use axum::{extract::State, Json};
use carebill_billing::PlanConfig;

use crate::{error::ApiResult, state::AppState};

/// List every purchasable plan
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<PlanConfig>>> {
    let billing = state.billing()?;
    Ok(Json(billing.catalog.all().cloned().collect()))
}
