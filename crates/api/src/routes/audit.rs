//! Billing audit trail

use axum::{
    extract::{Path, Query, State},
    Json,
};
use carebill_billing::PgAuditSink;
use serde::Deserialize;
use uuid::Uuid;

use crate::{error::ApiResult, state::AppState};

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 200;

#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    pub limit: Option<i64>,
}

/// Most recent billing events for a user, newest first
pub async fn user_billing_events(
    State(state): State<AppState>,
    Path(user_id): Path<Uuid>,
    Query(query): Query<AuditQuery>,
) -> ApiResult<Json<Vec<serde_json::Value>>> {
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let events = PgAuditSink::new(state.pool.clone())
        .entries_for_user(user_id, limit)
        .await?;
    Ok(Json(events))
}
