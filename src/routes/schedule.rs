//! Schedule settings handlers

use crate::auth::BearerToken;
use crate::error::{validation_error, ApiResult};
use crate::schedule::{ScheduleView, UpdateScheduleRequest};
use crate::state::SharedState;
use axum::{extract::State, Json};
use validator::Validate;

/// GET /api/backup/schedule
pub async fn get_schedule(
    State(state): State<SharedState>,
    bearer: BearerToken,
) -> ApiResult<Json<ScheduleView>> {
    state.auth.admin(bearer.as_deref()).await?;
    Ok(Json(state.schedule.get().await?))
}

/// PUT /api/backup/schedule
pub async fn update_schedule(
    State(state): State<SharedState>,
    bearer: BearerToken,
    Json(request): Json<UpdateScheduleRequest>,
) -> ApiResult<Json<ScheduleView>> {
    state.auth.admin(bearer.as_deref()).await?;
    request
        .validate()
        .map_err(|e| validation_error(e.to_string()))?;

    Ok(Json(state.schedule.update(request).await?))
}
