//! Restore handler

use crate::auth::BearerToken;
use crate::error::{ApiResult, AppError};
use crate::restore::RestoreReport;
use crate::state::SharedState;
use axum::{body::Body, extract::State, Json};

/// Snapshots arrive inline in the request body
const RESTORE_BODY_LIMIT: usize = 512 * 1024 * 1024;

/// POST /api/restore
///
/// Credentials are checked before the body is read.
pub async fn restore(State(state): State<SharedState>, bearer: BearerToken, body: Body) -> ApiResult<Json<RestoreReport>> {
    let admission = state.restore.admit(bearer.as_deref()).await?;
    let bytes = axum::body::to_bytes(body, RESTORE_BODY_LIMIT)
        .await
        .map_err(|e| AppError::BadRequest(format!("Could not read restore body: {}", e)))?;
    let report = state.restore.restore(admission, &bytes).await?;
    Ok(Json(report))
}
