//! Signed artifact downloads

use crate::error::{ApiResult, AppError};
use crate::routes::backup::attachment;
use crate::state::SharedState;
use crate::storage::StorageError;
use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::warn;

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    pub expires: i64,
    pub signature: String,
}

/// GET /api/backup/files/{name}
pub async fn download(
    State(state): State<SharedState>,
    Path(name): Path<String>,
    Query(query): Query<SignedQuery>,
) -> ApiResult<Response> {
    let object = state
        .storage
        .open_signed(&name, query.expires, &query.signature)
        .await
        .map_err(|e| {
            warn!("Download of {} refused: {}", name, e);
            match e {
                StorageError::InvalidName(_) => AppError::BadRequest(e.to_string()),
                StorageError::NotFound(_) => AppError::NotFound(e.to_string()),
                StorageError::Expired | StorageError::InvalidSignature => {
                    AppError::Forbidden(e.to_string())
                }
                StorageError::Io(_) | StorageError::Url(_) => AppError::Internal(e.to_string()),
            }
        })?;

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(object.content_type));
    headers.insert(header::CONTENT_DISPOSITION, attachment(&name)?);
    Ok((headers, object.bytes).into_response())
}
