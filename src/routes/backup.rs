//! Backup and SQL export handlers

use crate::auth::{BearerToken, Caller};
use crate::backup::BackupResponse;
use crate::error::{ApiResult, AppError};
use crate::state::SharedState;
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Default, Deserialize)]
pub struct BackupQuery {
    /// Mail the stored recipient after the run
    #[serde(default)]
    pub notify: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    /// Also store the document and return a signed link
    #[serde(default)]
    pub publish: bool,
}

/// POST /api/backup
pub async fn run_backup(
    State(state): State<SharedState>,
    bearer: BearerToken,
    Query(query): Query<BackupQuery>,
) -> ApiResult<Json<BackupResponse>> {
    let caller = state.auth.admin_or_scheduler(bearer.as_deref()).await?;
    let notify = query.notify || caller == Caller::Scheduler;
    info!("Backup requested by {} (notify: {})", caller, notify);

    Ok(Json(state.backup.run_backup(notify).await?))
}

/// POST /api/backup/sql
pub async fn export_sql(
    State(state): State<SharedState>,
    bearer: BearerToken,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let caller = state.auth.admin_or_scheduler(bearer.as_deref()).await?;
    info!("SQL export requested by {}", caller);

    let export = state.backup.export_sql(query.publish).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/sql; charset=utf-8"),
    );
    headers.insert(header::CONTENT_DISPOSITION, attachment(&export.file_name)?);
    if let Some(url) = &export.download_url {
        let value = HeaderValue::from_str(url)
            .map_err(|e| AppError::Internal(format!("Invalid download link: {}", e)))?;
        headers.insert("x-download-url", value);
    }
    Ok((headers, export.sql).into_response())
}

/// `attachment; filename="..."`
pub(crate) fn attachment(file_name: &str) -> ApiResult<HeaderValue> {
    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file_name))
        .map_err(|e| AppError::Internal(format!("Invalid file name {}: {}", file_name, e)))
}
