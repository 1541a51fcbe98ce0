//! Upload lifecycle endpoints. Every handler acts on the session user's records only.

use crate::auth::SessionUser;
use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::{multipart::Field, Multipart, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use openheart_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const UPLOAD_FIELD: &str = "file";

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file_name: String,
    pub size_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct PurgeResponse {
    pub removed: usize,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    /// Seconds to keep polling before answering with whatever state was reached.
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub accepted: Vec<String>,
}

/// Stream the `file` field of a multipart body to the user's staging path.
#[tracing::instrument(skip(state, multipart), fields(user_id = %session.user_id))]
pub async fn upload(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, HttpAppError> {
    let mut staged: Option<(String, u64, std::path::PathBuf)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidInput(format!("Failed to read multipart: {}", e)))?
    {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        if staged.is_some() {
            return Err(AppError::InvalidInput(
                "Multiple file fields are not allowed; send exactly one field named 'file'"
                    .to_string(),
            )
            .into());
        }
        let file_name = field.file_name().unwrap_or("upload.zip").to_string();
        if !file_name.to_ascii_lowercase().ends_with(".zip") {
            return Err(
                AppError::InvalidInput(format!("{} is not a zip archive", file_name)).into(),
            );
        }

        let path = state.lifecycle.staging_path(session.user_id).await?;
        let size = match write_field(field, &path).await {
            Ok(size) => size,
            Err(e) => {
                if let Err(cleanup_err) = tokio::fs::remove_file(&path).await {
                    tracing::warn!(error = %cleanup_err, path = %path.display(), "Failed to remove partial upload");
                }
                return Err(e.into());
            }
        };
        staged = Some((file_name, size, path));
    }

    let (file_name, size_bytes, path) =
        staged.ok_or_else(|| AppError::InvalidInput("No file provided".to_string()))?;
    state.lifecycle.stage_archive(session.user_id, &path).await?;
    tracing::info!(file_name = %file_name, size_bytes, "Archive staged");

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse {
            file_name,
            size_bytes,
        }),
    ))
}

async fn write_field(mut field: Field<'_>, path: &Path) -> AppResult<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut size = 0u64;
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| AppError::InvalidInput(format!("Failed to read file data: {}", e)))?
    {
        size += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    if size == 0 {
        return Err(AppError::InvalidInput("Uploaded file is empty".to_string()));
    }
    Ok(size)
}

/// Drop the staged archive and every non-submitted record.
pub async fn reset(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
) -> Result<impl IntoResponse, HttpAppError> {
    let removed = state.lifecycle.reset(session.user_id).await?;
    Ok(Json(PurgeResponse { removed }))
}

pub async fn check(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
) -> Result<impl IntoResponse, HttpAppError> {
    let summary = state.lifecycle.check(session.user_id).await?;
    Ok(Json(summary))
}

pub async fn transmit(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
) -> Result<impl IntoResponse, HttpAppError> {
    let report = state.lifecycle.transmit(session.user_id).await?;
    Ok(Json(report))
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
    Query(query): Query<StatusQuery>,
) -> Result<impl IntoResponse, HttpAppError> {
    let timeout = query.timeout.map(Duration::from_secs);
    let report = state.lifecycle.status(session.user_id, timeout).await?;
    Ok(Json(report))
}

pub async fn review(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
) -> Result<impl IntoResponse, HttpAppError> {
    let subjects = state.lifecycle.review(session.user_id).await?;
    Ok(Json(subjects))
}

pub async fn submit(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
    ValidatedJson(request): ValidatedJson<SubmitRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let report = state
        .lifecycle
        .submit(session.user_id, &request.accepted)
        .await?;
    Ok(Json(report))
}

pub async fn finish(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
) -> Result<impl IntoResponse, HttpAppError> {
    let removed = state.lifecycle.finish(session.user_id).await?;
    Ok(Json(PurgeResponse { removed }))
}
