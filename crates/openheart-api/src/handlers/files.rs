use crate::auth::SessionUser;
use crate::error::{HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use openheart_core::ScanType;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct ScanTypeRequest {
    pub scan_type: ScanType,
}

#[derive(Debug, Serialize)]
pub struct ScanTypeResponse {
    pub id: Uuid,
    pub name: String,
    pub scan_type: ScanType,
}

/// Override the inferred scan type of a record that was not transmitted yet.
#[tracing::instrument(skip(state, request), fields(user_id = %session.user_id, record_id = %id))]
pub async fn set_scan_type(
    State(state): State<Arc<AppState>>,
    session: SessionUser,
    Path(id): Path<Uuid>,
    ValidatedJson(request): ValidatedJson<ScanTypeRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let record = state
        .lifecycle
        .set_scan_type(session.user_id, id, request.scan_type)
        .await?;
    Ok(Json(ScanTypeResponse {
        id: record.id,
        name: record.display_name().to_string(),
        scan_type: record.scan_type,
    }))
}
