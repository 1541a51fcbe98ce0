//! HTTP error response conversion
//!
//! Handlers return `Result<impl IntoResponse, HttpAppError>`; any `AppError` converts with
//! `?` and renders as an [`ErrorResponse`] with the status taken from its metadata.

use axum::{
    extract::rejection::JsonRejection,
    extract::{FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use openheart_core::{AppError, ErrorMetadata, LogLevel};
use openheart_infra::ErrorResponse;
use serde::de::DeserializeOwned;

/// Wrapper type for AppError to implement IntoResponse.
/// Rust's orphan rules forbid implementing the external trait for the external type.
#[derive(Debug)]
pub struct HttpAppError(pub AppError);

impl From<AppError> for HttpAppError {
    fn from(err: AppError) -> Self {
        HttpAppError(err)
    }
}

impl From<anyhow::Error> for HttpAppError {
    fn from(err: anyhow::Error) -> Self {
        HttpAppError(AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        })
    }
}

impl From<std::io::Error> for HttpAppError {
    fn from(err: std::io::Error) -> Self {
        HttpAppError(AppError::Io(err))
    }
}

/// Convert JSON body deserialization failures into a 400 with our ErrorResponse format.
impl From<JsonRejection> for HttpAppError {
    fn from(rejection: JsonRejection) -> Self {
        HttpAppError(AppError::InvalidInput(format!(
            "Invalid request body: {}",
            rejection.body_text()
        )))
    }
}

/// JSON body extractor that answers malformed bodies with our ErrorResponse (400 + JSON)
/// instead of axum's plain-text rejection.
#[derive(Debug, Clone, Copy)]
pub struct ValidatedJson<T>(pub T);

impl<T, S> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Send,
    S: Send + Sync,
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
{
    type Rejection = HttpAppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(inner) = Json::<T>::from_request(req, state)
            .await
            .map_err(HttpAppError::from)?;
        Ok(ValidatedJson(inner))
    }
}

fn log_error(error: &AppError) {
    let error_type = error.error_type();
    match error.log_level() {
        LogLevel::Debug => {
            tracing::debug!(error = %error, error_type = error_type, "Error occurred");
        }
        LogLevel::Warn => {
            tracing::warn!(error = %error, error_type = error_type, "Error occurred");
        }
        LogLevel::Error => {
            tracing::error!(error = %error, error_type = error_type, "Error occurred");
        }
    }
}

fn is_production_env() -> bool {
    std::env::var("ENVIRONMENT")
        .map(|env| {
            let env = env.to_lowercase();
            env == "production" || env == "prod"
        })
        .unwrap_or(false)
}

/// Body for `error`; details are withheld in production and for sensitive errors.
pub fn error_body(error: &AppError, is_production: bool) -> ErrorResponse {
    let expose = !is_production && !error.is_sensitive();
    ErrorResponse {
        error: error.client_message(),
        details: expose.then(|| error.detailed_message()),
        error_type: expose.then(|| error.error_type().to_string()),
        code: error.error_code().to_string(),
        recoverable: error.is_recoverable(),
        suggested_action: error.suggested_action().map(String::from),
    }
}

impl IntoResponse for HttpAppError {
    fn into_response(self) -> Response {
        let app_error = &self.0;
        let status = StatusCode::from_u16(app_error.http_status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        log_error(app_error);

        (status, Json(error_body(app_error, is_production_env()))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_exposes_details_outside_production() {
        let err = AppError::PreconditionFailed("no uploaded archive".to_string());
        let body = error_body(&err, false);
        assert_eq!(body.code, err.error_code());
        assert!(body.details.unwrap().contains("no uploaded archive"));
        assert!(!body.recoverable);
    }

    #[test]
    fn test_error_body_hides_details_in_production() {
        let err = AppError::NotFound("file".to_string());
        let body = error_body(&err, true);
        assert!(body.details.is_none());
        assert!(body.error_type.is_none());
    }

    #[test]
    fn test_sensitive_error_hides_details() {
        let err = AppError::Internal("connection string leaked".to_string());
        let body = error_body(&err, false);
        assert!(body.details.is_none());
        assert!(!body.error.contains("connection string"));
    }

    #[test]
    fn test_status_code_from_metadata() {
        let response = HttpAppError(AppError::Unauthorized("x".into())).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = HttpAppError(AppError::RemoteConflict("x".into())).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }
}
