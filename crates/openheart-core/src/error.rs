//! Error types module
//!
//! All fallible operations that cross crate boundaries return [`AppError`]. Variants are split
//! into a recoverable class (remote lookups that may legitimately miss, resources that already
//! exist, transient transport failures) and a fatal class (precondition violations, local data
//! integrity problems). Callers use [`ErrorMetadata::is_recoverable`] to decide whether to
//! catch-and-continue or to abort the current batch.
//!
//! The `Database` variant and `From<sqlx::Error>` are gated behind the `sqlx` feature.

use std::io;

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

pub type AppResult<T> = Result<T, AppError>;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected errors like validation failures
    Debug,
    /// Warning level - for recoverable issues
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Metadata for error responses - defines how an error should be presented
pub trait ErrorMetadata {
    /// HTTP status code to return
    fn http_status_code(&self) -> u16;

    /// Machine-readable error code (e.g., "DATABASE_ERROR")
    fn error_code(&self) -> &'static str;

    /// Whether this error is recoverable (can be retried or skipped)
    fn is_recoverable(&self) -> bool;

    /// Suggested action for the client
    fn suggested_action(&self) -> Option<&'static str>;

    /// Client-facing message (may differ from internal error message)
    fn client_message(&self) -> String;

    /// Whether details should be hidden in production
    fn is_sensitive(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Remote resource not found: {0}")]
    RemoteNotFound(String),

    #[error("Remote resource already exists: {0}")]
    RemoteConflict(String),

    #[error("Remote archive error: {0}")]
    Remote(String),

    #[error("Conversion of {file} failed: {message}")]
    Conversion { file: String, message: String },

    #[error("{operation} failed for {} item(s): {}", failed.len(), failed.join(", "))]
    BatchFailed {
        operation: String,
        failed: Vec<String>,
    },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("IO error: {0}")]
    Io(#[source] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        match err {
            SqlxError::RowNotFound => AppError::NotFound("record not found".to_string()),
            other => AppError::Database(other),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        AppError::Io(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<uuid::Error> for AppError {
    fn from(err: uuid::Error) -> Self {
        AppError::InvalidInput(format!("UUID parsing error: {}", err))
    }
}

/// Static metadata for each variant: (http_status, error_code, recoverable, suggested_action, sensitive, log_level).
fn app_error_static_metadata(
    err: &AppError,
) -> (
    u16,
    &'static str,
    bool,
    Option<&'static str>,
    bool,
    LogLevel,
) {
    match err {
        AppError::Database(_) => (
            500,
            "DATABASE_ERROR",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
        AppError::InvalidInput(_) => (
            400,
            "INVALID_INPUT",
            false,
            Some("Check request parameters and try again"),
            false,
            LogLevel::Debug,
        ),
        AppError::NotFound(_) => (
            404,
            "NOT_FOUND",
            false,
            Some("Verify the resource ID exists"),
            false,
            LogLevel::Debug,
        ),
        AppError::PreconditionFailed(_) => (
            409,
            "PRECONDITION_FAILED",
            false,
            Some("Start a new upload; this step cannot be retried as is"),
            false,
            LogLevel::Warn,
        ),
        AppError::RemoteNotFound(_) => (
            404,
            "REMOTE_NOT_FOUND",
            true,
            Some("Check that the archive project exists"),
            false,
            LogLevel::Warn,
        ),
        AppError::RemoteConflict(_) => (
            409,
            "REMOTE_CONFLICT",
            true,
            Some("Retry the request; existing resources are reused"),
            false,
            LogLevel::Warn,
        ),
        AppError::Remote(_) => (
            502,
            "REMOTE_ARCHIVE_ERROR",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
        AppError::Conversion { .. } => (
            422,
            "CONVERSION_FAILED",
            false,
            Some("Check the raw file and upload it again"),
            false,
            LogLevel::Warn,
        ),
        AppError::BatchFailed { .. } => (
            502,
            "BATCH_FAILED",
            true,
            Some("Retry the request; completed items are skipped"),
            false,
            LogLevel::Error,
        ),
        AppError::Unauthorized(_) => (
            401,
            "UNAUTHORIZED",
            false,
            Some("Log in again to obtain a new session"),
            false,
            LogLevel::Debug,
        ),
        AppError::Io(_) => (
            500,
            "IO_ERROR",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
        AppError::Internal(_) | AppError::InternalWithSource { .. } => (
            500,
            "INTERNAL_ERROR",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
    }
}

impl AppError {
    /// Get the error type name for detailed error responses
    pub fn error_type(&self) -> &str {
        match self {
            AppError::Database(_) => "Database",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::NotFound(_) => "NotFound",
            AppError::PreconditionFailed(_) => "PreconditionFailed",
            AppError::RemoteNotFound(_) => "RemoteNotFound",
            AppError::RemoteConflict(_) => "RemoteConflict",
            AppError::Remote(_) => "Remote",
            AppError::Conversion { .. } => "Conversion",
            AppError::BatchFailed { .. } => "BatchFailed",
            AppError::Unauthorized(_) => "Unauthorized",
            AppError::Io(_) => "Io",
            AppError::Internal(_) => "Internal",
            AppError::InternalWithSource { .. } => "Internal",
        }
    }

    /// Get detailed error information including error chain
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();

        let mut source = self.source();
        let mut depth = 0;
        while let Some(err) = source {
            depth += 1;
            if depth > 5 {
                details.push_str("\n  ... (truncated)");
                break;
            }
            details.push_str(&format!("\n  Caused by: {}", err));
            source = err.source();
        }

        details
    }
}

impl ErrorMetadata for AppError {
    fn http_status_code(&self) -> u16 {
        app_error_static_metadata(self).0
    }

    fn error_code(&self) -> &'static str {
        app_error_static_metadata(self).1
    }

    fn is_recoverable(&self) -> bool {
        app_error_static_metadata(self).2
    }

    fn suggested_action(&self) -> Option<&'static str> {
        app_error_static_metadata(self).3
    }

    fn is_sensitive(&self) -> bool {
        app_error_static_metadata(self).4
    }

    fn log_level(&self) -> LogLevel {
        app_error_static_metadata(self).5
    }

    fn client_message(&self) -> String {
        match self {
            AppError::Database(_) => "Failed to access database".to_string(),
            AppError::InvalidInput(ref msg) => msg.clone(),
            AppError::NotFound(ref msg) => msg.clone(),
            AppError::PreconditionFailed(ref msg) => msg.clone(),
            AppError::RemoteNotFound(ref msg) => format!("Archive resource not found: {}", msg),
            AppError::RemoteConflict(ref msg) => {
                format!("Archive resource already exists: {}", msg)
            }
            AppError::Remote(_) => "The remote archive could not complete the request".to_string(),
            AppError::Conversion { file, .. } => format!("Conversion of {} failed", file),
            AppError::BatchFailed { operation, failed } => format!(
                "{} failed for {} item(s): {}",
                operation,
                failed.len(),
                failed.join(", ")
            ),
            AppError::Unauthorized(ref msg) => msg.clone(),
            AppError::Io(_) => "Failed to access local storage".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
            AppError::InternalWithSource { .. } => "Internal server error".to_string(),
        }
    }
}
