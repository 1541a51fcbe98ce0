use openheart_core::AppError;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("{0} does not exist")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("Archive returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Archive request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Unexpected archive response: {0}")]
    InvalidResponse(String),

    #[error("Local file error: {0}")]
    Io(#[from] io::Error),
}

impl ArchiveError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ArchiveError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ArchiveError::AlreadyExists(_))
    }
}

impl From<ArchiveError> for AppError {
    fn from(err: ArchiveError) -> Self {
        match err {
            ArchiveError::NotFound(what) => AppError::RemoteNotFound(what),
            ArchiveError::AlreadyExists(what) => AppError::RemoteConflict(what),
            ArchiveError::Io(e) => AppError::Io(e),
            other => AppError::Remote(other.to_string()),
        }
    }
}
