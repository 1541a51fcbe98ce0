use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An authenticated actor. Users only live for one session: they are created at
/// registration and removed at logout together with their working set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct User {
    pub id: Uuid,
    pub email: String,
    /// Salted hash of the current single-use login token.
    #[serde(skip_serializing)]
    pub token_hash: Option<String>,
    /// Archive uploaded but not yet unpacked.
    pub upload_archive_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn has_staged_archive(&self) -> bool {
        self.upload_archive_path.is_some()
    }
}
