//! User repository: CRUD for the users table.

use chrono::Utc;
use openheart_core::{AppResult, User};
use sqlx::{Sqlite, SqlitePool};
use uuid::Uuid;

const USER_COLUMNS: &str = "id, email, token_hash, upload_archive_path, created_at, updated_at";

#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Return the user registered under `email`, creating it if absent.
    #[tracing::instrument(skip(self), fields(db.table = "users", db.operation = "upsert"))]
    pub async fn get_or_create(&self, email: &str) -> AppResult<(User, bool)> {
        if let Some(user) = self.find_by_email(email).await? {
            return Ok((user, false));
        }

        let now = Utc::now();
        let user = sqlx::query_as::<Sqlite, User>(&format!(
            r#"
            INSERT INTO users (id, email, token_hash, upload_archive_path, created_at, updated_at)
            VALUES (?, ?, NULL, NULL, ?, ?)
            RETURNING {}
            "#,
            USER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(email)
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(user_id = %user.id, "User registered");
        Ok((user, true))
    }

    #[tracing::instrument(skip(self), fields(db.table = "users", db.operation = "select"))]
    pub async fn find_by_email(&self, email: &str) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<Sqlite, User>(&format!(
            "SELECT {} FROM users WHERE email = ?",
            USER_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    #[tracing::instrument(skip(self), fields(db.table = "users", db.operation = "select", db.record_id = %id))]
    pub async fn get_by_id(&self, id: Uuid) -> AppResult<Option<User>> {
        let user = sqlx::query_as::<Sqlite, User>(&format!(
            "SELECT {} FROM users WHERE id = ?",
            USER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// Replace the stored token hash. Passing `None` consumes the current token.
    #[tracing::instrument(skip(self, token_hash), fields(db.table = "users", db.operation = "update", db.record_id = %id))]
    pub async fn set_token_hash(&self, id: Uuid, token_hash: Option<&str>) -> AppResult<()> {
        sqlx::query("UPDATE users SET token_hash = ?, updated_at = ? WHERE id = ?")
            .bind(token_hash)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record (or clear) the archive staged for the next check.
    #[tracing::instrument(skip(self), fields(db.table = "users", db.operation = "update", db.record_id = %id))]
    pub async fn set_upload_archive(&self, id: Uuid, path: Option<&str>) -> AppResult<()> {
        sqlx::query("UPDATE users SET upload_archive_path = ?, updated_at = ? WHERE id = ?")
            .bind(path)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete the user. Remaining file records are removed by cascade.
    #[tracing::instrument(skip(self), fields(db.table = "users", db.operation = "delete", db.record_id = %id))]
    pub async fn delete(&self, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
