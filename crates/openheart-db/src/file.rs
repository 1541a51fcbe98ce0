//! File record store.
//!
//! The lifecycle flags only move forward: every mutating query carries the guard that
//! makes the transition legal (`transmitted` before `reconstructed` before `submitted`,
//! nothing changes once `submitted` is set). A guarded update that matches no row
//! reports `false` instead of silently rewriting state, so a repeated request is a
//! no-op rather than a second transition.

use chrono::{DateTime, NaiveDate, Utc};
use openheart_core::{
    AppError, AppResult, ContainerStatus, FileFormat, FileRecord, NewFileRecord, RemoteScanIds,
    ScanType,
};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

const FILE_COLUMNS: &str = "id, user_id, path, unique_path, original_name, subject, \
    subject_unique, format, scan_type, xnat_subject_id, xnat_experiment_id, xnat_scan_id, \
    xnat_experiment_date, transmitted, reconstructed, submitted, container_status, \
    created_at, updated_at";

/// Row type for the files table (for FromRow).
#[derive(Debug, sqlx::FromRow)]
struct FileRecordRow {
    id: Uuid,
    user_id: Uuid,
    path: String,
    unique_path: Option<String>,
    original_name: String,
    subject: String,
    subject_unique: String,
    format: String,
    scan_type: String,
    xnat_subject_id: Option<String>,
    xnat_experiment_id: Option<String>,
    xnat_scan_id: Option<String>,
    xnat_experiment_date: Option<NaiveDate>,
    transmitted: bool,
    reconstructed: bool,
    submitted: bool,
    container_status: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl FileRecordRow {
    fn into_record(self) -> AppResult<FileRecord> {
        let format: FileFormat = self
            .format
            .parse()
            .map_err(|e: anyhow::Error| AppError::Internal(e.to_string()))?;
        let scan_type = self.scan_type.parse().unwrap_or(ScanType::Unknown);
        let remote = match (self.xnat_subject_id, self.xnat_experiment_id, self.xnat_scan_id) {
            (Some(subject_id), Some(experiment_id), Some(scan_id)) => Some(RemoteScanIds {
                subject_id,
                experiment_id,
                scan_id,
                experiment_date: self.xnat_experiment_date,
            }),
            _ => None,
        };

        Ok(FileRecord {
            id: self.id,
            user_id: self.user_id,
            path: self.path,
            unique_path: self.unique_path,
            original_name: self.original_name,
            subject: self.subject,
            subject_unique: self.subject_unique,
            format,
            scan_type,
            remote,
            transmitted: self.transmitted,
            reconstructed: self.reconstructed,
            submitted: self.submitted,
            container_status: ContainerStatus::from_code(self.container_status),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn into_records(rows: Vec<FileRecordRow>) -> AppResult<Vec<FileRecord>> {
    rows.into_iter().map(FileRecordRow::into_record).collect()
}

/// Predicates for [`FileRepository::list`]. Unset fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct FileFilter {
    pub format: Option<FileFormat>,
    pub transmitted: Option<bool>,
    pub reconstructed: Option<bool>,
    pub submitted: Option<bool>,
    pub subject_unique: Option<String>,
}

impl FileFilter {
    /// Everything still in the working set.
    pub fn pending() -> Self {
        Self {
            submitted: Some(false),
            ..Default::default()
        }
    }

    pub fn not_transmitted() -> Self {
        Self {
            transmitted: Some(false),
            submitted: Some(false),
            ..Default::default()
        }
    }

    pub fn transmitted_pending() -> Self {
        Self {
            transmitted: Some(true),
            submitted: Some(false),
            ..Default::default()
        }
    }

    pub fn reconstructed_pending() -> Self {
        Self {
            reconstructed: Some(true),
            submitted: Some(false),
            ..Default::default()
        }
    }

    pub fn submitted() -> Self {
        Self {
            submitted: Some(true),
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: FileFormat) -> Self {
        self.format = Some(format);
        self
    }

    pub fn with_subject_unique(mut self, subject_unique: impl Into<String>) -> Self {
        self.subject_unique = Some(subject_unique.into());
        self
    }
}

#[derive(Clone)]
pub struct FileRepository {
    pool: SqlitePool,
}

impl FileRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, new), fields(db.table = "files", db.operation = "insert", user_id = %new.user_id))]
    pub async fn create(&self, new: &NewFileRecord) -> AppResult<FileRecord> {
        let now = Utc::now();
        let row = sqlx::query_as::<Sqlite, FileRecordRow>(&format!(
            r#"
            INSERT INTO files (id, user_id, path, original_name, subject, subject_unique,
                               format, scan_type, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {}
            "#,
            FILE_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(new.user_id)
        .bind(&new.path)
        .bind(&new.original_name)
        .bind(&new.subject)
        .bind(&new.subject_unique)
        .bind(new.format.extension())
        .bind(new.scan_type.to_string())
        .bind(now)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        row.into_record()
    }

    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "select", db.record_id = %id))]
    pub async fn get(&self, user_id: Uuid, id: Uuid) -> AppResult<Option<FileRecord>> {
        let row = sqlx::query_as::<Sqlite, FileRecordRow>(&format!(
            "SELECT {} FROM files WHERE id = ? AND user_id = ?",
            FILE_COLUMNS
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(FileRecordRow::into_record).transpose()
    }

    /// Records of one user matching `filter`, in insertion order.
    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "select"))]
    pub async fn list(&self, user_id: Uuid, filter: &FileFilter) -> AppResult<Vec<FileRecord>> {
        let mut qb: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {} FROM files WHERE user_id = ", FILE_COLUMNS));
        qb.push_bind(user_id);
        if let Some(format) = filter.format {
            qb.push(" AND format = ").push_bind(format.extension());
        }
        if let Some(transmitted) = filter.transmitted {
            qb.push(" AND transmitted = ").push_bind(transmitted);
        }
        if let Some(reconstructed) = filter.reconstructed {
            qb.push(" AND reconstructed = ").push_bind(reconstructed);
        }
        if let Some(submitted) = filter.submitted {
            qb.push(" AND submitted = ").push_bind(submitted);
        }
        if let Some(subject_unique) = &filter.subject_unique {
            qb.push(" AND subject_unique = ").push_bind(subject_unique.clone());
        }
        qb.push(" ORDER BY rowid");

        let rows = qb
            .build_query_as::<FileRecordRow>()
            .fetch_all(&self.pool)
            .await?;
        into_records(rows)
    }

    pub async fn list_pending(&self, user_id: Uuid) -> AppResult<Vec<FileRecord>> {
        self.list(user_id, &FileFilter::pending()).await
    }

    pub async fn list_transmitted_pending(&self, user_id: Uuid) -> AppResult<Vec<FileRecord>> {
        self.list(user_id, &FileFilter::transmitted_pending()).await
    }

    pub async fn list_reconstructed_pending(&self, user_id: Uuid) -> AppResult<Vec<FileRecord>> {
        self.list(user_id, &FileFilter::reconstructed_pending()).await
    }

    pub async fn list_submitted(&self, user_id: Uuid) -> AppResult<Vec<FileRecord>> {
        self.list(user_id, &FileFilter::submitted()).await
    }

    /// Assign the content-addressed path. Fails with a precondition error when another
    /// working-set record of the user already owns that path.
    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "update", db.record_id = %id))]
    pub async fn set_unique_path(&self, user_id: Uuid, id: Uuid, unique_path: &str) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE files SET unique_path = ?, updated_at = ?
            WHERE id = ? AND user_id = ? AND transmitted = 0 AND submitted = 0
            "#,
        )
        .bind(unique_path)
        .bind(Utc::now())
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                AppError::PreconditionFailed(format!(
                    "content at {} is already tracked by another record",
                    unique_path
                ))
            }
            other => AppError::from(other),
        })?;
        Ok(result.rows_affected() > 0)
    }

    /// Override the scan classification; only allowed before transmission.
    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "update", db.record_id = %id))]
    pub async fn set_scan_type(&self, user_id: Uuid, id: Uuid, scan_type: ScanType) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE files SET scan_type = ?, updated_at = ?
            WHERE id = ? AND user_id = ? AND transmitted = 0 AND submitted = 0
            "#,
        )
        .bind(scan_type.to_string())
        .bind(Utc::now())
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Stamp remote identifiers and set `transmitted`. Identifiers are written exactly
    /// once: a record that is already transmitted is left untouched.
    #[tracing::instrument(skip(self, ids), fields(db.table = "files", db.operation = "update", db.record_id = %id, scan_id = %ids.scan_id))]
    pub async fn mark_transmitted(
        &self,
        user_id: Uuid,
        id: Uuid,
        ids: &RemoteScanIds,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE files
            SET xnat_subject_id = ?, xnat_experiment_id = ?, xnat_scan_id = ?,
                xnat_experiment_date = ?, transmitted = 1, container_status = ?, updated_at = ?
            WHERE id = ? AND user_id = ? AND transmitted = 0 AND submitted = 0
            "#,
        )
        .bind(&ids.subject_id)
        .bind(&ids.experiment_id)
        .bind(&ids.scan_id)
        .bind(ids.experiment_date)
        .bind(ContainerStatus::Unknown.code())
        .bind(Utc::now())
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "update", db.record_id = %id, status = %status))]
    pub async fn set_container_status(
        &self,
        user_id: Uuid,
        id: Uuid,
        status: ContainerStatus,
    ) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE files SET container_status = ?, updated_at = ?
            WHERE id = ? AND user_id = ? AND transmitted = 1 AND submitted = 0
            "#,
        )
        .bind(status.code())
        .bind(Utc::now())
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "update", db.record_id = %id))]
    pub async fn mark_reconstructed(&self, user_id: Uuid, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE files SET reconstructed = 1, container_status = ?, updated_at = ?
            WHERE id = ? AND user_id = ? AND transmitted = 1 AND reconstructed = 0 AND submitted = 0
            "#,
        )
        .bind(ContainerStatus::Completed.code())
        .bind(Utc::now())
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "update", db.record_id = %id))]
    pub async fn mark_submitted(&self, user_id: Uuid, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE files SET submitted = 1, updated_at = ?
            WHERE id = ? AND user_id = ? AND reconstructed = 1 AND submitted = 0
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "delete", db.record_id = %id))]
    pub async fn delete(&self, user_id: Uuid, id: Uuid) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM files WHERE id = ? AND user_id = ?")
            .bind(id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Remove the user's whole working set and return what was removed so the caller can
    /// delete the files on disk.
    #[tracing::instrument(skip(self), fields(db.table = "files", db.operation = "delete"))]
    pub async fn delete_unsubmitted(&self, user_id: Uuid) -> AppResult<Vec<FileRecord>> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query_as::<Sqlite, FileRecordRow>(&format!(
            "SELECT {} FROM files WHERE user_id = ? AND submitted = 0 ORDER BY rowid",
            FILE_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM files WHERE user_id = ? AND submitted = 0")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        into_records(rows)
    }
}
