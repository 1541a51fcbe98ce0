//! Lifecycle orchestrator: sequences ingestion, transmission, polling and finalization
//! for one user's working set. Every operation is scoped to the acting user.

use crate::cleanup::{preview_dir, remove_file_if_exists, WorkingSetCleanup};
use crate::ingest::IngestionPipeline;
use crate::sync::{ArchiveSync, FinalizeReport, SyncConfig, TransmitReport};
use chrono::Utc;
use openheart_archive::ArchiveClient;
use openheart_core::constants::BATCH_STAMP_FORMAT;
use openheart_core::{
    create_subject_file_lookup, group_by_subject_unique, AppError, AppResult, Config,
    ContainerStatus, FileRecord, LifecycleState, ScanType,
};
use openheart_db::{FileRepository, UserRepository};
use openheart_processing::preview::{ANIMATION_FILE, MONTAGE_FILE, THUMBNAIL_FILE};
use openheart_processing::FormatConverter;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[cfg(test)]
mod tests;

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub data_path: PathBuf,
    pub preview_path: PathBuf,
    /// Sleep between polls inside one status request.
    pub poll_interval: Duration,
    /// Status timeout used when the caller gives none.
    pub default_timeout: Duration,
    /// Longest status timeout honoured; larger requests are clamped.
    pub max_timeout: Duration,
}

impl LifecycleConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            data_path: config.data_path.clone(),
            preview_path: config.preview_path.clone(),
            poll_interval: Duration::from_millis(config.status_poll_interval_ms),
            default_timeout: Duration::from_secs(config.status_default_timeout_seconds),
            max_timeout: Duration::from_secs(config.status_max_timeout_seconds),
        }
    }
}

/// One record as shown to the user.
#[derive(Debug, Clone, Serialize)]
pub struct RecordView {
    pub id: Uuid,
    pub name: String,
    pub subject: String,
    pub subject_unique: String,
    pub scan_type: ScanType,
    pub state: LifecycleState,
    pub container_status: ContainerStatus,
    /// Preview artifact paths, present once derived images were retrieved.
    pub previews: Option<PreviewPaths>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PreviewPaths {
    pub animation: PathBuf,
    pub thumbnail: PathBuf,
    pub montage: PathBuf,
}

impl RecordView {
    fn new(record: &FileRecord, preview_root: &Path) -> Self {
        let previews = record.reconstructed.then(|| {
            let dir = preview_dir(preview_root, record.user_id, record.id);
            PreviewPaths {
                animation: dir.join(ANIMATION_FILE),
                thumbnail: dir.join(THUMBNAIL_FILE),
                montage: dir.join(MONTAGE_FILE),
            }
        });
        Self {
            id: record.id,
            name: record.display_name().to_string(),
            subject: record.subject.clone(),
            subject_unique: record.subject_unique.clone(),
            scan_type: record.scan_type,
            state: record.state(),
            container_status: record.container_status,
            previews,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectSummary {
    pub subject: String,
    pub files: Vec<String>,
}

/// Result of unpacking a staged archive.
#[derive(Debug, Clone, Serialize)]
pub struct CheckSummary {
    pub batch: String,
    pub subjects: Vec<SubjectSummary>,
    pub file_count: usize,
    pub duplicates: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusReport {
    pub records: Vec<RecordView>,
    pub pending: usize,
    pub completed: usize,
    pub failed: usize,
    pub reconstructed: usize,
    pub timed_out: bool,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectReview {
    pub subject: String,
    pub subject_unique: String,
    pub records: Vec<RecordView>,
}

#[derive(Clone)]
pub struct UploadLifecycle {
    users: UserRepository,
    files: FileRepository,
    ingest: IngestionPipeline,
    sync: ArchiveSync,
    cleanup: WorkingSetCleanup,
    config: LifecycleConfig,
}

impl UploadLifecycle {
    pub fn new(
        users: UserRepository,
        files: FileRepository,
        converter: Arc<dyn FormatConverter>,
        archive: Arc<dyn ArchiveClient>,
        sync_config: SyncConfig,
        config: LifecycleConfig,
    ) -> Self {
        let ingest = IngestionPipeline::new(files.clone(), converter, config.data_path.clone());
        let cleanup = WorkingSetCleanup::new(
            files.clone(),
            sync_config.preview_path.clone(),
            sync_config.temp_path.clone(),
        );
        let sync = ArchiveSync::new(files.clone(), archive, sync_config);
        Self {
            users,
            files,
            ingest,
            sync,
            cleanup,
            config,
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Fresh path for an incoming upload of `user_id`.
    pub async fn staging_path(&self, user_id: Uuid) -> AppResult<PathBuf> {
        let dir = self.ingest.user_dir(user_id);
        tokio::fs::create_dir_all(&dir).await?;
        let stamp = Utc::now().format(BATCH_STAMP_FORMAT);
        Ok(dir.join(format!("upload-{}.zip", stamp)))
    }

    /// Record `archive` as the user's staged upload. A previously staged, unchecked
    /// archive is discarded.
    #[tracing::instrument(skip(self, archive), fields(user_id = %user_id))]
    pub async fn stage_archive(&self, user_id: Uuid, archive: &Path) -> AppResult<()> {
        let user = self.user(user_id).await?;
        if let Some(previous) = user.upload_archive_path.as_deref() {
            if Path::new(previous) != archive {
                remove_file_if_exists(Path::new(previous)).await?;
                tracing::info!(path = %previous, "Discarded previously staged archive");
            }
        }
        self.users
            .set_upload_archive(user_id, Some(archive.to_string_lossy().as_ref()))
            .await
    }

    /// Unpack the staged archive into File Records and summarize them by subject.
    #[tracing::instrument(skip(self), fields(user_id = %user_id))]
    pub async fn check(&self, user_id: Uuid) -> AppResult<CheckSummary> {
        let user = self.user(user_id).await?;
        let Some(archive) = user.upload_archive_path else {
            return Err(AppError::PreconditionFailed(
                "no uploaded archive waiting to be checked".to_string(),
            ));
        };
        // the archive is consumed whatever the outcome
        self.users.set_upload_archive(user_id, None).await?;
        let report = self.ingest.ingest(user_id, Path::new(&archive)).await?;

        let file_count = report.records.len();
        let subjects = create_subject_file_lookup(report.records)
            .into_iter()
            .map(|(subject, records)| SubjectSummary {
                subject,
                files: records.into_iter().map(|r| r.original_name).collect(),
            })
            .collect();

        Ok(CheckSummary {
            batch: report.batch,
            subjects,
            file_count,
            duplicates: report.duplicates,
            skipped: report.skipped,
        })
    }

    pub async fn transmit(&self, user_id: Uuid) -> AppResult<TransmitReport> {
        self.sync.transmit(user_id).await
    }

    /// Poll until nothing is awaiting reconstruction or `timeout` passes, then report
    /// whatever state was reached. `timeout` is clamped to the configured maximum.
    #[tracing::instrument(skip(self), fields(user_id = %user_id))]
    pub async fn status(&self, user_id: Uuid, timeout: Option<Duration>) -> AppResult<StatusReport> {
        let timeout = timeout
            .unwrap_or(self.config.default_timeout)
            .min(self.config.max_timeout);
        let deadline = Instant::now()
            .checked_add(timeout)
            .ok_or_else(|| AppError::InvalidInput(format!("Status timeout {:?} is out of range", timeout)))?;
        let mut timed_out = false;

        let (records, errors) = loop {
            let poll = self.sync.poll(user_id).await?;
            let records = self.files.list_transmitted_pending(user_id).await?;
            if !records.iter().any(FileRecord::awaiting_reconstruction) {
                break (records, poll.failed);
            }
            let now = Instant::now();
            if now >= deadline {
                timed_out = true;
                break (records, poll.failed);
            }
            tokio::time::sleep(self.config.poll_interval.min(deadline - now)).await;
        };

        let count = |f: fn(&FileRecord) -> bool| records.iter().filter(|r| f(r)).count();
        let report = StatusReport {
            pending: count(FileRecord::awaiting_reconstruction),
            completed: count(|r| r.container_status == ContainerStatus::Completed),
            failed: count(|r| r.container_status == ContainerStatus::Failed),
            reconstructed: count(|r| r.reconstructed),
            records: records
                .iter()
                .map(|r| RecordView::new(r, &self.config.preview_path))
                .collect(),
            timed_out,
            errors,
        };
        if timed_out {
            tracing::info!(pending = report.pending, "Status timeout reached with pending records");
        }
        Ok(report)
    }

    /// Working set grouped by subject-unique label for the accept/reject decision.
    pub async fn review(&self, user_id: Uuid) -> AppResult<Vec<SubjectReview>> {
        let pending = self.files.list_pending(user_id).await?;
        Ok(group_by_subject_unique(pending)
            .into_iter()
            .map(|(subject_unique, records)| SubjectReview {
                subject: records
                    .first()
                    .map(|r| r.subject.clone())
                    .unwrap_or_default(),
                subject_unique,
                records: records
                    .iter()
                    .map(|r| RecordView::new(r, &self.config.preview_path))
                    .collect(),
            })
            .collect())
    }

    pub async fn submit(&self, user_id: Uuid, accepted: &[String]) -> AppResult<FinalizeReport> {
        self.sync.finalize(user_id, accepted).await
    }

    /// Override the scan classification of a record that was not transmitted yet.
    pub async fn set_scan_type(
        &self,
        user_id: Uuid,
        record_id: Uuid,
        scan_type: ScanType,
    ) -> AppResult<FileRecord> {
        let record = self
            .files
            .get(user_id, record_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("file {}", record_id)))?;
        if !self.files.set_scan_type(user_id, record_id, scan_type).await? {
            return Err(AppError::PreconditionFailed(format!(
                "{} was already transmitted",
                record.original_name
            )));
        }
        Ok(FileRecord { scan_type, ..record })
    }

    /// Drop the staged archive and the whole working set.
    #[tracing::instrument(skip(self), fields(user_id = %user_id))]
    pub async fn reset(&self, user_id: Uuid) -> AppResult<usize> {
        let user = self.user(user_id).await?;
        if let Some(archive) = user.upload_archive_path.as_deref() {
            remove_file_if_exists(Path::new(archive)).await?;
            self.users.set_upload_archive(user_id, None).await?;
        }
        self.cleanup.purge_user_files(user_id).await
    }

    pub async fn finish(&self, user_id: Uuid) -> AppResult<usize> {
        self.cleanup.purge_user_files(user_id).await
    }

    /// Purge the working set and remove the user.
    #[tracing::instrument(skip(self), fields(user_id = %user_id))]
    pub async fn logout(&self, user_id: Uuid) -> AppResult<()> {
        self.reset(user_id).await?;
        self.users.delete(user_id).await?;
        tracing::info!("User removed");
        Ok(())
    }

    async fn user(&self, user_id: Uuid) -> AppResult<openheart_core::User> {
        self.users
            .get_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))
    }
}
