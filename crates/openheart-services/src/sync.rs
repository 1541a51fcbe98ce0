//! Synchronization of File Records with the remote archive.
//!
//! Every step is driven by the record flags, so re-running a step against records that
//! already advanced does nothing. Remote "already exists" answers are treated as evidence
//! of an earlier partial run and the existing resource is reused; "not found" answers
//! during deletion mean the goal is already reached.

use crate::cleanup::{preview_dir, remove_dir_if_exists, remove_record_files};
use crate::ingest::extract_all;
use chrono::{NaiveDate, Utc};
use openheart_archive::{ArchiveClient, ArchiveError, ResourceSpec, ScanFields, ScanRef};
use openheart_core::constants::{
    DICOM_RESOURCE, EXPERIMENT_PREFIX, RAW_RESOURCE, RAW_RESOURCE_CONTENT, RAW_RESOURCE_FORMAT,
    SCAN_PREFIX, SCAN_UID_FIELD, SNAPSHOT_CONTENT_OVERVIEW, SNAPSHOT_CONTENT_THUMBNAIL,
    SNAPSHOT_FORMAT, SNAPSHOT_RESOURCE,
};
use openheart_core::{
    group_by_subject_unique, AppError, AppResult, Config, ContainerStatus, FileFormat, FileRecord,
    RemoteScanIds,
};
use openheart_db::{FileFilter, FileRepository};
use openheart_processing::preview::{MONTAGE_FILE, THUMBNAIL_FILE};
use openheart_processing::{build_preview, read_header, PreviewArtifacts, PreviewError, PreviewOptions};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

const EXPERIMENT_ID_HEX_LEN: usize = 8;
const SCAN_ID_HEX_LEN: usize = 16;
const DERIVED_ZIP_NAME: &str = "derived.zip";

/// Remote experiment id for a subject-unique group.
pub fn experiment_id_for(subject_unique: &str) -> String {
    let digest = hex::encode(Sha256::digest(subject_unique.as_bytes()));
    format!("{}{}", EXPERIMENT_PREFIX, &digest[..EXPERIMENT_ID_HEX_LEN])
}

/// Remote scan id derived from a record's content digest. Stable across retries and
/// independent of the order in which records are transmitted.
pub fn scan_id_for(content_digest: &str) -> String {
    let len = content_digest.len().min(SCAN_ID_HEX_LEN);
    format!("{}{}", SCAN_PREFIX, &content_digest[..len])
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub vault_project: String,
    pub open_project: String,
    /// Root of the per-record scratch directories used while downloading.
    pub temp_path: PathBuf,
    pub preview_path: PathBuf,
    pub preview: PreviewOptions,
}

impl SyncConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            vault_project: config.archive.vault_project.clone(),
            open_project: config.archive.open_project.clone(),
            temp_path: config.temp_path.clone(),
            preview_path: config.preview_path.clone(),
            preview: PreviewOptions {
                fps: config.preview_fps,
                ..PreviewOptions::default()
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TransmitReport {
    pub subjects: usize,
    pub transmitted: Vec<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    pub checked: usize,
    pub reconstructed: Vec<Uuid>,
    /// Records whose status query or download failed this round.
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FinalizeReport {
    pub published: Vec<String>,
    pub rejected: Vec<String>,
    pub submitted: usize,
    pub deleted: usize,
}

fn preview_error(err: PreviewError) -> AppError {
    match err {
        PreviewError::Empty(dir) => AppError::PreconditionFailed(format!(
            "no derived images in {}",
            dir.display()
        )),
        PreviewError::Io(e) => AppError::Io(e),
        other => AppError::Internal(other.to_string()),
    }
}

/// Treat an "already exists" answer as success.
fn tolerate_conflict(result: Result<(), ArchiveError>, what: &str) -> Result<(), ArchiveError> {
    match result {
        Err(e) if e.is_conflict() => {
            tracing::warn!(resource = %what, "Remote resource already exists, continuing");
            Ok(())
        }
        other => other,
    }
}

/// Treat a "not found" answer during deletion as success.
fn tolerate_missing(result: Result<(), ArchiveError>, what: &str) -> Result<(), ArchiveError> {
    match result {
        Err(e) if e.is_not_found() => {
            tracing::warn!(resource = %what, "Remote resource already gone");
            Ok(())
        }
        other => other,
    }
}

#[derive(Clone)]
pub struct ArchiveSync {
    files: FileRepository,
    archive: Arc<dyn ArchiveClient>,
    config: SyncConfig,
}

impl ArchiveSync {
    pub fn new(files: FileRepository, archive: Arc<dyn ArchiveClient>, config: SyncConfig) -> Self {
        Self {
            files,
            archive,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn scan_ref(&self, record: &FileRecord) -> Option<ScanRef> {
        record.remote.as_ref().map(|ids| {
            ScanRef::new(
                &self.config.vault_project,
                &ids.subject_id,
                &ids.experiment_id,
                &ids.scan_id,
            )
        })
    }

    /// Push every not-yet-transmitted standard-format record to the staging project.
    #[tracing::instrument(skip(self), fields(user_id = %user_id))]
    pub async fn transmit(&self, user_id: Uuid) -> AppResult<TransmitReport> {
        let records = self
            .files
            .list(
                user_id,
                &FileFilter::not_transmitted().with_format(FileFormat::StandardRaw),
            )
            .await?;
        let mut report = TransmitReport::default();
        if records.is_empty() {
            return Ok(report);
        }

        let vault = &self.config.vault_project;
        if !self.archive.project_exists(vault).await? {
            return Err(AppError::RemoteNotFound(format!("project {}", vault)));
        }

        let today = Utc::now().date_naive();
        let mut failed = Vec::new();

        for (subject_unique, group) in group_by_subject_unique(records).iter() {
            report.subjects += 1;
            let experiment = experiment_id_for(subject_unique);

            if let Err(e) = self.ensure_session(subject_unique, &experiment, today).await {
                tracing::error!(error = %e, subject = %subject_unique, "Failed to prepare remote subject");
                failed.extend(group.iter().map(|r| r.original_name.clone()));
                continue;
            }

            for record in group {
                match self
                    .transmit_record(record, subject_unique, &experiment, today)
                    .await
                {
                    Ok(true) => report.transmitted.push(record.id),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            record_id = %record.id,
                            file = %record.original_name,
                            "Transmission failed"
                        );
                        failed.push(record.original_name.clone());
                    }
                }
            }
        }

        if !failed.is_empty() {
            return Err(AppError::BatchFailed {
                operation: "transmit".to_string(),
                failed,
            });
        }
        tracing::info!(count = report.transmitted.len(), subjects = report.subjects, "Transmitted");
        Ok(report)
    }

    async fn ensure_session(
        &self,
        subject: &str,
        experiment: &str,
        date: NaiveDate,
    ) -> Result<(), ArchiveError> {
        let vault = &self.config.vault_project;

        if self.archive.subject_exists(vault, subject).await? {
            tracing::warn!(subject = %subject, "Remote subject already exists, reusing it");
        } else {
            tolerate_conflict(self.archive.create_subject(vault, subject).await, subject)?;
        }

        if self
            .archive
            .experiment_exists(vault, subject, experiment)
            .await?
        {
            tracing::warn!(experiment = %experiment, "Remote experiment already exists, reusing it");
        } else {
            tolerate_conflict(
                self.archive
                    .create_experiment(vault, subject, experiment, date)
                    .await,
                experiment,
            )?;
        }
        Ok(())
    }

    async fn transmit_record(
        &self,
        record: &FileRecord,
        subject: &str,
        experiment: &str,
        date: NaiveDate,
    ) -> AppResult<bool> {
        let (Some(unique_path), Some(digest)) = (record.unique_path.as_deref(), record.content_digest())
        else {
            return Err(AppError::PreconditionFailed(format!(
                "{} has no content identity",
                record.original_name
            )));
        };
        let path = Path::new(unique_path);
        let scan = ScanRef::new(&self.config.vault_project, subject, experiment, scan_id_for(digest));

        if self.archive.scan_exists(&scan).await? {
            tracing::warn!(scan_id = %scan.scan, "Remote scan already exists, reusing it");
        } else {
            let header = read_header(path).await.map_err(|e| AppError::PreconditionFailed(format!(
                "unreadable acquisition header in {}: {}",
                record.original_name, e
            )))?;
            let fields: ScanFields = header.to_scan_fields();
            tolerate_conflict(self.archive.create_scan(&scan, &fields).await, &scan.scan)?;
        }

        let raw = ResourceSpec::new(RAW_RESOURCE)
            .with_format(RAW_RESOURCE_FORMAT)
            .with_content(RAW_RESOURCE_CONTENT);
        self.archive.upload_resource_file(&scan, &raw, path).await?;

        let ids = RemoteScanIds {
            subject_id: scan.subject.clone(),
            experiment_id: scan.experiment.clone(),
            scan_id: scan.scan.clone(),
            experiment_date: Some(date),
        };
        let marked = self.files.mark_transmitted(record.user_id, record.id, &ids).await?;
        tracing::info!(record_id = %record.id, scan_id = %scan.scan, "Record transmitted");
        Ok(marked)
    }

    /// Query reconstruction status for every record still waiting for it, and retrieve
    /// derived images for the completed ones. Per-record failures are reported, not
    /// raised.
    #[tracing::instrument(skip(self), fields(user_id = %user_id))]
    pub async fn poll(&self, user_id: Uuid) -> AppResult<PollReport> {
        let records = self.files.list_transmitted_pending(user_id).await?;
        let mut report = PollReport::default();

        for record in records.iter().filter(|r| r.awaiting_reconstruction()) {
            let Some(scan) = self.scan_ref(record) else {
                continue;
            };
            report.checked += 1;

            let status = match self.archive.container_status(&scan).await {
                Ok(status) => status,
                Err(e) => {
                    tracing::warn!(error = %e, scan_id = %scan.scan, "Status query failed");
                    report.failed.push(record.original_name.clone());
                    continue;
                }
            };
            if status != record.container_status {
                self.files
                    .set_container_status(user_id, record.id, status)
                    .await?;
            }
            if status == ContainerStatus::Failed {
                tracing::warn!(record_id = %record.id, scan_id = %scan.scan, "Reconstruction failed remotely");
            }
            if status != ContainerStatus::Completed {
                continue;
            }

            match self.retrieve(record, &scan).await {
                Ok(_) => {
                    if self.files.mark_reconstructed(user_id, record.id).await? {
                        report.reconstructed.push(record.id);
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, record_id = %record.id, "Retrieving derived images failed");
                    report.failed.push(record.original_name.clone());
                }
            }
        }
        Ok(report)
    }

    /// Download the derived images of a completed scan, build its preview and stamp the
    /// series identifier on the remote scan. The scratch directory never outlives the call.
    async fn retrieve(&self, record: &FileRecord, scan: &ScanRef) -> AppResult<PreviewArtifacts> {
        let scratch = self
            .config
            .temp_path
            .join(record.user_id.to_string())
            .join(record.id.to_string());
        let result = self.retrieve_into(&scratch, record, scan).await;
        if let Err(e) = remove_dir_if_exists(&scratch).await {
            tracing::warn!(error = %e, path = %scratch.display(), "Failed to remove scratch directory");
        }
        result
    }

    async fn retrieve_into(
        &self,
        scratch: &Path,
        record: &FileRecord,
        scan: &ScanRef,
    ) -> AppResult<PreviewArtifacts> {
        tokio::fs::create_dir_all(scratch).await?;
        let zip_path = scratch.join(DERIVED_ZIP_NAME);
        self.archive
            .download_resource_zip(scan, DICOM_RESOURCE, &zip_path)
            .await?;

        let images = scratch.join("images");
        {
            let zip_path = zip_path.clone();
            let images = images.clone();
            tokio::task::spawn_blocking(move || extract_all(&zip_path, &images))
                .await
                .map_err(|e| AppError::Internal(format!("Extraction task failed: {}", e)))??;
        }

        let out = preview_dir(&self.config.preview_path, record.user_id, record.id);
        let artifacts = build_preview(&images, &out, &self.config.preview)
            .await
            .map_err(preview_error)?;

        if let Some(uid) = &artifacts.series_instance_uid {
            let mut fields = ScanFields::new();
            fields.insert(SCAN_UID_FIELD.to_string(), uid.clone());
            self.archive.set_scan_fields(scan, &fields).await?;
        }
        Ok(artifacts)
    }

    /// Publish the accepted subjects and reject everything else still pending.
    #[tracing::instrument(skip(self, accepted), fields(user_id = %user_id, accepted = accepted.len()))]
    pub async fn finalize(&self, user_id: Uuid, accepted: &[String]) -> AppResult<FinalizeReport> {
        let accepted: BTreeSet<&str> = accepted.iter().map(String::as_str).collect();
        let pending = self.files.list_pending(user_id).await?;
        let mut report = FinalizeReport::default();
        let mut failed = Vec::new();

        for (subject_unique, records) in group_by_subject_unique(pending).iter() {
            let (ready, rest): (Vec<&FileRecord>, Vec<&FileRecord>) = if accepted.contains(subject_unique) {
                records.iter().partition(|r| r.reconstructed)
            } else {
                (Vec::new(), records.iter().collect())
            };

            if !ready.is_empty() {
                match self.publish(subject_unique, &ready).await {
                    Ok(count) => {
                        report.submitted += count;
                        report.published.push(subject_unique.to_string());
                    }
                    Err(e) => {
                        tracing::error!(error = %e, subject = %subject_unique, "Publishing failed");
                        failed.push(subject_unique.to_string());
                        continue;
                    }
                }
            }
            if rest.is_empty() {
                continue;
            }

            let mut all_removed = true;
            for record in &rest {
                match self.reject_record(record).await {
                    Ok(()) => report.deleted += 1,
                    Err(e) => {
                        tracing::error!(error = %e, record_id = %record.id, "Rejecting record failed");
                        failed.push(record.original_name.clone());
                        all_removed = false;
                    }
                }
            }

            if ready.is_empty() && all_removed {
                if let Some(ids) = rest.iter().find_map(|r| r.remote.as_ref()) {
                    let result = self
                        .archive
                        .delete_subject(&self.config.vault_project, &ids.subject_id)
                        .await;
                    if let Err(e) = tolerate_missing(result, &ids.subject_id) {
                        tracing::error!(error = %e, subject = %subject_unique, "Deleting remote subject failed");
                        failed.push(subject_unique.to_string());
                        continue;
                    }
                }
                report.rejected.push(subject_unique.to_string());
            }
        }

        if !failed.is_empty() {
            return Err(AppError::BatchFailed {
                operation: "finalize".to_string(),
                failed,
            });
        }
        tracing::info!(
            published = report.published.len(),
            rejected = report.rejected.len(),
            submitted = report.submitted,
            "Finalized"
        );
        Ok(report)
    }

    /// Share one subject and its experiments into the public project, then mark its
    /// records submitted. A subject already present in the destination is not shared
    /// again, but any of its experiments still missing there are.
    async fn publish(&self, subject_unique: &str, records: &[&FileRecord]) -> AppResult<usize> {
        let vault = &self.config.vault_project;
        let open = &self.config.open_project;
        let Some(subject_id) = records
            .iter()
            .find_map(|r| r.remote.as_ref())
            .map(|ids| ids.subject_id.clone())
        else {
            return Err(AppError::PreconditionFailed(format!(
                "{} was never transmitted",
                subject_unique
            )));
        };

        if self.archive.subject_exists(open, &subject_id).await? {
            tracing::warn!(subject = %subject_id, project = %open, "Subject already in destination, skipping subject share");
        } else {
            for record in records {
                self.attach_snapshots(record).await?;
            }
            tolerate_conflict(
                self.archive.share_subject(vault, &subject_id, open).await,
                &subject_id,
            )?;
        }

        let experiments: BTreeSet<&str> = records
            .iter()
            .filter_map(|r| r.remote.as_ref())
            .map(|ids| ids.experiment_id.as_str())
            .collect();
        for experiment in experiments {
            if self
                .archive
                .experiment_exists(open, &subject_id, experiment)
                .await?
            {
                tracing::debug!(experiment, project = %open, "Experiment already in destination");
                continue;
            }
            tolerate_conflict(
                self.archive
                    .share_experiment(vault, &subject_id, experiment, open)
                    .await,
                experiment,
            )?;
        }

        let mut submitted = 0;
        for record in records {
            if self.files.mark_submitted(record.user_id, record.id).await? {
                submitted += 1;
            }
        }
        tracing::info!(subject = %subject_id, submitted, "Subject published");
        Ok(submitted)
    }

    async fn attach_snapshots(&self, record: &FileRecord) -> AppResult<()> {
        let Some(scan) = self.scan_ref(record) else {
            return Ok(());
        };
        let dir = preview_dir(&self.config.preview_path, record.user_id, record.id);
        for (file, content) in [
            (THUMBNAIL_FILE, SNAPSHOT_CONTENT_THUMBNAIL),
            (MONTAGE_FILE, SNAPSHOT_CONTENT_OVERVIEW),
        ] {
            let path = dir.join(file);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                tracing::warn!(record_id = %record.id, file, "Snapshot missing, not attached");
                continue;
            }
            let spec = ResourceSpec::new(SNAPSHOT_RESOURCE)
                .with_format(SNAPSHOT_FORMAT)
                .with_content(content);
            self.archive.upload_resource_file(&scan, &spec, &path).await?;
        }
        Ok(())
    }

    async fn reject_record(&self, record: &FileRecord) -> AppResult<()> {
        if let Some(scan) = self.scan_ref(record) {
            tolerate_missing(self.archive.delete_scan(&scan).await, &scan.scan)?;
        }
        self.files.delete(record.user_id, record.id).await?;
        remove_record_files(record, &self.config.preview_path).await;
        tracing::info!(record_id = %record.id, subject = %record.subject_unique, "Record rejected");
        Ok(())
    }
}
