use crate::{ArchiveError, ResourceSpec, ScanFields, ScanRef};
use async_trait::async_trait;
use chrono::NaiveDate;
use openheart_core::ContainerStatus;
use std::path::Path;

/// Resource operations of the remote archive: Project, Subject, Experiment, Scan and
/// Resource, each addressed by caller-chosen identifiers.
///
/// Creation calls report an existing resource as [`ArchiveError::AlreadyExists`], and
/// lookups or deletions of absent resources as [`ArchiveError::NotFound`]. Callers decide
/// which of those are acceptable.
#[async_trait]
pub trait ArchiveClient: Send + Sync {
    async fn project_exists(&self, project: &str) -> Result<bool, ArchiveError>;

    async fn subject_exists(&self, project: &str, subject: &str) -> Result<bool, ArchiveError>;

    async fn create_subject(&self, project: &str, subject: &str) -> Result<(), ArchiveError>;

    async fn experiment_exists(
        &self,
        project: &str,
        subject: &str,
        experiment: &str,
    ) -> Result<bool, ArchiveError>;

    /// Create an MR session dated `date`.
    async fn create_experiment(
        &self,
        project: &str,
        subject: &str,
        experiment: &str,
        date: NaiveDate,
    ) -> Result<(), ArchiveError>;

    async fn scan_exists(&self, scan: &ScanRef) -> Result<bool, ArchiveError>;

    /// Create an MR scan carrying `fields`.
    async fn create_scan(&self, scan: &ScanRef, fields: &ScanFields) -> Result<(), ArchiveError>;

    /// Set additional metadata fields on an existing scan.
    async fn set_scan_fields(&self, scan: &ScanRef, fields: &ScanFields)
        -> Result<(), ArchiveError>;

    async fn resource_exists(&self, scan: &ScanRef, label: &str) -> Result<bool, ArchiveError>;

    /// Upload one local file into the resource described by `spec`, creating the
    /// resource if needed.
    async fn upload_resource_file(
        &self,
        scan: &ScanRef,
        spec: &ResourceSpec,
        path: &Path,
    ) -> Result<(), ArchiveError>;

    /// Download every file of a resource as one zip written to `dest`.
    async fn download_resource_zip(
        &self,
        scan: &ScanRef,
        label: &str,
        dest: &Path,
    ) -> Result<(), ArchiveError>;

    /// Status of the reconstruction container launched for `scan`.
    async fn container_status(&self, scan: &ScanRef) -> Result<ContainerStatus, ArchiveError>;

    /// Share a subject into `destination` as its primary project.
    async fn share_subject(
        &self,
        project: &str,
        subject: &str,
        destination: &str,
    ) -> Result<(), ArchiveError>;

    async fn share_experiment(
        &self,
        project: &str,
        subject: &str,
        experiment: &str,
        destination: &str,
    ) -> Result<(), ArchiveError>;

    /// Delete a scan and its files.
    async fn delete_scan(&self, scan: &ScanRef) -> Result<(), ArchiveError>;

    /// Delete a subject with all experiments below it.
    async fn delete_subject(&self, project: &str, subject: &str) -> Result<(), ArchiveError>;
}
