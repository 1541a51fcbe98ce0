//! In-memory archive used by service and API tests.

use crate::{ArchiveClient, ArchiveError, ResourceSpec, ScanFields, ScanRef};
use async_trait::async_trait;
use chrono::NaiveDate;
use openheart_core::constants::DICOM_RESOURCE;
use openheart_core::ContainerStatus;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct StoredResource {
    pub format: Option<String>,
    pub content: Option<String>,
    pub files: BTreeMap<String, Vec<u8>>,
    /// Payload returned by a zip download, when set.
    pub archive: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Default)]
pub struct StoredScan {
    pub fields: ScanFields,
    pub resources: BTreeMap<String, StoredResource>,
    pub container: Option<ContainerStatus>,
}

type SubjectKey = (String, String);
type ExperimentKey = (String, String, String);

#[derive(Default)]
struct State {
    projects: BTreeSet<String>,
    /// (project, subject); sharing adds the destination project.
    subjects: BTreeSet<SubjectKey>,
    experiments: BTreeMap<ExperimentKey, NaiveDate>,
    scans: BTreeMap<ScanRef, StoredScan>,
    /// (operation, key) pairs that fail with HTTP 500.
    failures: HashSet<(String, String)>,
    calls: Vec<String>,
}

impl State {
    fn fail_if_injected(&self, operation: &str, key: &str) -> Result<(), ArchiveError> {
        if self
            .failures
            .contains(&(operation.to_string(), key.to_string()))
        {
            return Err(ArchiveError::Http {
                status: 500,
                body: format!("injected failure: {} {}", operation, key),
            });
        }
        Ok(())
    }

    fn require_project(&self, project: &str) -> Result<(), ArchiveError> {
        if self.projects.contains(project) {
            Ok(())
        } else {
            Err(ArchiveError::NotFound(format!("project {}", project)))
        }
    }

    fn require_subject(&self, project: &str, subject: &str) -> Result<(), ArchiveError> {
        self.require_project(project)?;
        if self
            .subjects
            .contains(&(project.to_string(), subject.to_string()))
        {
            Ok(())
        } else {
            Err(ArchiveError::NotFound(format!("subject {}", subject)))
        }
    }

    fn record(&mut self, call: String) {
        self.calls.push(call);
    }

    fn scan_mut(&mut self, scan: &ScanRef) -> Result<&mut StoredScan, ArchiveError> {
        self.scans
            .get_mut(scan)
            .ok_or_else(|| ArchiveError::NotFound(format!("scan {}", scan)))
    }
}

/// Archive fake keeping every resource in memory. Sharing copies subject membership
/// into the destination project; scans stay addressed by their staging project.
#[derive(Default)]
pub struct InMemoryArchive {
    state: Mutex<State>,
}

impl InMemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_projects(projects: &[&str]) -> Self {
        let archive = Self::new();
        {
            let mut state = archive.lock();
            state.projects.extend(projects.iter().map(|p| p.to_string()));
        }
        archive
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // a panicking test thread must not hide the state from the assertions that follow
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make `operation` fail for `key` (scan id for scan-level calls, subject otherwise).
    pub fn fail_on(&self, operation: &str, key: &str) {
        self.lock()
            .failures
            .insert((operation.to_string(), key.to_string()));
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn set_container_status(&self, scan: &ScanRef, status: ContainerStatus) {
        if let Some(stored) = self.lock().scans.get_mut(scan) {
            stored.container = Some(status);
        }
    }

    /// Simulate a finished reconstruction: the container completes and the derived
    /// images resource serves `zip` on download.
    pub fn complete_reconstruction(&self, scan: &ScanRef, zip: Vec<u8>) {
        if let Some(stored) = self.lock().scans.get_mut(scan) {
            stored.container = Some(ContainerStatus::Completed);
            stored.resources.insert(
                DICOM_RESOURCE.to_string(),
                StoredResource {
                    archive: Some(zip),
                    ..Default::default()
                },
            );
        }
    }

    pub fn scan(&self, scan: &ScanRef) -> Option<StoredScan> {
        self.lock().scans.get(scan).cloned()
    }

    pub fn scans_in(&self, project: &str) -> Vec<ScanRef> {
        self.lock()
            .scans
            .keys()
            .filter(|s| s.project == project)
            .cloned()
            .collect()
    }

    pub fn has_subject(&self, project: &str, subject: &str) -> bool {
        self.lock()
            .subjects
            .contains(&(project.to_string(), subject.to_string()))
    }

    pub fn has_experiment(&self, project: &str, subject: &str, experiment: &str) -> bool {
        self.lock().experiments.contains_key(&(
            project.to_string(),
            subject.to_string(),
            experiment.to_string(),
        ))
    }

    /// Mutating calls in order, e.g. `create_scan Scan-1234`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, operation: &str) -> usize {
        let prefix = format!("{} ", operation);
        self.lock()
            .calls
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }
}

#[async_trait]
impl ArchiveClient for InMemoryArchive {
    async fn project_exists(&self, project: &str) -> Result<bool, ArchiveError> {
        Ok(self.lock().projects.contains(project))
    }

    async fn subject_exists(&self, project: &str, subject: &str) -> Result<bool, ArchiveError> {
        let state = self.lock();
        state.require_project(project)?;
        Ok(state
            .subjects
            .contains(&(project.to_string(), subject.to_string())))
    }

    async fn create_subject(&self, project: &str, subject: &str) -> Result<(), ArchiveError> {
        let mut state = self.lock();
        state.require_project(project)?;
        state.fail_if_injected("create_subject", subject)?;
        if !state
            .subjects
            .insert((project.to_string(), subject.to_string()))
        {
            return Err(ArchiveError::AlreadyExists(format!("subject {}", subject)));
        }
        state.record(format!("create_subject {}", subject));
        Ok(())
    }

    async fn experiment_exists(
        &self,
        project: &str,
        subject: &str,
        experiment: &str,
    ) -> Result<bool, ArchiveError> {
        let state = self.lock();
        state.require_subject(project, subject)?;
        Ok(state.experiments.contains_key(&(
            project.to_string(),
            subject.to_string(),
            experiment.to_string(),
        )))
    }

    async fn create_experiment(
        &self,
        project: &str,
        subject: &str,
        experiment: &str,
        date: NaiveDate,
    ) -> Result<(), ArchiveError> {
        let mut state = self.lock();
        state.require_subject(project, subject)?;
        let key = (
            project.to_string(),
            subject.to_string(),
            experiment.to_string(),
        );
        if state.experiments.contains_key(&key) {
            return Err(ArchiveError::AlreadyExists(format!(
                "experiment {}",
                experiment
            )));
        }
        state.experiments.insert(key, date);
        state.record(format!("create_experiment {}", experiment));
        Ok(())
    }

    async fn scan_exists(&self, scan: &ScanRef) -> Result<bool, ArchiveError> {
        Ok(self.lock().scans.contains_key(scan))
    }

    async fn create_scan(&self, scan: &ScanRef, fields: &ScanFields) -> Result<(), ArchiveError> {
        let mut state = self.lock();
        let experiment = (
            scan.project.clone(),
            scan.subject.clone(),
            scan.experiment.clone(),
        );
        if !state.experiments.contains_key(&experiment) {
            return Err(ArchiveError::NotFound(format!(
                "experiment {}",
                scan.experiment
            )));
        }
        state.fail_if_injected("create_scan", &scan.scan)?;
        if state.scans.contains_key(scan) {
            return Err(ArchiveError::AlreadyExists(format!("scan {}", scan)));
        }
        state.scans.insert(
            scan.clone(),
            StoredScan {
                fields: fields.clone(),
                ..Default::default()
            },
        );
        state.record(format!("create_scan {}", scan.scan));
        Ok(())
    }

    async fn set_scan_fields(
        &self,
        scan: &ScanRef,
        fields: &ScanFields,
    ) -> Result<(), ArchiveError> {
        let mut state = self.lock();
        let stored = state.scan_mut(scan)?;
        stored
            .fields
            .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        state.record(format!("set_scan_fields {}", scan.scan));
        Ok(())
    }

    async fn resource_exists(&self, scan: &ScanRef, label: &str) -> Result<bool, ArchiveError> {
        let mut state = self.lock();
        Ok(state.scan_mut(scan)?.resources.contains_key(label))
    }

    async fn upload_resource_file(
        &self,
        scan: &ScanRef,
        spec: &ResourceSpec,
        path: &Path,
    ) -> Result<(), ArchiveError> {
        let bytes = tokio::fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let mut state = self.lock();
        state.fail_if_injected("upload_resource_file", &scan.scan)?;
        let stored = state.scan_mut(scan)?;
        let resource = stored.resources.entry(spec.label.clone()).or_default();
        resource.format = spec.format.clone().or(resource.format.take());
        resource.content = spec.content.clone().or(resource.content.take());
        resource.files.insert(name.clone(), bytes);
        state.record(format!("upload_resource_file {} {} {}", scan.scan, spec.label, name));
        Ok(())
    }

    async fn download_resource_zip(
        &self,
        scan: &ScanRef,
        label: &str,
        dest: &Path,
    ) -> Result<(), ArchiveError> {
        let payload = {
            let mut state = self.lock();
            state.fail_if_injected("download_resource_zip", &scan.scan)?;
            let stored = state.scan_mut(scan)?;
            stored
                .resources
                .get(label)
                .and_then(|r| r.archive.clone())
                .ok_or_else(|| {
                    ArchiveError::NotFound(format!("resource {} of scan {}", label, scan))
                })?
        };
        tokio::fs::write(dest, payload).await?;
        Ok(())
    }

    async fn container_status(&self, scan: &ScanRef) -> Result<ContainerStatus, ArchiveError> {
        let mut state = self.lock();
        state.fail_if_injected("container_status", &scan.scan)?;
        let stored = state.scan_mut(scan)?;
        Ok(match stored.container {
            Some(status) => status,
            None if stored.resources.contains_key(DICOM_RESOURCE) => ContainerStatus::Completed,
            None => ContainerStatus::Unknown,
        })
    }

    async fn share_subject(
        &self,
        project: &str,
        subject: &str,
        destination: &str,
    ) -> Result<(), ArchiveError> {
        let mut state = self.lock();
        state.require_subject(project, subject)?;
        state.require_project(destination)?;
        state.fail_if_injected("share_subject", subject)?;
        if !state
            .subjects
            .insert((destination.to_string(), subject.to_string()))
        {
            return Err(ArchiveError::AlreadyExists(format!(
                "subject {} in {}",
                subject, destination
            )));
        }
        state.record(format!("share_subject {} {}", subject, destination));
        Ok(())
    }

    async fn share_experiment(
        &self,
        project: &str,
        subject: &str,
        experiment: &str,
        destination: &str,
    ) -> Result<(), ArchiveError> {
        let mut state = self.lock();
        let source = (
            project.to_string(),
            subject.to_string(),
            experiment.to_string(),
        );
        let date = *state
            .experiments
            .get(&source)
            .ok_or_else(|| ArchiveError::NotFound(format!("experiment {}", experiment)))?;
        state.require_project(destination)?;
        state.fail_if_injected("share_experiment", subject)?;
        state.experiments.insert(
            (
                destination.to_string(),
                subject.to_string(),
                experiment.to_string(),
            ),
            date,
        );
        state.record(format!("share_experiment {} {}", experiment, destination));
        Ok(())
    }

    async fn delete_scan(&self, scan: &ScanRef) -> Result<(), ArchiveError> {
        let mut state = self.lock();
        state.fail_if_injected("delete_scan", &scan.scan)?;
        if state.scans.remove(scan).is_none() {
            return Err(ArchiveError::NotFound(format!("scan {}", scan)));
        }
        state.record(format!("delete_scan {}", scan.scan));
        Ok(())
    }

    async fn delete_subject(&self, project: &str, subject: &str) -> Result<(), ArchiveError> {
        let mut state = self.lock();
        state.fail_if_injected("delete_subject", subject)?;
        if !state
            .subjects
            .remove(&(project.to_string(), subject.to_string()))
        {
            return Err(ArchiveError::NotFound(format!("subject {}", subject)));
        }
        state
            .experiments
            .retain(|(p, s, _), _| !(p == project && s == subject));
        state
            .scans
            .retain(|k, _| !(k.project == project && k.subject == subject));
        state.record(format!("delete_subject {}", subject));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 1).unwrap()
    }

    #[tokio::test]
    async fn test_hierarchy_requires_parents() {
        let archive = InMemoryArchive::with_projects(&["vault"]);
        let scan = ScanRef::new("vault", "S1", "Exp-1", "Scan-1");

        assert!(archive
            .create_scan(&scan, &ScanFields::new())
            .await
            .unwrap_err()
            .is_not_found());

        archive.create_subject("vault", "S1").await.unwrap();
        assert!(archive
            .create_subject("vault", "S1")
            .await
            .unwrap_err()
            .is_conflict());
        archive
            .create_experiment("vault", "S1", "Exp-1", date())
            .await
            .unwrap();
        archive.create_scan(&scan, &ScanFields::new()).await.unwrap();
        assert!(archive.scan_exists(&scan).await.unwrap());
        assert_eq!(
            archive.container_status(&scan).await.unwrap(),
            ContainerStatus::Unknown
        );
    }

    #[tokio::test]
    async fn test_delete_subject_removes_scans() {
        let archive = InMemoryArchive::with_projects(&["vault"]);
        let scan = ScanRef::new("vault", "S1", "Exp-1", "Scan-1");
        archive.create_subject("vault", "S1").await.unwrap();
        archive
            .create_experiment("vault", "S1", "Exp-1", date())
            .await
            .unwrap();
        archive.create_scan(&scan, &ScanFields::new()).await.unwrap();

        archive.delete_subject("vault", "S1").await.unwrap();
        assert!(!archive.scan_exists(&scan).await.unwrap());
        assert!(archive.delete_scan(&scan).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let archive = InMemoryArchive::with_projects(&["vault"]);
        archive.fail_on("create_subject", "S1");
        let err = archive.create_subject("vault", "S1").await.unwrap_err();
        assert!(matches!(err, ArchiveError::Http { status: 500, .. }));
        archive.clear_failures();
        archive.create_subject("vault", "S1").await.unwrap();
        assert_eq!(archive.count_calls("create_subject"), 1);
    }
}
