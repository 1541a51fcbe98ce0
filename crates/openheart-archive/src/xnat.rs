//! REST client for an XNAT server.

use crate::{ArchiveClient, ArchiveError, ResourceSpec, ScanFields, ScanRef};
use async_trait::async_trait;
use chrono::NaiveDate;
use openheart_core::constants::{
    DICOM_RESOURCE, EXPERIMENT_DATE_FORMAT, SCAN_XSI_TYPE, SESSION_XSI_TYPE,
};
use openheart_core::{ArchiveConfig, ContainerStatus};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Map a container-service status string onto [`ContainerStatus`].
pub fn map_container_status(status: &str) -> ContainerStatus {
    let status = status.trim().to_ascii_lowercase();
    match status.as_str() {
        "created" | "waiting" | "queued" => ContainerStatus::Created,
        "running" | "started" => ContainerStatus::Running,
        "finalizing" => ContainerStatus::Finishing,
        "complete" | "completed" => ContainerStatus::Completed,
        "killed" => ContainerStatus::Failed,
        s if s.starts_with("failed") => ContainerStatus::Failed,
        _ => ContainerStatus::Unknown,
    }
}

#[derive(Debug, Deserialize)]
struct ContainerInput {
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContainerSummary {
    #[serde(default)]
    id: i64,
    #[serde(default)]
    status: String,
    #[serde(default)]
    inputs: Vec<ContainerInput>,
}

impl ContainerSummary {
    fn targets(&self, scan: &ScanRef) -> bool {
        let suffix = format!("/scans/{}", scan.scan);
        self.inputs
            .iter()
            .filter_map(|i| i.value.as_deref())
            .any(|v| v.ends_with(&suffix))
    }
}

#[derive(Clone)]
pub struct XnatClient {
    client: Client,
    base_url: Url,
    username: String,
    password: String,
}

impl XnatClient {
    pub fn new(
        base_url: &str,
        username: impl Into<String>,
        password: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ArchiveError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ArchiveError::InvalidResponse(format!("invalid server URL: {}", e)))?;
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url,
            username: username.into(),
            password: password.into(),
        })
    }

    pub fn from_config(config: &ArchiveConfig) -> Result<Self, ArchiveError> {
        Self::new(
            &config.server_url,
            &config.username,
            &config.password,
            Duration::from_secs(config.timeout_seconds),
        )
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ArchiveError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ArchiveError::InvalidResponse("server URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn data_url(&self, segments: &[&str]) -> Result<Url, ArchiveError> {
        let mut all = Vec::with_capacity(segments.len() + 1);
        all.push("data");
        all.extend_from_slice(segments);
        self.url(&all)
    }

    fn scan_url(&self, scan: &ScanRef, tail: &[&str]) -> Result<Url, ArchiveError> {
        let mut segments = scan.segments().to_vec();
        segments.extend_from_slice(tail);
        self.data_url(&segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    /// Turn a non-success response into an error. `what` names the addressed resource.
    async fn check(response: Response, what: &str) -> Result<Response, ArchiveError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        match status {
            StatusCode::NOT_FOUND => Err(ArchiveError::NotFound(what.to_string())),
            StatusCode::CONFLICT => Err(ArchiveError::AlreadyExists(what.to_string())),
            _ => Err(ArchiveError::Http {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }

    async fn exists(&self, url: Url, what: &str) -> Result<bool, ArchiveError> {
        let response = self
            .request(Method::GET, url)
            .query(&[("format", "json")])
            .send()
            .await?;
        match Self::check(response, what).await {
            Ok(_) => Ok(true),
            Err(ArchiveError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn send(&self, method: Method, url: Url, what: &str) -> Result<(), ArchiveError> {
        tracing::debug!(method = %method, url = %url, "Archive request");
        let response = self.request(method, url).send().await?;
        Self::check(response, what).await?;
        Ok(())
    }

    async fn latest_container(
        &self,
        scan: &ScanRef,
    ) -> Result<Option<ContainerSummary>, ArchiveError> {
        let mut url = self.url(&["xapi", "containers"])?;
        url.query_pairs_mut().append_pair("project", &scan.project);
        let response = self.request(Method::GET, url).send().await?;
        let response = Self::check(response, "container list").await?;
        let containers: Vec<ContainerSummary> = response
            .json()
            .await
            .map_err(|e| ArchiveError::InvalidResponse(format!("container list: {}", e)))?;

        Ok(containers
            .into_iter()
            .filter(|c| c.targets(scan))
            .max_by_key(|c| c.id))
    }
}

#[async_trait]
impl ArchiveClient for XnatClient {
    async fn project_exists(&self, project: &str) -> Result<bool, ArchiveError> {
        let url = self.data_url(&["projects", project])?;
        self.exists(url, &format!("project {}", project)).await
    }

    async fn subject_exists(&self, project: &str, subject: &str) -> Result<bool, ArchiveError> {
        let url = self.data_url(&["projects", project, "subjects", subject])?;
        self.exists(url, &format!("subject {}", subject)).await
    }

    async fn create_subject(&self, project: &str, subject: &str) -> Result<(), ArchiveError> {
        let url = self.data_url(&["projects", project, "subjects", subject])?;
        self.send(Method::PUT, url, &format!("subject {}", subject))
            .await
    }

    async fn experiment_exists(
        &self,
        project: &str,
        subject: &str,
        experiment: &str,
    ) -> Result<bool, ArchiveError> {
        let url = self.data_url(&[
            "projects",
            project,
            "subjects",
            subject,
            "experiments",
            experiment,
        ])?;
        self.exists(url, &format!("experiment {}", experiment)).await
    }

    async fn create_experiment(
        &self,
        project: &str,
        subject: &str,
        experiment: &str,
        date: NaiveDate,
    ) -> Result<(), ArchiveError> {
        let mut url = self.data_url(&[
            "projects",
            project,
            "subjects",
            subject,
            "experiments",
            experiment,
        ])?;
        url.query_pairs_mut()
            .append_pair("xsiType", SESSION_XSI_TYPE)
            .append_pair(
                &format!("{}/date", SESSION_XSI_TYPE),
                &date.format(EXPERIMENT_DATE_FORMAT).to_string(),
            );
        self.send(Method::PUT, url, &format!("experiment {}", experiment))
            .await
    }

    async fn scan_exists(&self, scan: &ScanRef) -> Result<bool, ArchiveError> {
        let url = self.scan_url(scan, &[])?;
        self.exists(url, &format!("scan {}", scan)).await
    }

    async fn create_scan(&self, scan: &ScanRef, fields: &ScanFields) -> Result<(), ArchiveError> {
        let mut url = self.scan_url(scan, &[])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("xsiType", SCAN_XSI_TYPE);
            for (key, value) in fields {
                query.append_pair(key, value);
            }
        }
        self.send(Method::PUT, url, &format!("scan {}", scan)).await
    }

    async fn set_scan_fields(
        &self,
        scan: &ScanRef,
        fields: &ScanFields,
    ) -> Result<(), ArchiveError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut url = self.scan_url(scan, &[])?;
        url.query_pairs_mut().extend_pairs(fields.iter());
        self.send(Method::PUT, url, &format!("scan {}", scan)).await
    }

    async fn resource_exists(&self, scan: &ScanRef, label: &str) -> Result<bool, ArchiveError> {
        let url = self.scan_url(scan, &["resources", label])?;
        self.exists(url, &format!("resource {} of scan {}", label, scan))
            .await
    }

    async fn upload_resource_file(
        &self,
        scan: &ScanRef,
        spec: &ResourceSpec,
        path: &Path,
    ) -> Result<(), ArchiveError> {
        let what = format!("resource {} of scan {}", spec.label, scan);
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ArchiveError::InvalidResponse(format!("invalid file name {}", path.display())))?;

        let mut resource_url = self.scan_url(scan, &["resources", &spec.label])?;
        {
            let mut query = resource_url.query_pairs_mut();
            if let Some(format) = &spec.format {
                query.append_pair("format", format);
            }
            if let Some(content) = &spec.content {
                query.append_pair("content", content);
            }
        }
        match self.send(Method::PUT, resource_url, &what).await {
            Ok(()) => {}
            Err(ArchiveError::AlreadyExists(_)) => {
                tracing::debug!(resource = %spec.label, scan = %scan, "Resource already exists");
            }
            Err(e) => return Err(e),
        }

        let mut file_url = self.scan_url(scan, &["resources", &spec.label, "files", file_name])?;
        {
            let mut query = file_url.query_pairs_mut();
            query.append_pair("inbody", "true").append_pair("overwrite", "true");
            if let Some(format) = &spec.format {
                query.append_pair("format", format);
            }
            if let Some(content) = &spec.content {
                query.append_pair("content", content);
            }
        }

        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let start = std::time::Instant::now();
        let response = self
            .request(Method::PUT, file_url)
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(body)
            .send()
            .await?;
        Self::check(response, &what).await?;

        tracing::info!(
            scan = %scan,
            resource = %spec.label,
            size_bytes = size,
            duration_ms = start.elapsed().as_millis(),
            "Uploaded resource file"
        );
        Ok(())
    }

    async fn download_resource_zip(
        &self,
        scan: &ScanRef,
        label: &str,
        dest: &Path,
    ) -> Result<(), ArchiveError> {
        let mut url = self.scan_url(scan, &["resources", label, "files"])?;
        url.query_pairs_mut().append_pair("format", "zip");

        let response = self.request(Method::GET, url).send().await?;
        let mut response =
            Self::check(response, &format!("resource {} of scan {}", label, scan)).await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        tracing::debug!(scan = %scan, resource = label, size_bytes = written, "Downloaded resource");
        Ok(())
    }

    async fn container_status(&self, scan: &ScanRef) -> Result<ContainerStatus, ArchiveError> {
        if let Some(container) = self.latest_container(scan).await? {
            return Ok(map_container_status(&container.status));
        }
        // no container record; the images may have been produced by other means
        if self.resource_exists(scan, DICOM_RESOURCE).await? {
            Ok(ContainerStatus::Completed)
        } else {
            Ok(ContainerStatus::Unknown)
        }
    }

    async fn share_subject(
        &self,
        project: &str,
        subject: &str,
        destination: &str,
    ) -> Result<(), ArchiveError> {
        let mut url = self.data_url(&[
            "projects",
            project,
            "subjects",
            subject,
            "projects",
            destination,
        ])?;
        url.query_pairs_mut().append_pair("primary", "true");
        self.send(Method::PUT, url, &format!("subject {} in {}", subject, destination))
            .await
    }

    async fn share_experiment(
        &self,
        project: &str,
        subject: &str,
        experiment: &str,
        destination: &str,
    ) -> Result<(), ArchiveError> {
        let mut url = self.data_url(&[
            "projects",
            project,
            "subjects",
            subject,
            "experiments",
            experiment,
            "projects",
            destination,
        ])?;
        url.query_pairs_mut().append_pair("primary", "true");
        self.send(
            Method::PUT,
            url,
            &format!("experiment {} in {}", experiment, destination),
        )
        .await
    }

    async fn delete_scan(&self, scan: &ScanRef) -> Result<(), ArchiveError> {
        let mut url = self.scan_url(scan, &[])?;
        url.query_pairs_mut().append_pair("removeFiles", "true");
        self.send(Method::DELETE, url, &format!("scan {}", scan)).await
    }

    async fn delete_subject(&self, project: &str, subject: &str) -> Result<(), ArchiveError> {
        let mut url = self.data_url(&["projects", project, "subjects", subject])?;
        url.query_pairs_mut().append_pair("removeFiles", "true");
        self.send(Method::DELETE, url, &format!("subject {}", subject))
            .await
    }
}
