use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

/// On-disk format of the data item a record tracks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    /// Vendor raw data (`.dat`), must be converted before transmission.
    ProprietaryRaw,
    /// Standard raw data (`.h5`).
    StandardRaw,
    /// Reconstructed image (`.dcm`).
    DerivedImage,
}

impl FileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            FileFormat::ProprietaryRaw => "dat",
            FileFormat::StandardRaw => "h5",
            FileFormat::DerivedImage => "dcm",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "dat" => Some(FileFormat::ProprietaryRaw),
            "h5" => Some(FileFormat::StandardRaw),
            "dcm" => Some(FileFormat::DerivedImage),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

impl Display for FileFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.extension())
    }
}

impl FromStr for FileFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s.trim_start_matches('.'))
            .ok_or_else(|| anyhow::anyhow!("Invalid file format: {}", s))
    }
}

/// Cardiac MR scan classification, inferred from the file name at ingestion and
/// overridable by the user before transmission.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScanType {
    Cine,
    Lge,
    T1Map,
    T2Map,
    Flow,
    Unknown,
}

impl ScanType {
    /// Classify from the tokens of a file name, e.g. `sax_cine_01.h5` is a cine scan.
    pub fn infer_from_filename(name: &str) -> Self {
        let stem = Path::new(name)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name)
            .to_ascii_lowercase();
        let tokens: Vec<&str> = stem
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|t| !t.is_empty())
            .collect();
        let has = |candidates: &[&str]| tokens.iter().any(|t| candidates.contains(t));

        if has(&["cine", "bssfp"]) {
            ScanType::Cine
        } else if has(&["lge", "psir"]) {
            ScanType::Lge
        } else if has(&["t1", "t1map", "molli", "shmolli"]) {
            ScanType::T1Map
        } else if has(&["t2", "t2map"]) {
            ScanType::T2Map
        } else if has(&["flow", "pc"]) {
            ScanType::Flow
        } else {
            ScanType::Unknown
        }
    }
}

impl Display for ScanType {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ScanType::Cine => write!(f, "cine"),
            ScanType::Lge => write!(f, "lge"),
            ScanType::T1Map => write!(f, "t1_map"),
            ScanType::T2Map => write!(f, "t2_map"),
            ScanType::Flow => write!(f, "flow"),
            ScanType::Unknown => write!(f, "unknown"),
        }
    }
}

impl FromStr for ScanType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cine" => Ok(ScanType::Cine),
            "lge" => Ok(ScanType::Lge),
            "t1_map" => Ok(ScanType::T1Map),
            "t2_map" => Ok(ScanType::T2Map),
            "flow" => Ok(ScanType::Flow),
            "unknown" => Ok(ScanType::Unknown),
            _ => Err(anyhow::anyhow!("Invalid scan type: {}", s)),
        }
    }
}

/// Status of the remote reconstruction container attached to a scan.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContainerStatus {
    #[default]
    Unknown,
    Created,
    Running,
    Finishing,
    Completed,
    Failed,
}

impl ContainerStatus {
    /// Integer code persisted in the record store.
    pub fn code(&self) -> i64 {
        match self {
            ContainerStatus::Unknown => -1,
            ContainerStatus::Created => 0,
            ContainerStatus::Running => 1,
            ContainerStatus::Finishing => 2,
            ContainerStatus::Completed => 3,
            ContainerStatus::Failed => 4,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            0 => ContainerStatus::Created,
            1 => ContainerStatus::Running,
            2 => ContainerStatus::Finishing,
            3 => ContainerStatus::Completed,
            4 => ContainerStatus::Failed,
            _ => ContainerStatus::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerStatus::Completed | ContainerStatus::Failed)
    }
}

impl Display for ContainerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            ContainerStatus::Unknown => write!(f, "unknown"),
            ContainerStatus::Created => write!(f, "created"),
            ContainerStatus::Running => write!(f, "running"),
            ContainerStatus::Finishing => write!(f, "finishing"),
            ContainerStatus::Completed => write!(f, "completed"),
            ContainerStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for ContainerStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(ContainerStatus::Unknown),
            "created" => Ok(ContainerStatus::Created),
            "running" => Ok(ContainerStatus::Running),
            "finishing" => Ok(ContainerStatus::Finishing),
            "completed" => Ok(ContainerStatus::Completed),
            "failed" => Ok(ContainerStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid container status: {}", s)),
        }
    }
}

/// Identifiers of the remote scan a record was transmitted to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteScanIds {
    pub subject_id: String,
    pub experiment_id: String,
    pub scan_id: String,
    pub experiment_date: Option<NaiveDate>,
}

/// Where a record stands in the upload lifecycle, derived from its flags.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Created,
    Transmitted,
    Reconstructed,
    Submitted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Path the entry was extracted to.
    pub path: String,
    /// Content-addressed standard-format path, set once identity has run.
    pub unique_path: Option<String>,
    pub original_name: String,
    pub subject: String,
    pub subject_unique: String,
    pub format: FileFormat,
    pub scan_type: ScanType,
    pub remote: Option<RemoteScanIds>,
    pub transmitted: bool,
    pub reconstructed: bool,
    pub submitted: bool,
    pub container_status: ContainerStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn state(&self) -> LifecycleState {
        if self.submitted {
            LifecycleState::Submitted
        } else if self.reconstructed {
            LifecycleState::Reconstructed
        } else if self.transmitted {
            LifecycleState::Transmitted
        } else {
            LifecycleState::Created
        }
    }

    /// Transmitted, still waiting for derived images, and not given up on.
    pub fn awaiting_reconstruction(&self) -> bool {
        self.transmitted
            && !self.reconstructed
            && !self.submitted
            && self.container_status != ContainerStatus::Failed
    }

    /// Hex digest the canonical file name was derived from.
    pub fn content_digest(&self) -> Option<&str> {
        self.unique_path
            .as_deref()
            .and_then(|p| Path::new(p).file_stem())
            .and_then(|s| s.to_str())
    }

    pub fn display_name(&self) -> &str {
        &self.original_name
    }
}

/// Fields supplied by ingestion when a record is first created.
#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub user_id: Uuid,
    pub path: String,
    pub original_name: String,
    pub subject: String,
    pub subject_unique: String,
    pub format: FileFormat,
    pub scan_type: ScanType,
}
