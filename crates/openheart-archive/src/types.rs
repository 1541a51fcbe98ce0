use std::collections::BTreeMap;
use std::fmt;

/// Scan metadata fields keyed by their full archive field path.
pub type ScanFields = BTreeMap<String, String>;

/// Fully qualified address of one scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScanRef {
    pub project: String,
    pub subject: String,
    pub experiment: String,
    pub scan: String,
}

impl ScanRef {
    pub fn new(
        project: impl Into<String>,
        subject: impl Into<String>,
        experiment: impl Into<String>,
        scan: impl Into<String>,
    ) -> Self {
        Self {
            project: project.into(),
            subject: subject.into(),
            experiment: experiment.into(),
            scan: scan.into(),
        }
    }

    pub(crate) fn segments(&self) -> [&str; 8] {
        [
            "projects",
            &self.project,
            "subjects",
            &self.subject,
            "experiments",
            &self.experiment,
            "scans",
            &self.scan,
        ]
    }
}

impl fmt::Display for ScanRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.project, self.subject, self.experiment, self.scan
        )
    }
}

/// A resource to attach files to, with its format/content descriptors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub label: String,
    pub format: Option<String>,
    pub content: Option<String>,
}

impl ResourceSpec {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            format: None,
            content: None,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}
