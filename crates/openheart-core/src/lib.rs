//! OpenHeart Core Library
//!
//! Domain models, error taxonomy and configuration shared by every OpenHeart crate.

pub mod config;
pub mod constants;
pub mod error;
pub mod models;

pub use config::{ArchiveConfig, Config, ConverterConfig, SmtpConfig};
pub use error::{AppError, AppResult, ErrorMetadata, LogLevel};
pub use models::{
    create_subject_file_lookup, group_by_subject_unique, ContainerStatus, FileFormat, FileRecord,
    LifecycleState, NewFileRecord, RemoteScanIds, ScanType, SubjectLookup, User,
};
