//! OpenHeart Services Layer
//!
//! Orchestration of the upload lifecycle: ingestion of uploaded archives, the
//! synchronization protocol with the remote archive, and working-set cleanup. The API
//! crate only talks to [`UploadLifecycle`]; it never drives the protocol steps itself.

pub mod cleanup;
pub mod ingest;
pub mod lifecycle;
pub mod sync;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use cleanup::WorkingSetCleanup;
pub use ingest::{IngestionPipeline, IngestionReport};
pub use lifecycle::{
    CheckSummary, LifecycleConfig, PreviewPaths, RecordView, StatusReport, SubjectReview,
    SubjectSummary, UploadLifecycle,
};
pub use sync::{
    experiment_id_for, scan_id_for, ArchiveSync, FinalizeReport, PollReport, SyncConfig,
    TransmitReport,
};
