pub mod file_record;
pub mod subject;
pub mod user;

pub use file_record::{
    ContainerStatus, FileFormat, FileRecord, LifecycleState, NewFileRecord, RemoteScanIds,
    ScanType,
};
pub use subject::{create_subject_file_lookup, group_by_subject_unique, SubjectLookup};
pub use user::User;
