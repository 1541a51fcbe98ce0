//! OpenHeart remote archive access
//!
//! [`ArchiveClient`] models the archive's resource hierarchy (project, subject,
//! experiment, scan, resource). [`XnatClient`] talks to a real server over REST;
//! `InMemoryArchive` (feature `test-util`) backs tests.

pub mod client;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod types;
pub mod xnat;

pub use client::ArchiveClient;
pub use error::ArchiveError;
#[cfg(any(test, feature = "test-util"))]
pub use memory::InMemoryArchive;
pub use types::{ResourceSpec, ScanFields, ScanRef};
pub use xnat::{map_container_status, XnatClient};
