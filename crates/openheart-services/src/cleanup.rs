//! Working-set cleanup: removes a user's non-submitted records and everything they left
//! on disk.

use openheart_core::{AppResult, FileRecord};
use openheart_db::FileRepository;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Remove a file, treating an already-missing file as removed.
pub(crate) async fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

pub(crate) async fn remove_dir_if_exists(path: &Path) -> io::Result<bool> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Directory holding the preview artifacts of one record.
pub fn preview_dir(preview_root: &Path, user_id: Uuid, record_id: Uuid) -> PathBuf {
    preview_root
        .join(user_id.to_string())
        .join(record_id.to_string())
}

/// Delete the on-disk traces of a record: original path, canonical path and previews.
/// Best-effort; failures are logged.
pub(crate) async fn remove_record_files(record: &FileRecord, preview_root: &Path) {
    let paths = std::iter::once(record.path.as_str()).chain(record.unique_path.as_deref());
    for path in paths {
        if let Err(e) = remove_file_if_exists(Path::new(path)).await {
            tracing::warn!(error = %e, path = %path, record_id = %record.id, "Failed to remove file");
        }
    }
    let previews = preview_dir(preview_root, record.user_id, record.id);
    if let Err(e) = remove_dir_if_exists(&previews).await {
        tracing::warn!(error = %e, path = %previews.display(), "Failed to remove previews");
    }
}

#[derive(Clone)]
pub struct WorkingSetCleanup {
    files: FileRepository,
    preview_path: PathBuf,
    temp_path: PathBuf,
}

impl WorkingSetCleanup {
    pub fn new(files: FileRepository, preview_path: PathBuf, temp_path: PathBuf) -> Self {
        Self {
            files,
            preview_path,
            temp_path,
        }
    }

    /// Delete every non-submitted record of the user together with its files. Returns the
    /// number of records removed.
    #[tracing::instrument(skip(self), fields(cleanup.operation = "purge_user_files"))]
    pub async fn purge_user_files(&self, user_id: Uuid) -> AppResult<usize> {
        let removed = self.files.delete_unsubmitted(user_id).await?;
        for record in &removed {
            remove_record_files(record, &self.preview_path).await;
        }

        let scratch = self.temp_path.join(user_id.to_string());
        if let Err(e) = remove_dir_if_exists(&scratch).await {
            tracing::warn!(error = %e, path = %scratch.display(), "Failed to remove scratch directory");
        }

        if !removed.is_empty() {
            tracing::info!(user_id = %user_id, count = removed.len(), "Purged working set");
        }
        Ok(removed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use openheart_core::{FileFormat, NewFileRecord, ScanType};
    use openheart_db::{connect_in_memory, UserRepository};

    #[tokio::test]
    async fn test_purge_removes_records_and_files() {
        let pool = connect_in_memory().await.unwrap();
        let (user, _) = UserRepository::new(pool.clone())
            .get_or_create("a@example.com")
            .await
            .unwrap();
        let files = FileRepository::new(pool);
        let dir = tempfile::tempdir().unwrap();

        let original = dir.path().join("scan1.h5");
        let canonical = dir.path().join("abcd.h5");
        tokio::fs::write(&canonical, b"data").await.unwrap();
        let record = files
            .create(&NewFileRecord {
                user_id: user.id,
                path: original.to_string_lossy().to_string(),
                original_name: "scan1.h5".into(),
                subject: "SubjA".into(),
                subject_unique: "SubjA_1".into(),
                format: FileFormat::StandardRaw,
                scan_type: ScanType::Unknown,
            })
            .await
            .unwrap();
        files
            .set_unique_path(user.id, record.id, &canonical.to_string_lossy())
            .await
            .unwrap();

        let previews = dir.path().join("previews");
        let record_previews = preview_dir(&previews, user.id, record.id);
        tokio::fs::create_dir_all(&record_previews).await.unwrap();
        tokio::fs::write(record_previews.join("thumbnail.gif"), b"gif")
            .await
            .unwrap();

        let cleanup = WorkingSetCleanup::new(files.clone(), previews, dir.path().join("tmp"));
        assert_eq!(cleanup.purge_user_files(user.id).await.unwrap(), 1);
        assert!(!canonical.exists());
        assert!(!record_previews.exists());
        assert!(files.list_pending(user.id).await.unwrap().is_empty());

        // nothing left, nothing to do
        assert_eq!(cleanup.purge_user_files(user.id).await.unwrap(), 0);
    }
}
