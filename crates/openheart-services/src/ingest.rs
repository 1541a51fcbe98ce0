//! Ingestion pipeline: unpack an uploaded archive into File Records, convert proprietary
//! raw files and give every standard raw file its content-addressed name.

use crate::cleanup::remove_file_if_exists;
use chrono::Utc;
use openheart_core::constants::{ACCEPTED_EXTENSIONS, BATCH_STAMP_FORMAT};
use openheart_core::{AppError, AppResult, FileFormat, FileRecord, NewFileRecord, ScanType};
use openheart_db::FileRepository;
use openheart_processing::{canonicalize, output_path_for, FormatConverter, Identity};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// One accepted archive entry after extraction.
#[derive(Debug, Clone)]
struct ExtractedEntry {
    path: PathBuf,
    original_name: String,
    subject: String,
}

#[derive(Debug, Default)]
struct Extraction {
    entries: Vec<ExtractedEntry>,
    skipped: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    /// Timestamp shared by every subject-unique label of this batch.
    pub batch: String,
    /// Records that survived conversion and deduplication.
    pub records: Vec<FileRecord>,
    /// Original names of entries dropped as content duplicates.
    pub duplicates: Vec<String>,
    /// Archive entries ignored because of their extension.
    pub skipped: Vec<String>,
}

fn accepted_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            ACCEPTED_EXTENSIONS
                .iter()
                .any(|accepted| e.eq_ignore_ascii_case(accepted))
        })
        .unwrap_or(false)
}

fn zip_error(e: zip::result::ZipError) -> AppError {
    AppError::InvalidInput(format!("Invalid zip archive: {}", e))
}

/// Extract every entry of `archive` into `dest`, keeping relative paths. Used for the
/// derived-image zips downloaded from the archive.
pub(crate) fn extract_all(archive: &Path, dest: &Path) -> AppResult<usize> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(zip_error)?;
    let mut count = 0;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(zip_error)?;
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(AppError::PreconditionFailed(format!(
                "Archive entry {} escapes the extraction directory",
                entry.name()
            )));
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        count += 1;
    }
    Ok(count)
}

/// Extract the accepted entries of an uploaded archive flat into `dest`.
///
/// Each entry is named `{user}_{batch}_{index}_{subject}_{basename}` so neither concurrent
/// extractions nor same-named entries under different folders collide. The subject is the
/// entry's enclosing directory; entries at the top level take the archive's own stem.
/// Nothing extracted is left behind when the archive turns out to be unusable.
fn extract_upload(archive: &Path, dest: &Path, user_id: Uuid, batch: &str) -> AppResult<Extraction> {
    let mut extraction = Extraction::default();
    match extract_entries(archive, dest, user_id, batch, &mut extraction) {
        Ok(()) => Ok(extraction),
        Err(e) => {
            for entry in &extraction.entries {
                match std::fs::remove_file(&entry.path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(err) => {
                        tracing::warn!(error = %err, path = %entry.path.display(), "Failed to remove extracted entry")
                    }
                }
            }
            Err(e)
        }
    }
}

fn extract_entries(
    archive: &Path,
    dest: &Path,
    user_id: Uuid,
    batch: &str,
    extraction: &mut Extraction,
) -> AppResult<()> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(zip_error)?;
    let fallback_subject = archive
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("subject")
        .to_string();

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(zip_error)?;
        if entry.is_dir() {
            continue;
        }
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            return Err(AppError::PreconditionFailed(format!(
                "Archive entry {} escapes the extraction directory",
                entry.name()
            )));
        };
        let hidden = relative.components().any(|c| {
            c.as_os_str()
                .to_str()
                .map(|s| s.starts_with('.') || s == "__MACOSX")
                .unwrap_or(true)
        });
        if hidden || !accepted_extension(&relative) {
            extraction.skipped.push(entry.name().to_string());
            continue;
        }

        let original_name = relative
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let subject = relative
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or(&fallback_subject)
            .to_string();

        let target = dest.join(format!(
            "{}_{}_{:04}_{}_{}",
            user_id, batch, i, subject, original_name
        ));
        let mut out = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)?;
        extraction.entries.push(ExtractedEntry {
            path: target,
            original_name,
            subject,
        });
        io::copy(&mut entry, &mut out)?;
    }
    Ok(())
}

#[derive(Clone)]
pub struct IngestionPipeline {
    files: FileRepository,
    converter: Arc<dyn FormatConverter>,
    data_path: PathBuf,
}

impl IngestionPipeline {
    pub fn new(files: FileRepository, converter: Arc<dyn FormatConverter>, data_path: PathBuf) -> Self {
        Self {
            files,
            converter,
            data_path,
        }
    }

    pub fn user_dir(&self, user_id: Uuid) -> PathBuf {
        self.data_path.join(user_id.to_string())
    }

    /// Ingest `archive` for `user_id`. The archive is removed afterwards, whatever the
    /// outcome.
    #[tracing::instrument(skip(self, archive), fields(user_id = %user_id, archive = %archive.display()))]
    pub async fn ingest(&self, user_id: Uuid, archive: &Path) -> AppResult<IngestionReport> {
        let batch = Utc::now().format(BATCH_STAMP_FORMAT).to_string();
        let dest = self.user_dir(user_id);
        tokio::fs::create_dir_all(&dest).await?;

        let extraction = {
            let archive = archive.to_path_buf();
            let dest = dest.clone();
            let batch = batch.clone();
            tokio::task::spawn_blocking(move || extract_upload(&archive, &dest, user_id, &batch))
                .await
                .map_err(|e| AppError::Internal(format!("Extraction task failed: {}", e)))?
        };
        if let Err(e) = remove_file_if_exists(archive).await {
            tracing::warn!(error = %e, "Failed to remove uploaded archive");
        }
        let extraction = extraction?;

        tracing::info!(
            accepted = extraction.entries.len(),
            skipped = extraction.skipped.len(),
            batch = %batch,
            "Archive extracted"
        );

        let (records, duplicates) = match self.record_batch(user_id, &batch, &extraction.entries).await {
            Ok(result) => result,
            Err(e) => {
                self.discard_batch(user_id, &batch, &extraction.entries).await;
                return Err(e);
            }
        };

        Ok(IngestionReport {
            batch,
            records,
            duplicates,
            skipped: extraction.skipped,
        })
    }

    /// Create, convert and identify the records of one batch.
    async fn record_batch(
        &self,
        user_id: Uuid,
        batch: &str,
        entries: &[ExtractedEntry],
    ) -> AppResult<(Vec<FileRecord>, Vec<String>)> {
        let mut created = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(format) = FileFormat::from_path(&entry.path) else {
                continue;
            };
            let record = self
                .files
                .create(&NewFileRecord {
                    user_id,
                    path: entry.path.to_string_lossy().to_string(),
                    original_name: entry.original_name.clone(),
                    subject: entry.subject.clone(),
                    subject_unique: format!("{}_{}", entry.subject, batch),
                    format,
                    scan_type: ScanType::infer_from_filename(&entry.original_name),
                })
                .await?;
            created.push(record);
        }

        let converted = self.convert_all(user_id, created).await?;
        self.identify_all(user_id, converted).await
    }

    /// Remove every record of a failed batch and every file it produced.
    async fn discard_batch(&self, user_id: Uuid, batch: &str, entries: &[ExtractedEntry]) {
        let suffix = format!("_{}", batch);
        match self.files.list_pending(user_id).await {
            Ok(records) => {
                for record in records.iter().filter(|r| r.subject_unique.ends_with(&suffix)) {
                    if let Err(e) = self.files.delete(user_id, record.id).await {
                        tracing::warn!(error = %e, record_id = %record.id, "Failed to delete record of failed batch");
                    }
                    let paths = std::iter::once(record.path.as_str()).chain(record.unique_path.as_deref());
                    for path in paths {
                        if let Err(e) = remove_file_if_exists(Path::new(path)).await {
                            tracing::warn!(error = %e, path = %path, "Failed to remove file of failed batch");
                        }
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, batch = %batch, "Failed to list records of failed batch"),
        }

        for entry in entries {
            let mut paths = vec![entry.path.clone()];
            if FileFormat::from_path(&entry.path) == Some(FileFormat::ProprietaryRaw) {
                paths.push(output_path_for(&entry.path));
            }
            for path in paths {
                if let Err(e) = remove_file_if_exists(&path).await {
                    tracing::warn!(error = %e, path = %path.display(), "Failed to remove file of failed batch");
                }
            }
        }
        tracing::info!(batch = %batch, "Discarded failed batch");
    }

    /// Convert every proprietary-format record. A converted record is replaced by a
    /// standard-format record for the output file. Fails, naming every failed file, if
    /// any conversion failed.
    async fn convert_all(&self, user_id: Uuid, records: Vec<FileRecord>) -> AppResult<Vec<FileRecord>> {
        let mut out = Vec::with_capacity(records.len());
        let mut failed: Vec<(String, String)> = Vec::new();

        for record in records {
            if record.format != FileFormat::ProprietaryRaw {
                out.push(record);
                continue;
            }
            match self.converter.convert(Path::new(&record.path)).await {
                Ok(output) => {
                    let converted = self
                        .files
                        .create(&NewFileRecord {
                            user_id,
                            path: output.to_string_lossy().to_string(),
                            original_name: record.original_name.clone(),
                            subject: record.subject.clone(),
                            subject_unique: record.subject_unique.clone(),
                            format: FileFormat::StandardRaw,
                            scan_type: record.scan_type,
                        })
                        .await?;
                    self.files.delete(user_id, record.id).await?;
                    if let Err(e) = remove_file_if_exists(Path::new(&record.path)).await {
                        tracing::warn!(error = %e, path = %record.path, "Failed to remove converted input");
                    }
                    out.push(converted);
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        file = %record.original_name,
                        precondition = e.is_precondition(),
                        "Raw-format conversion failed"
                    );
                    failed.push((record.original_name.clone(), e.to_string()));
                }
            }
        }

        match failed.len() {
            0 => Ok(out),
            1 => {
                let (file, message) = failed.remove(0);
                Err(AppError::Conversion { file, message })
            }
            _ => Err(AppError::BatchFailed {
                operation: "conversion".to_string(),
                failed: failed.into_iter().map(|(file, _)| file).collect(),
            }),
        }
    }

    /// Give every standard-format record its content-addressed path. Records whose
    /// content is already present are dropped with their file.
    async fn identify_all(
        &self,
        user_id: Uuid,
        records: Vec<FileRecord>,
    ) -> AppResult<(Vec<FileRecord>, Vec<String>)> {
        let mut kept = Vec::with_capacity(records.len());
        let mut duplicates = Vec::new();

        for mut record in records {
            if record.format != FileFormat::StandardRaw || record.unique_path.is_some() {
                kept.push(record);
                continue;
            }
            let identity = canonicalize(Path::new(&record.path))
                .await
                .map_err(|e| AppError::Io(io::Error::other(e.to_string())))?;

            match identity {
                Identity::Duplicate { duplicate, .. } => {
                    tracing::warn!(
                        file = %record.original_name,
                        subject = %record.subject,
                        "Dropping content duplicate"
                    );
                    self.files.delete(user_id, record.id).await?;
                    remove_file_if_exists(&duplicate).await?;
                    duplicates.push(record.original_name);
                }
                Identity::Renamed { canonical, .. } | Identity::AlreadyCanonical { canonical, .. } => {
                    let canonical = canonical.to_string_lossy().to_string();
                    if self
                        .files
                        .set_unique_path(user_id, record.id, &canonical)
                        .await?
                    {
                        record.unique_path = Some(canonical);
                    }
                    kept.push(record);
                }
            }
        }
        Ok((kept, duplicates))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{zip_bytes, FakeConverter};
    use openheart_db::{connect_in_memory, UserRepository};

    async fn setup(converter: FakeConverter) -> (IngestionPipeline, FileRepository, Uuid, tempfile::TempDir) {
        let pool = connect_in_memory().await.unwrap();
        let (user, _) = UserRepository::new(pool.clone())
            .get_or_create("ingest@example.com")
            .await
            .unwrap();
        let files = FileRepository::new(pool);
        let dir = tempfile::tempdir().unwrap();
        let pipeline =
            IngestionPipeline::new(files.clone(), Arc::new(converter), dir.path().join("data"));
        (pipeline, files, user.id, dir)
    }

    async fn write_zip(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, zip_bytes(entries)).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_ingest_filters_and_groups() {
        let (pipeline, files, user_id, dir) = setup(FakeConverter::default()).await;
        let archive = write_zip(
            dir.path(),
            "upload.zip",
            &[
                ("SubjA/scan1_cine.h5", b"cine"),
                ("SubjA/notes.txt", b"ignore me"),
                ("SubjB/scan2_lge.h5", b"lge"),
                ("__MACOSX/SubjA/._scan1_cine.h5", b"fork"),
            ],
        )
        .await;

        let report = pipeline.ingest(user_id, &archive).await.unwrap();
        assert!(!archive.exists());
        assert_eq!(report.records.len(), 2);
        assert_eq!(report.skipped.len(), 2);
        assert!(report.duplicates.is_empty());

        let stored = files.list_pending(user_id).await.unwrap();
        assert_eq!(stored.len(), 2);
        let a = stored.iter().find(|r| r.subject == "SubjA").unwrap();
        assert_eq!(a.format, FileFormat::StandardRaw);
        assert_eq!(a.scan_type, ScanType::Cine);
        assert_eq!(a.subject_unique, format!("SubjA_{}", report.batch));
        assert!(!a.transmitted);
        let unique = a.unique_path.as_deref().unwrap();
        assert!(Path::new(unique).exists());
        assert_eq!(a.content_digest().unwrap().len(), 64);

        // both subjects share the batch stamp
        let b = stored.iter().find(|r| r.subject == "SubjB").unwrap();
        assert!(b.subject_unique.ends_with(&report.batch));
    }

    #[tokio::test]
    async fn test_top_level_entry_takes_archive_stem() {
        let (pipeline, files, user_id, dir) = setup(FakeConverter::default()).await;
        let archive = write_zip(dir.path(), "Volunteer7.zip", &[("scan.h5", b"data")]).await;

        pipeline.ingest(user_id, &archive).await.unwrap();
        let stored = files.list_pending(user_id).await.unwrap();
        assert_eq!(stored[0].subject, "Volunteer7");
    }

    #[tokio::test]
    async fn test_proprietary_files_are_converted() {
        let (pipeline, files, user_id, dir) = setup(FakeConverter::default()).await;
        let archive = write_zip(dir.path(), "u.zip", &[("SubjA/meas_t1.dat", b"siemens")]).await;

        let report = pipeline.ingest(user_id, &archive).await.unwrap();
        assert_eq!(report.records.len(), 1);
        let stored = files.list_pending(user_id).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].format, FileFormat::StandardRaw);
        assert_eq!(stored[0].original_name, "meas_t1.dat");
        assert_eq!(stored[0].scan_type, ScanType::T1Map);
        assert!(stored[0].unique_path.as_deref().unwrap().ends_with(".h5"));
        // the proprietary input is gone
        assert!(!Path::new(&stored[0].path).with_extension("dat").exists());
    }

    #[tokio::test]
    async fn test_conversion_failure_names_the_file() {
        let (pipeline, _files, user_id, dir) = setup(FakeConverter::failing_on("broken")).await;
        let archive = write_zip(
            dir.path(),
            "u.zip",
            &[("SubjA/good.dat", b"ok"), ("SubjA/broken.dat", b"bad")],
        )
        .await;

        match pipeline.ingest(user_id, &archive).await.unwrap_err() {
            AppError::Conversion { file, .. } => assert_eq!(file, "broken.dat"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_failed_conversion_discards_whole_batch() {
        let (pipeline, files, user_id, dir) = setup(FakeConverter::failing_on("broken")).await;
        let archive = write_zip(
            dir.path(),
            "u.zip",
            &[
                ("SubjA/good.h5", b"standard"),
                ("SubjA/fine.dat", b"converts"),
                ("SubjA/broken.dat", b"bad"),
            ],
        )
        .await;

        assert!(pipeline.ingest(user_id, &archive).await.is_err());
        assert!(files.list_pending(user_id).await.unwrap().is_empty());
        let left: Vec<_> = std::fs::read_dir(pipeline.user_dir(user_id)).unwrap().collect();
        assert!(left.is_empty(), "files left behind: {left:?}");

        // the same content ingests cleanly once the bad entry is gone
        let archive = write_zip(dir.path(), "u.zip", &[("SubjA/good.h5", b"standard")]).await;
        let report = pipeline.ingest(user_id, &archive).await.unwrap();
        assert_eq!(report.records.len(), 1);
        assert!(report.records[0].unique_path.is_some());
    }

    #[tokio::test]
    async fn test_same_names_under_different_folders() {
        let (pipeline, files, user_id, dir) = setup(FakeConverter::default()).await;
        let archive = write_zip(
            dir.path(),
            "u.zip",
            &[("Site1/Subj01/scan.h5", b"site one"), ("Site2/Subj01/scan.h5", b"site two")],
        )
        .await;

        let report = pipeline.ingest(user_id, &archive).await.unwrap();
        assert_eq!(report.records.len(), 2);
        let stored = files.list_pending(user_id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.subject == "Subj01" && r.original_name == "scan.h5"));
        assert!(stored
            .iter()
            .all(|r| Path::new(r.unique_path.as_deref().unwrap()).exists()));
    }

    #[tokio::test]
    async fn test_unsafe_entry_leaves_nothing_extracted() {
        let (pipeline, files, user_id, dir) = setup(FakeConverter::default()).await;
        let archive = write_zip(
            dir.path(),
            "u.zip",
            &[("SubjA/a.h5", b"fine"), ("../escape.h5", b"evil")],
        )
        .await;

        let err = pipeline.ingest(user_id, &archive).await.unwrap_err();
        assert!(matches!(err, AppError::PreconditionFailed(_)));
        assert!(files.list_pending(user_id).await.unwrap().is_empty());
        let left: Vec<_> = std::fs::read_dir(pipeline.user_dir(user_id)).unwrap().collect();
        assert!(left.is_empty(), "files left behind: {left:?}");
    }

    #[tokio::test]
    async fn test_identical_entries_in_one_batch() {
        let (pipeline, files, user_id, dir) = setup(FakeConverter::default()).await;
        let archive = write_zip(
            dir.path(),
            "u.zip",
            &[("SubjA/a.h5", b"same"), ("SubjB/b.h5", b"same")],
        )
        .await;

        let report = pipeline.ingest(user_id, &archive).await.unwrap();
        assert_eq!(report.records.len(), 1);
        assert_eq!(report.duplicates, vec!["b.h5".to_string()]);
        assert_eq!(files.list_pending(user_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_archive() {
        let (pipeline, _files, user_id, dir) = setup(FakeConverter::default()).await;
        let archive = dir.path().join("not-a-zip.zip");
        tokio::fs::write(&archive, b"plain text").await.unwrap();

        let err = pipeline.ingest(user_id, &archive).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
        assert!(!archive.exists());
    }

    #[test]
    fn test_extract_all_keeps_layout() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("dicom.zip");
        std::fs::write(
            &archive,
            zip_bytes(&[("scan/resources/DICOM/files/1.dcm", b"x"), ("2.dcm", b"y")]),
        )
        .unwrap();

        let out = dir.path().join("out");
        assert_eq!(extract_all(&archive, &out).unwrap(), 2);
        assert!(out.join("scan/resources/DICOM/files/1.dcm").exists());
        assert!(out.join("2.dcm").exists());
    }
}
