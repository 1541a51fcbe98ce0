use super::*;
use crate::testing::{dicom_series_zip, raw_file_with_header, zip_bytes, FakeConverter};
use openheart_archive::{InMemoryArchive, ScanRef};
use openheart_core::FileFormat;
use openheart_db::connect_in_memory;
use openheart_processing::PreviewOptions;

struct Harness {
    lifecycle: UploadLifecycle,
    files: FileRepository,
    users: UserRepository,
    archive: Arc<InMemoryArchive>,
    user_id: Uuid,
    _dir: tempfile::TempDir,
}

async fn harness() -> Harness {
    harness_with(FakeConverter::default()).await
}

async fn harness_with(converter: FakeConverter) -> Harness {
    let pool = connect_in_memory().await.unwrap();
    let users = UserRepository::new(pool.clone());
    let files = FileRepository::new(pool);
    let (user, _) = users.get_or_create("researcher@example.com").await.unwrap();
    let archive = Arc::new(InMemoryArchive::with_projects(&["vault", "open"]));
    let dir = tempfile::tempdir().unwrap();

    let sync_config = SyncConfig {
        vault_project: "vault".into(),
        open_project: "open".into(),
        temp_path: dir.path().join("tmp"),
        preview_path: dir.path().join("previews"),
        preview: PreviewOptions::default(),
    };
    let config = LifecycleConfig {
        data_path: dir.path().join("data"),
        preview_path: dir.path().join("previews"),
        poll_interval: Duration::from_millis(10),
        default_timeout: Duration::from_secs(1),
        max_timeout: Duration::from_millis(200),
    };
    let lifecycle = UploadLifecycle::new(
        users.clone(),
        files.clone(),
        Arc::new(converter),
        archive.clone(),
        sync_config,
        config,
    );
    Harness {
        lifecycle,
        files,
        users,
        archive,
        user_id: user.id,
        _dir: dir,
    }
}

impl Harness {
    async fn upload(&self, entries: &[(&str, &[u8])]) {
        let path = self.lifecycle.staging_path(self.user_id).await.unwrap();
        tokio::fs::write(&path, zip_bytes(entries)).await.unwrap();
        self.lifecycle.stage_archive(self.user_id, &path).await.unwrap();
    }

    async fn pending(&self) -> Vec<FileRecord> {
        self.files.list_pending(self.user_id).await.unwrap()
    }

    fn scan_of(record: &FileRecord) -> ScanRef {
        let ids = record.remote.as_ref().unwrap();
        ScanRef::new("vault", &ids.subject_id, &ids.experiment_id, &ids.scan_id)
    }

    async fn complete_all(&self) {
        for record in self.pending().await {
            self.archive
                .complete_reconstruction(&Self::scan_of(&record), dicom_series_zip(2, 2));
        }
    }
}

#[tokio::test]
async fn test_happy_path() {
    let h = harness().await;
    let scan1 = raw_file_with_header("scan1");
    h.upload(&[("SubjA/scan1.h5", &scan1)]).await;

    let summary = h.lifecycle.check(h.user_id).await.unwrap();
    assert_eq!(summary.file_count, 1);
    assert_eq!(summary.subjects.len(), 1);
    assert_eq!(summary.subjects[0].subject, "SubjA");
    assert_eq!(summary.subjects[0].files, vec!["scan1.h5".to_string()]);

    let records = h.pending().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].subject, "SubjA");
    assert_eq!(records[0].format, FileFormat::StandardRaw);
    assert!(!records[0].transmitted);

    h.lifecycle.transmit(h.user_id).await.unwrap();
    let record = h.pending().await.remove(0);
    assert!(record.transmitted);
    let ids = record.remote.clone().unwrap();
    assert!(!ids.subject_id.is_empty());
    assert!(!ids.experiment_id.is_empty());
    assert!(!ids.scan_id.is_empty());

    h.complete_all().await;
    let status = h.lifecycle.status(h.user_id, None).await.unwrap();
    assert!(!status.timed_out);
    assert_eq!(status.pending, 0);
    assert_eq!(status.reconstructed, 1);
    assert_eq!(status.completed, 1);
    let previews = status.records[0].previews.clone().unwrap();
    assert!(previews.animation.exists());
    assert!(previews.thumbnail.exists());

    let review = h.lifecycle.review(h.user_id).await.unwrap();
    assert_eq!(review.len(), 1);
    assert_eq!(review[0].subject, "SubjA");
    assert_eq!(review[0].records[0].state, LifecycleState::Reconstructed);

    let accepted = vec![review[0].subject_unique.clone()];
    let report = h.lifecycle.submit(h.user_id, &accepted).await.unwrap();
    assert_eq!(report.submitted, 1);

    let submitted = h.files.list_submitted(h.user_id).await.unwrap();
    assert_eq!(submitted.len(), 1);
    assert!(submitted[0].submitted && submitted[0].reconstructed && submitted[0].transmitted);
    assert!(h.pending().await.is_empty());
    assert!(h.archive.has_subject("open", &ids.subject_id));
}

#[tokio::test]
async fn test_duplicate_upload() {
    let h = harness().await;
    let a = raw_file_with_header("a");
    let b = raw_file_with_header("b");
    let entries: &[(&str, &[u8])] = &[("SubjA/a.h5", &a), ("SubjA/b.h5", &b)];

    h.upload(entries).await;
    let first = h.lifecycle.check(h.user_id).await.unwrap();
    assert_eq!(first.file_count, 2);
    let before: Vec<Uuid> = h.pending().await.iter().map(|r| r.id).collect();

    h.upload(entries).await;
    let second = h.lifecycle.check(h.user_id).await.unwrap();
    assert_eq!(second.file_count, 0);
    assert_eq!(second.duplicates.len(), 2);

    let after: Vec<Uuid> = h.pending().await.iter().map(|r| r.id).collect();
    assert_eq!(before, after);
}

#[tokio::test]
async fn test_rejection() {
    let h = harness().await;
    let a = raw_file_with_header("a");
    let b = raw_file_with_header("b");
    h.upload(&[("SubjA/a.h5", &a), ("SubjB/b.h5", &b)]).await;
    h.lifecycle.check(h.user_id).await.unwrap();
    h.lifecycle.transmit(h.user_id).await.unwrap();
    h.complete_all().await;
    h.lifecycle.status(h.user_id, None).await.unwrap();

    let rejected = h
        .pending()
        .await
        .into_iter()
        .find(|r| r.subject == "SubjB")
        .unwrap();
    let rejected_scan = Harness::scan_of(&rejected);
    let review = h.lifecycle.review(h.user_id).await.unwrap();
    let accepted: Vec<String> = review
        .iter()
        .filter(|s| s.subject == "SubjA")
        .map(|s| s.subject_unique.clone())
        .collect();

    h.lifecycle.submit(h.user_id, &accepted).await.unwrap();

    assert!(h.archive.scan(&rejected_scan).is_none());
    let remaining = h
        .files
        .list(h.user_id, &openheart_db::FileFilter::default())
        .await
        .unwrap();
    assert!(remaining.iter().all(|r| r.subject != "SubjB"));
    assert_eq!(remaining.len(), 1);
}

#[tokio::test]
async fn test_status_times_out_with_pending_records() {
    let h = harness().await;
    let a = raw_file_with_header("a");
    h.upload(&[("SubjA/a.h5", &a)]).await;
    h.lifecycle.check(h.user_id).await.unwrap();
    h.lifecycle.transmit(h.user_id).await.unwrap();

    let status = h
        .lifecycle
        .status(h.user_id, Some(Duration::from_millis(50)))
        .await
        .unwrap();
    assert!(status.timed_out);
    assert_eq!(status.pending, 1);
    assert_eq!(status.reconstructed, 0);
    assert!(status.records[0].previews.is_none());
}

#[tokio::test]
async fn test_status_clamps_oversized_timeout() {
    let h = harness().await;
    let a = raw_file_with_header("a");
    h.upload(&[("SubjA/a.h5", &a)]).await;
    h.lifecycle.check(h.user_id).await.unwrap();
    h.lifecycle.transmit(h.user_id).await.unwrap();

    let status = tokio::time::timeout(
        Duration::from_secs(5),
        h.lifecycle
            .status(h.user_id, Some(Duration::from_secs(u64::MAX))),
    )
    .await
    .expect("status loop must stop at the configured maximum")
    .unwrap();
    assert!(status.timed_out);
    assert_eq!(status.pending, 1);
}

#[tokio::test]
async fn test_transmit_after_failed_check() {
    let h = harness_with(FakeConverter::failing_on("broken")).await;
    let good = raw_file_with_header("good");
    h.upload(&[("SubjA/good.h5", &good), ("SubjA/broken.dat", b"garbage")]).await;

    let err = h.lifecycle.check(h.user_id).await.unwrap_err();
    assert!(matches!(err, AppError::Conversion { .. }));
    assert!(h.pending().await.is_empty());

    let report = h.lifecycle.transmit(h.user_id).await.unwrap();
    assert!(report.transmitted.is_empty());

    h.upload(&[("SubjA/good.h5", &good)]).await;
    h.lifecycle.check(h.user_id).await.unwrap();
    let report = h.lifecycle.transmit(h.user_id).await.unwrap();
    assert_eq!(report.transmitted.len(), 1);
}

#[tokio::test]
async fn test_check_requires_staged_archive() {
    let h = harness().await;
    let err = h.lifecycle.check(h.user_id).await.unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));
}

#[tokio::test]
async fn test_restaging_discards_previous_archive() {
    let h = harness().await;
    h.upload(&[("SubjA/a.h5", b"first")]).await;
    let first = h
        .users
        .get_by_id(h.user_id)
        .await
        .unwrap()
        .unwrap()
        .upload_archive_path
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;
    h.upload(&[("SubjB/b.h5", b"second")]).await;
    assert!(!Path::new(&first).exists());

    let summary = h.lifecycle.check(h.user_id).await.unwrap();
    assert_eq!(summary.subjects[0].subject, "SubjB");
}

#[tokio::test]
async fn test_scan_type_override_before_transmission_only() {
    let h = harness().await;
    let a = raw_file_with_header("a");
    h.upload(&[("SubjA/a.h5", &a)]).await;
    h.lifecycle.check(h.user_id).await.unwrap();
    let record = h.pending().await.remove(0);

    let updated = h
        .lifecycle
        .set_scan_type(h.user_id, record.id, ScanType::Lge)
        .await
        .unwrap();
    assert_eq!(updated.scan_type, ScanType::Lge);

    h.lifecycle.transmit(h.user_id).await.unwrap();
    let err = h
        .lifecycle
        .set_scan_type(h.user_id, record.id, ScanType::Cine)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::PreconditionFailed(_)));

    let err = h
        .lifecycle
        .set_scan_type(h.user_id, Uuid::new_v4(), ScanType::Cine)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_logout_removes_user_and_working_set() {
    let h = harness().await;
    let a = raw_file_with_header("a");
    h.upload(&[("SubjA/a.h5", &a)]).await;
    h.lifecycle.check(h.user_id).await.unwrap();
    let canonical = h.pending().await[0].unique_path.clone().unwrap();

    h.lifecycle.logout(h.user_id).await.unwrap();
    assert!(!Path::new(&canonical).exists());
    assert!(h.users.get_by_id(h.user_id).await.unwrap().is_none());
}
