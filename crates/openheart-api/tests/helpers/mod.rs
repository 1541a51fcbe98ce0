//! Test helpers: build the app over in-memory SQLite, the archive fake and a converter
//! stand-in, and drive it through `axum_test::TestServer`.
//!
//! Run with `cargo test -p openheart-api`.

#![allow(dead_code)]

pub mod auth;

use axum_test::multipart::{MultipartForm, Part};
use axum_test::TestServer;
use openheart_api::auth::SessionKeys;
use openheart_api::setup::routes;
use openheart_api::state::AppState;
use openheart_archive::InMemoryArchive;
use openheart_core::{ArchiveConfig, Config, ConverterConfig, SmtpConfig};
use openheart_db::{connect_in_memory, FileRepository, SqlitePool, UserRepository};
use openheart_services::testing::{dicom_series_zip, zip_bytes, FakeConverter};
use openheart_services::{LifecycleConfig, SyncConfig, UploadLifecycle};
use std::sync::Arc;
use tempfile::TempDir;

pub use auth::RecordingTokenSender;

pub const TEST_JWT_SECRET: &str = "test-secret-key-min-32-characters-long";

/// Test application: server plus the fakes behind it.
pub struct TestApp {
    pub server: TestServer,
    pub pool: SqlitePool,
    pub archive: Arc<InMemoryArchive>,
    pub tokens: Arc<RecordingTokenSender>,
    pub sessions: SessionKeys,
    pub _temp_dir: TempDir,
}

impl TestApp {
    pub fn client(&self) -> &TestServer {
        &self.server
    }

    pub fn files(&self) -> FileRepository {
        FileRepository::new(self.pool.clone())
    }

    pub fn users(&self) -> UserRepository {
        UserRepository::new(self.pool.clone())
    }

    /// Finish reconstruction of every scan in the staging project.
    pub fn complete_all_reconstructions(&self) {
        for scan in self.archive.scans_in("vault") {
            self.archive.complete_reconstruction(&scan, dicom_series_zip(2, 2));
        }
    }
}

pub fn create_test_config(temp_dir: &TempDir) -> Config {
    let root = temp_dir.path();
    Config {
        environment: "development".to_string(),
        server_port: 0,
        database_url: "sqlite::memory:".to_string(),
        db_max_connections: 1,
        db_timeout_seconds: 5,
        jwt_secret: TEST_JWT_SECRET.to_string(),
        jwt_expiry_hours: 1,
        cors_origins: vec!["*".to_string()],
        data_path: root.join("data"),
        temp_path: root.join("tmp"),
        preview_path: root.join("previews"),
        max_upload_size_mb: 10,
        preview_fps: 30,
        status_poll_interval_ms: 10,
        status_default_timeout_seconds: 1,
        status_max_timeout_seconds: 2,
        archive: ArchiveConfig {
            server_url: "http://archive.invalid".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            vault_project: "vault".to_string(),
            open_project: "open".to_string(),
            timeout_seconds: 5,
        },
        converter: ConverterConfig {
            program: "docker".to_string(),
            image: "johannesmayer/s2i".to_string(),
            measurement: 1,
        },
        smtp: SmtpConfig::default(),
    }
}

pub async fn setup_test_app() -> TestApp {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let config = create_test_config(&temp_dir);

    let pool = connect_in_memory()
        .await
        .expect("Failed to open test database");
    let users = UserRepository::new(pool.clone());
    let files = FileRepository::new(pool.clone());
    let archive = Arc::new(InMemoryArchive::with_projects(&["vault", "open"]));
    let tokens = Arc::new(RecordingTokenSender::default());
    let sessions = SessionKeys::new(&config.jwt_secret, config.jwt_expiry_hours);

    let lifecycle = UploadLifecycle::new(
        users.clone(),
        files,
        Arc::new(FakeConverter::default()),
        archive.clone(),
        SyncConfig::from_config(&config),
        LifecycleConfig::from_config(&config),
    );
    let state = Arc::new(AppState {
        pool: pool.clone(),
        users,
        lifecycle,
        sessions: sessions.clone(),
        token_sender: tokens.clone(),
    });

    let app = routes::setup_routes(&config, state).expect("Failed to build routes");
    let server = TestServer::new(app.into_make_service()).expect("Failed to create test server");

    TestApp {
        server,
        pool,
        archive,
        tokens,
        sessions,
        _temp_dir: temp_dir,
    }
}

/// Multipart body carrying `entries` zipped under the `file` field.
pub fn zip_upload(entries: &[(&str, &[u8])]) -> MultipartForm {
    let part = Part::bytes(bytes::Bytes::from(zip_bytes(entries)))
        .file_name("upload.zip")
        .mime_type("application/zip");
    MultipartForm::new().add_part("file", part)
}
