use std::env;
use std::path::PathBuf;

/// Remote archive connection and project layout.
#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub server_url: String,
    pub username: String,
    pub password: String,
    /// Staging project newly transmitted data lands in.
    pub vault_project: String,
    /// Public project accepted subjects are shared into.
    pub open_project: String,
    pub timeout_seconds: u64,
}

/// External raw-format converter invocation.
#[derive(Debug, Clone)]
pub struct ConverterConfig {
    pub program: String,
    pub image: String,
    pub measurement: u32,
}

/// Outgoing mail for login tokens. Absent host means tokens are only logged as sent.
#[derive(Debug, Clone, Default)]
pub struct SmtpConfig {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from: Option<String>,
    pub tls: bool,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,
    pub server_port: u16,
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub jwt_secret: String,
    pub jwt_expiry_hours: i64,
    pub cors_origins: Vec<String>,
    pub data_path: PathBuf,
    pub temp_path: PathBuf,
    pub preview_path: PathBuf,
    pub max_upload_size_mb: usize,
    pub preview_fps: u32,
    pub status_poll_interval_ms: u64,
    pub status_default_timeout_seconds: u64,
    /// Upper bound for a client-supplied status timeout.
    pub status_max_timeout_seconds: u64,
    pub archive: ArchiveConfig,
    pub converter: ConverterConfig,
    pub smtp: SmtpConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        const SERVER_PORT: u16 = 8080;
        const DB_MAX_CONNECTIONS: u32 = 5;
        const DB_TIMEOUT_SECONDS: u64 = 30;
        const JWT_EXPIRY_HOURS: i64 = 24;
        const MAX_UPLOAD_SIZE_MB: usize = 2048;
        const PREVIEW_FPS: u32 = 30;
        const STATUS_POLL_INTERVAL_MS: u64 = 2000;
        const STATUS_DEFAULT_TIMEOUT_SECONDS: u64 = 60;
        const STATUS_MAX_TIMEOUT_SECONDS: u64 = 600;
        const ARCHIVE_TIMEOUT_SECONDS: u64 = 300;
        const CONVERTER_MEASUREMENT: u32 = 1;
        const SMTP_PORT: u16 = 587;

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let cors_origins_str = env::var("CORS_ORIGINS").unwrap_or_else(|_| "*".to_string());
        let cors_origins: Vec<String> = cors_origins_str
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let server_port = env::var("PORT")
            .unwrap_or_else(|_| SERVER_PORT.to_string())
            .parse()
            .unwrap_or(SERVER_PORT);

        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://openheart.db".to_string());

        let db_max_connections = env::var("DB_MAX_CONNECTIONS")
            .unwrap_or_else(|_| DB_MAX_CONNECTIONS.to_string())
            .parse()
            .unwrap_or(DB_MAX_CONNECTIONS);

        let db_timeout_seconds = env::var("DB_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| DB_TIMEOUT_SECONDS.to_string())
            .parse()
            .unwrap_or(DB_TIMEOUT_SECONDS);

        let jwt_secret =
            env::var("JWT_SECRET").map_err(|_| anyhow::anyhow!("JWT_SECRET must be set"))?;

        let jwt_expiry_hours = env::var("JWT_EXPIRY_HOURS")
            .unwrap_or_else(|_| JWT_EXPIRY_HOURS.to_string())
            .parse()
            .unwrap_or(JWT_EXPIRY_HOURS);

        let data_path = PathBuf::from(env::var("DATA_PATH").unwrap_or_else(|_| "./data".into()));
        let temp_path = PathBuf::from(env::var("TEMP_FOLDER").unwrap_or_else(|_| "./tmp".into()));
        let preview_path =
            PathBuf::from(env::var("PREVIEW_PATH").unwrap_or_else(|_| "./previews".into()));

        let max_upload_size_mb = env::var("MAX_UPLOAD_SIZE_MB")
            .unwrap_or_else(|_| MAX_UPLOAD_SIZE_MB.to_string())
            .parse()
            .unwrap_or(MAX_UPLOAD_SIZE_MB);

        let preview_fps = env::var("PREVIEW_FPS")
            .unwrap_or_else(|_| PREVIEW_FPS.to_string())
            .parse()
            .unwrap_or(PREVIEW_FPS);

        let status_poll_interval_ms = env::var("STATUS_POLL_INTERVAL_MS")
            .unwrap_or_else(|_| STATUS_POLL_INTERVAL_MS.to_string())
            .parse()
            .unwrap_or(STATUS_POLL_INTERVAL_MS);

        let status_default_timeout_seconds = env::var("STATUS_DEFAULT_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| STATUS_DEFAULT_TIMEOUT_SECONDS.to_string())
            .parse()
            .unwrap_or(STATUS_DEFAULT_TIMEOUT_SECONDS);

        let status_max_timeout_seconds = env::var("STATUS_MAX_TIMEOUT_SECONDS")
            .unwrap_or_else(|_| STATUS_MAX_TIMEOUT_SECONDS.to_string())
            .parse()
            .unwrap_or(STATUS_MAX_TIMEOUT_SECONDS);

        let archive = ArchiveConfig {
            server_url: env::var("XNAT_SERVER")
                .map_err(|_| anyhow::anyhow!("XNAT_SERVER must be set"))?,
            username: env::var("XNAT_ADMIN_USER")
                .map_err(|_| anyhow::anyhow!("XNAT_ADMIN_USER must be set"))?,
            password: env::var("XNAT_ADMIN_PW")
                .map_err(|_| anyhow::anyhow!("XNAT_ADMIN_PW must be set"))?,
            vault_project: env::var("XNAT_PROJECT_ID_VAULT").unwrap_or_else(|_| "vault".into()),
            open_project: env::var("XNAT_PROJECT_ID_OPEN").unwrap_or_else(|_| "open".into()),
            timeout_seconds: env::var("XNAT_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| ARCHIVE_TIMEOUT_SECONDS.to_string())
                .parse()
                .unwrap_or(ARCHIVE_TIMEOUT_SECONDS),
        };

        let converter = ConverterConfig {
            program: env::var("CONVERTER_PROGRAM").unwrap_or_else(|_| "docker".into()),
            image: env::var("CONVERTER_IMAGE").unwrap_or_else(|_| "johannesmayer/s2i".into()),
            measurement: env::var("CONVERTER_MEASUREMENT")
                .unwrap_or_else(|_| CONVERTER_MEASUREMENT.to_string())
                .parse()
                .unwrap_or(CONVERTER_MEASUREMENT),
        };

        let smtp = SmtpConfig {
            host: env::var("SMTP_HOST").ok().filter(|s| !s.is_empty()),
            port: env::var("SMTP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(SMTP_PORT),
            user: env::var("SMTP_USER").ok(),
            password: env::var("SMTP_PASSWORD").ok(),
            from: env::var("SMTP_FROM").ok(),
            tls: env::var("SMTP_TLS")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
        };

        let config = Config {
            environment,
            server_port,
            database_url,
            db_max_connections,
            db_timeout_seconds,
            jwt_secret,
            jwt_expiry_hours,
            cors_origins,
            data_path,
            temp_path,
            preview_path,
            max_upload_size_mb,
            preview_fps,
            status_poll_interval_ms,
            status_default_timeout_seconds,
            status_max_timeout_seconds,
            archive,
            converter,
            smtp,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.jwt_secret.len() < 32 {
            return Err(anyhow::anyhow!(
                "JWT_SECRET must be at least 32 characters long"
            ));
        }

        if !self.database_url.starts_with("sqlite:") {
            return Err(anyhow::anyhow!(
                "DATABASE_URL must be a valid SQLite connection string"
            ));
        }

        if !self.archive.server_url.starts_with("http://")
            && !self.archive.server_url.starts_with("https://")
        {
            return Err(anyhow::anyhow!("XNAT_SERVER must be an http(s) URL"));
        }

        if self.archive.vault_project == self.archive.open_project {
            return Err(anyhow::anyhow!(
                "XNAT_PROJECT_ID_VAULT and XNAT_PROJECT_ID_OPEN must differ"
            ));
        }

        if self.status_default_timeout_seconds > self.status_max_timeout_seconds {
            return Err(anyhow::anyhow!(
                "STATUS_DEFAULT_TIMEOUT_SECONDS cannot exceed STATUS_MAX_TIMEOUT_SECONDS"
            ));
        }

        if self.preview_fps == 0 {
            return Err(anyhow::anyhow!("PREVIEW_FPS must be greater than zero"));
        }

        if self.is_production() && self.cors_origins.iter().any(|o| o == "*") {
            return Err(anyhow::anyhow!(
                "CORS_ORIGINS cannot be '*' in production. Please specify explicit origins."
            ));
        }

        if self.smtp.host.is_some() && self.smtp.from.is_none() {
            return Err(anyhow::anyhow!("SMTP_HOST requires SMTP_FROM to be set"));
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        let env = self.environment.to_lowercase();
        env == "production" || env == "prod"
    }

    pub fn max_upload_size_bytes(&self) -> usize {
        self.max_upload_size_mb * 1024 * 1024
    }
}
