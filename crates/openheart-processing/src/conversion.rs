//! Format conversion gateway: proprietary raw data to the standard raw format.
//!
//! The converter runs as an isolated container with the input file's directory mounted
//! as both `/input` and `/output`. The underlying tool appends to an existing output
//! file, so an existing output is a hard precondition failure, and any partial output
//! is removed before a failure is reported.

use async_trait::async_trait;
use openheart_core::ConverterConfig;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Input file {0} does not exist")]
    MissingInput(PathBuf),

    #[error("Output {0} already exists; converting would append to it")]
    OutputExists(PathBuf),

    #[error("Invalid input path {0}")]
    InvalidPath(PathBuf),

    #[error("Failed to start converter: {0}")]
    Spawn(#[source] io::Error),

    #[error("Converter exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Converter finished but produced no output at {0}")]
    MissingOutput(PathBuf),
}

impl ConversionError {
    /// Precondition failures are never worth retrying with the same inputs.
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            ConversionError::MissingInput(_)
                | ConversionError::OutputExists(_)
                | ConversionError::InvalidPath(_)
        )
    }
}

/// Converts one proprietary-format file into a standard-format sibling.
#[async_trait]
pub trait FormatConverter: Send + Sync {
    /// Returns the path of the produced file. Either that file exists afterwards or
    /// an error is returned and nothing was left behind.
    async fn convert(&self, input: &Path) -> Result<PathBuf, ConversionError>;
}

/// Standard-format sibling the converter writes for `input`.
pub fn output_path_for(input: &Path) -> PathBuf {
    input.with_extension("h5")
}

pub struct ContainerConverter {
    program: String,
    image: String,
    measurement: u32,
}

impl ContainerConverter {
    pub fn new(program: impl Into<String>, image: impl Into<String>, measurement: u32) -> Self {
        Self {
            program: program.into(),
            image: image.into(),
            measurement,
        }
    }

    pub fn from_config(config: &ConverterConfig) -> Self {
        Self::new(&config.program, &config.image, config.measurement)
    }

    fn command_args(&self, input: &Path, output: &Path) -> Result<Vec<String>, ConversionError> {
        let invalid = || ConversionError::InvalidPath(input.to_path_buf());
        let dir = input.parent().ok_or_else(invalid)?;
        let input_name = input.file_name().and_then(|n| n.to_str()).ok_or_else(invalid)?;
        let output_name = output.file_name().and_then(|n| n.to_str()).ok_or_else(invalid)?;
        let dir = dir.to_string_lossy();

        Ok(vec![
            "run".to_string(),
            "--rm".to_string(),
            "-v".to_string(),
            format!("{}:/input", dir),
            "-v".to_string(),
            format!("{}:/output", dir),
            self.image.clone(),
            "siemens_to_ismrmrd".to_string(),
            "-z".to_string(),
            self.measurement.to_string(),
            "-f".to_string(),
            format!("/input/{}", input_name),
            "-o".to_string(),
            format!("/output/{}", output_name),
        ])
    }

    async fn remove_partial_output(output: &Path) {
        match tokio::fs::remove_file(output).await {
            Ok(()) => tracing::warn!(path = %output.display(), "Removed partial converter output"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(
                path = %output.display(),
                error = %e,
                "Failed to remove partial converter output"
            ),
        }
    }
}

#[async_trait]
impl FormatConverter for ContainerConverter {
    async fn convert(&self, input: &Path) -> Result<PathBuf, ConversionError> {
        let output = output_path_for(input);

        if !tokio::fs::try_exists(input).await.unwrap_or(false) {
            return Err(ConversionError::MissingInput(input.to_path_buf()));
        }
        if tokio::fs::try_exists(&output).await.unwrap_or(true) {
            return Err(ConversionError::OutputExists(output));
        }

        let args = self.command_args(input, &output)?;
        let start = Instant::now();
        tracing::info!(input = %input.display(), image = %self.image, "Starting raw-format conversion");

        let result = Command::new(&self.program)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await;

        let output_status = match result {
            Ok(out) => out,
            Err(e) => {
                Self::remove_partial_output(&output).await;
                return Err(ConversionError::Spawn(e));
            }
        };

        if !output_status.status.success() {
            Self::remove_partial_output(&output).await;
            return Err(ConversionError::Failed {
                status: output_status.status.to_string(),
                stderr: String::from_utf8_lossy(&output_status.stderr)
                    .trim()
                    .to_string(),
            });
        }

        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Err(ConversionError::MissingOutput(output));
        }

        tracing::info!(
            input = %input.display(),
            output = %output.display(),
            duration_ms = start.elapsed().as_millis(),
            "Raw-format conversion finished"
        );
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_mounts_parent_directory() {
        let converter = ContainerConverter::new("docker", "johannesmayer/s2i", 2);
        let input = Path::new("/data/user/meas_cine.dat");
        let args = converter
            .command_args(input, &output_path_for(input))
            .unwrap();

        assert_eq!(args[0], "run");
        assert!(args.contains(&"/data/user:/input".to_string()));
        assert!(args.contains(&"/data/user:/output".to_string()));
        assert!(args.contains(&"johannesmayer/s2i".to_string()));
        let tail = &args[args.len() - 6..];
        assert_eq!(
            tail,
            &["-z", "2", "-f", "/input/meas_cine.dat", "-o", "/output/meas_cine.h5"]
        );
    }

    #[tokio::test]
    async fn test_existing_output_is_precondition_failure() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("meas.dat");
        tokio::fs::write(&input, b"dat").await.unwrap();
        tokio::fs::write(dir.path().join("meas.h5"), b"old").await.unwrap();

        let converter = ContainerConverter::new("true", "unused", 1);
        let err = converter.convert(&input).await.unwrap_err();
        assert!(matches!(err, ConversionError::OutputExists(_)));
        assert!(err.is_precondition());
        // the pre-existing file is not touched
        assert_eq!(tokio::fs::read(dir.path().join("meas.h5")).await.unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_missing_input() {
        let dir = tempfile::tempdir().unwrap();
        let converter = ContainerConverter::new("true", "unused", 1);
        let err = converter
            .convert(&dir.path().join("absent.dat"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::MissingInput(_)));
    }

    #[tokio::test]
    async fn test_unknown_program_is_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("meas.dat");
        tokio::fs::write(&input, b"dat").await.unwrap();

        let converter = ContainerConverter::new("openheart-no-such-runtime", "unused", 1);
        let err = converter.convert(&input).await.unwrap_err();
        assert!(matches!(err, ConversionError::Spawn(_)));
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-runtime.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failure_removes_partial_output() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();
        let input = work.join("meas.dat");
        tokio::fs::write(&input, b"dat").await.unwrap();
        let output = output_path_for(&input);

        let script = write_script(
            dir.path(),
            &format!(
                "echo partial > '{}'\necho 'bad measurement' >&2\nexit 3",
                output.display()
            ),
        );
        let converter = ContainerConverter::new(script, "unused", 1);

        let err = converter.convert(&input).await.unwrap_err();
        match err {
            ConversionError::Failed { stderr, .. } => assert_eq!(stderr, "bad measurement"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!output.exists());
        assert!(input.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_success_requires_output() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        std::fs::create_dir(&work).unwrap();
        let input = work.join("meas.dat");
        tokio::fs::write(&input, b"dat").await.unwrap();
        let output = output_path_for(&input);

        let silent = ContainerConverter::new(write_script(dir.path(), "exit 0"), "unused", 1);
        assert!(matches!(
            silent.convert(&input).await.unwrap_err(),
            ConversionError::MissingOutput(_)
        ));

        let working = ContainerConverter::new(
            write_script(dir.path(), &format!("echo ismrmrd > '{}'", output.display())),
            "unused",
            1,
        );
        assert_eq!(working.convert(&input).await.unwrap(), output);
        assert!(output.exists());
    }
}
