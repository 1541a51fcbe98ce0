//! Content identity: digest a file and move it to a name derived from that digest.

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

/// Read size used when hashing; bounds memory regardless of file size.
pub const DIGEST_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{0} has no parent directory")]
    InvalidPath(PathBuf),
}

/// Outcome of [`canonicalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// The file now lives at its canonical name.
    Renamed { canonical: PathBuf, digest: String },
    /// The file already had its canonical name.
    AlreadyCanonical { canonical: PathBuf, digest: String },
    /// Another file already holds the canonical name. `duplicate` was left untouched.
    Duplicate {
        canonical: PathBuf,
        duplicate: PathBuf,
        digest: String,
    },
}

impl Identity {
    pub fn canonical_path(&self) -> &Path {
        match self {
            Identity::Renamed { canonical, .. }
            | Identity::AlreadyCanonical { canonical, .. }
            | Identity::Duplicate { canonical, .. } => canonical,
        }
    }

    pub fn digest(&self) -> &str {
        match self {
            Identity::Renamed { digest, .. }
            | Identity::AlreadyCanonical { digest, .. }
            | Identity::Duplicate { digest, .. } => digest,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Identity::Duplicate { .. })
    }
}

/// Lowercase hex SHA-256 of the file contents.
pub async fn content_digest(path: &Path) -> Result<String, IdentityError> {
    let read_err = |source| IdentityError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut file = tokio::fs::File::open(path).await.map_err(read_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; DIGEST_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(read_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Sibling of `path` named after `digest`, keeping the original extension.
pub fn canonical_path_for(path: &Path, digest: &str) -> Result<PathBuf, IdentityError> {
    let parent = path
        .parent()
        .ok_or_else(|| IdentityError::InvalidPath(path.to_path_buf()))?;
    let name = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}", digest, ext),
        None => digest.to_string(),
    };
    Ok(parent.join(name))
}

/// Rename `path` to its content-addressed name.
///
/// The move never overwrites: the canonical name is claimed with a hard link, which
/// fails if the name is taken, and only then is the old name removed. An existing file
/// under the canonical name is reported as [`Identity::Duplicate`].
pub async fn canonicalize(path: &Path) -> Result<Identity, IdentityError> {
    let digest = content_digest(path).await?;
    let canonical = canonical_path_for(path, &digest)?;

    if canonical == path {
        return Ok(Identity::AlreadyCanonical { canonical, digest });
    }

    let rename_err = |source| IdentityError::Rename {
        from: path.to_path_buf(),
        to: canonical.clone(),
        source,
    };

    match tokio::fs::hard_link(path, &canonical).await {
        Ok(()) => {
            tokio::fs::remove_file(path).await.map_err(rename_err)?;
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            tracing::warn!(
                file = %path.display(),
                canonical = %canonical.display(),
                "Canonical name already taken, reporting duplicate"
            );
            return Ok(Identity::Duplicate {
                canonical,
                duplicate: path.to_path_buf(),
                digest,
            });
        }
        Err(e) => {
            // filesystems without hard links
            tracing::debug!(error = %e, "Hard link failed, falling back to rename");
            if tokio::fs::try_exists(&canonical).await.map_err(rename_err)? {
                return Ok(Identity::Duplicate {
                    canonical,
                    duplicate: path.to_path_buf(),
                    digest,
                });
            }
            tokio::fs::rename(path, &canonical).await.map_err(rename_err)?;
        }
    }

    tracing::info!(
        file = %path.display(),
        canonical = %canonical.display(),
        "File renamed to content digest"
    );
    Ok(Identity::Renamed { canonical, digest })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_digest_is_sha256_hex() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.h5");
        tokio::fs::write(&path, b"").await.unwrap();

        assert_eq!(
            content_digest(&path).await.unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_digest_spans_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.h5");
        let b = dir.path().join("b.h5");
        let mut data = vec![7u8; DIGEST_CHUNK_SIZE * 2 + 10];
        tokio::fs::write(&a, &data).await.unwrap();
        *data.last_mut().unwrap() = 8;
        tokio::fs::write(&b, &data).await.unwrap();

        assert_ne!(
            content_digest(&a).await.unwrap(),
            content_digest(&b).await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_canonicalize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan1.h5");
        tokio::fs::write(&path, b"raw k-space").await.unwrap();

        let first = canonicalize(&path).await.unwrap();
        assert!(matches!(first, Identity::Renamed { .. }));
        assert!(!path.exists());
        let canonical = first.canonical_path().to_path_buf();
        assert_eq!(canonical.extension().unwrap(), "h5");
        assert_eq!(
            canonical.file_stem().unwrap().to_str().unwrap(),
            first.digest()
        );

        let second = canonicalize(&canonical).await.unwrap();
        assert!(matches!(second, Identity::AlreadyCanonical { .. }));
        assert_eq!(second.canonical_path(), canonical.as_path());
    }

    #[tokio::test]
    async fn test_identical_content_reports_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.h5");
        let second = dir.path().join("second.h5");
        tokio::fs::write(&first, b"same bytes").await.unwrap();
        tokio::fs::write(&second, b"same bytes").await.unwrap();

        let kept = canonicalize(&first).await.unwrap();
        let dup = canonicalize(&second).await.unwrap();

        assert!(dup.is_duplicate());
        assert_eq!(dup.canonical_path(), kept.canonical_path());
        // the duplicate is left for the caller to drop
        assert!(second.exists());
        assert_eq!(tokio::fs::read(kept.canonical_path()).await.unwrap(), b"same bytes");
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = canonicalize(&dir.path().join("missing.h5"))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::Read { .. }));
    }
}
