//! File storage collaborator for export archives.
//!
//! Only the local filesystem backend lives here. Object stores implement
//! [`FileStorage`] in the service that owns their credentials and report
//! [`StorageBackend::S3`].

use crate::errors::StorageError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Where a stored file lives. Persisted as `storage_type` on export rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Local filesystem, `file_path` is a filesystem path.
    Local,
    /// S3 compatible object store, `file_path` is the object key.
    S3,
}

impl StorageBackend {
    /// The persisted tag.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::S3 => "s3",
        }
    }

    /// Parses a persisted tag. Unknown tags are treated as local.
    pub fn from_tag(tag: &str) -> Self {
        if tag.eq_ignore_ascii_case("s3") {
            Self::S3
        } else {
            Self::Local
        }
    }
}

/// Result of a successful [`FileStorage::save`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Path or key to persist and later delete with.
    pub path: String,
    /// Size in bytes.
    pub size: i64,
    /// Backend that holds the file.
    pub backend: StorageBackend,
}

/// A place to put export archives.
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Which backend this is.
    fn backend(&self) -> StorageBackend;

    /// Store `bytes` under `key`, replacing any existing file.
    async fn save(&self, key: &str, bytes: Vec<u8>) -> Result<StoredObject, StorageError>;

    /// Delete the file stored under `key`. A missing file is not an error.
    async fn delete_file_with_key(&self, key: &str) -> Result<(), StorageError>;
}

/// Stores files below a root directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create a storage rooted at `root`. The directory is created on first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let is_safe = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
        if key.is_empty() || !is_safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl FileStorage for LocalStorage {
    fn backend(&self) -> StorageBackend {
        StorageBackend::Local
    }

    async fn save(&self, key: &str, bytes: Vec<u8>) -> Result<StoredObject, StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write then rename so a crashed attempt never leaves a truncated archive
        // under the final name.
        let partial = path.with_extension("partial");
        fs::write(&partial, &bytes).await?;
        fs::rename(&partial, &path).await?;

        debug!(path = %path.display(), size = bytes.len(), "Stored file");
        Ok(StoredObject {
            path: path.to_string_lossy().into_owned(),
            size: i64::try_from(bytes.len()).unwrap_or(i64::MAX),
            backend: StorageBackend::Local,
        })
    }

    async fn delete_file_with_key(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        remove_local_file(&path).await
    }
}

/// Removes a file by path, treating "already gone" as success.
pub async fn remove_local_file(path: impl AsRef<Path>) -> Result<(), StorageError> {
    match fs::remove_file(path.as_ref()).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == ErrorKind::NotFound => {
            debug!(path = %path.as_ref().display(), "File already removed");
            Ok(())
        }
        Err(error) => Err(error.into()),
    }
}
