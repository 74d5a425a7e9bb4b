//! Local directory backend

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

use super::{validate_key, ObjectStore, StorageError};

/// Stores objects as files below a root directory
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if needed
    pub async fn ensure_root(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| io_error(&self.root.display().to_string(), e))
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

fn io_error(key: &str, err: std::io::Error) -> StorageError {
    match err.kind() {
        ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
        ErrorKind::PermissionDenied => StorageError::Rejected(format!("{}: {}", key, err)),
        _ => StorageError::Unavailable(format!("{}: {}", key, err)),
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        // Root must already exist; a missing root means the volume is gone
        if !tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            return Err(StorageError::Unavailable(format!(
                "storage root {} is missing",
                self.root.display()
            )));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(key, e))?;
        }

        // Write then rename so readers never see a partial object
        let tmp = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error(key, e))?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(io_error(key, e));
        }

        debug!(key, bytes = bytes.len(), "Stored object");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let path = self.path_for(key)?;
        if !tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            return Err(StorageError::Unavailable(format!(
                "storage root {} is missing",
                self.root.display()
            )));
        }
        tokio::fs::read(&path).await.map_err(|e| io_error(key, e))
    }

    async fn probe(&self) -> Result<(), StorageError> {
        let metadata = tokio::fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Unavailable(format!("{}: {}", self.root.display(), e))
        })?;
        if !metadata.is_dir() {
            return Err(StorageError::Unavailable(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        tokio::fs::read_dir(&self.root)
            .await
            .map_err(|e| StorageError::Unavailable(format!("{}: {}", self.root.display(), e)))?;
        Ok(())
    }
}
