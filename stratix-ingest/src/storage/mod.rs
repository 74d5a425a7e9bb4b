//! Object storage for uploaded source files
//!
//! Raw uploads are kept outside the relational store and referenced from the
//! job by key. Two backends: a local directory and an HTTP object service.

mod fs;
mod http;

pub use fs::FsObjectStore;
pub use http::HttpObjectStore;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::services::resilience::Transience;

/// Object storage failures
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object '{0}' not found")]
    NotFound(String),

    /// Backend unreachable, timing out or overloaded; worth retrying
    #[error("object storage unavailable: {0}")]
    Unavailable(String),

    /// Request refused (bad key, permission denied, ...)
    #[error("object storage rejected request: {0}")]
    Rejected(String),
}

impl Transience for StorageError {
    fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// Minimal object store contract used by the import pipeline
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Cheap round trip proving the backend is reachable right now
    async fn probe(&self) -> Result<(), StorageError>;
}

/// Reject keys that could escape the bucket or root directory
pub fn validate_key(key: &str) -> Result<(), StorageError> {
    let well_formed = !key.is_empty()
        && !key.starts_with('/')
        && key.split('/').all(|segment| !segment.is_empty() && segment != "." && segment != "..")
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    if well_formed {
        Ok(())
    } else {
        Err(StorageError::Rejected(format!("invalid object key '{}'", key)))
    }
}

/// Storage key for a freshly uploaded file: `<tenant>/<job>/<file name>`
pub fn upload_key(tenant_id: Uuid, job_id: Uuid, file_name: &str) -> String {
    let mut safe: String = file_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    safe = safe.trim_matches('.').to_string();
    if safe.is_empty() {
        safe = "upload.csv".to_string();
    }
    format!("{}/{}/{}", tenant_id, job_id, safe)
}
