//! Object storage abstraction.
//!
//! [`StorageBackend`] is a CRUD-like contract over the object stores the
//! registry can write to, with two implementations:
//!   * [`local_fs`] keeps objects under a base directory on the host
//!   * [`s3`] talks to any S3-compatible endpoint
//!
//! Every uploaded object carries its SHA-256 hex digest as user metadata
//! under the `sha256` key; the digest is computed while the bytes stream
//! through, never in a second pass over stored data.

pub mod local_fs;
pub mod s3;

pub use local_fs::LocalFsBackend;
pub use s3::S3Backend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::config::{StorageBackendKind, StorageOptions};
use crate::error::{BaliseError, Result};

/// User-metadata key carrying the content digest.
pub const SHA256_METADATA_KEY: &str = "sha256";

/// A readable object body.
pub type ObjectReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Result of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    pub path: String,
    pub stored_size: u64,
    pub sha256_hex: String,
}

/// Metadata of a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMetadata {
    pub path: String,
    pub size: u64,
    pub sha256_hex: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Uniform object-store contract.
///
/// Implementations are safe for concurrent use behind an `Arc`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend name recorded on platform rows (`local`, `s3`).
    fn name(&self) -> &'static str;

    /// Store an object, computing SHA-256 while writing.
    ///
    /// `size_hint` is advisory; the stored size may differ. On error any
    /// partial object is removed.
    async fn upload(
        &self,
        path: &str,
        reader: ObjectReader,
        size_hint: Option<u64>,
    ) -> Result<UploadResult>;

    /// Store a large object in parts of `part_size` bytes (5 MiB or more
    /// recommended). On any part failure the whole upload is aborted. The
    /// digest covers the full content.
    async fn upload_multipart(
        &self,
        path: &str,
        reader: ObjectReader,
        part_size: usize,
    ) -> Result<UploadResult>;

    /// Open an object for reading. Fails with `ObjectNotFound` when absent.
    async fn download(&self, path: &str) -> Result<ObjectReader>;

    /// Remove an object. Removing an absent object is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Whether an object exists.
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Metadata of a stored object. If the store carries a `sha256`
    /// user-metadata value it is returned without reading the content;
    /// otherwise the digest is computed by streaming.
    async fn get_metadata(&self, path: &str) -> Result<ObjectMetadata>;

    /// A URL a client can fetch the object from for the next `ttl`.
    /// Fails with `ObjectNotFound` when the object is absent.
    async fn get_url(&self, path: &str, ttl: Duration) -> Result<String>;

    /// Keys under `prefix`, at most `max_keys`.
    async fn list_objects(&self, prefix: &str, max_keys: usize) -> Result<Vec<String>>;

    /// Batch-delete every key under `prefix`.
    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Convenience: store an in-memory buffer.
    async fn upload_bytes(&self, path: &str, bytes: Bytes) -> Result<UploadResult> {
        let size = bytes.len() as u64;
        let reader: ObjectReader = Box::new(std::io::Cursor::new(bytes));
        self.upload(path, reader, Some(size)).await
    }
}

/// Build the configured backend. `base_url` is the externally visible
/// server URL, used by the local backend when serving objects directly.
///
/// # Errors
///
/// Returns an error if the backend configuration is unusable.
pub async fn make_backend(options: &StorageOptions, base_url: &str) -> Result<Arc<dyn StorageBackend>> {
    match options.backend {
        StorageBackendKind::Local => Ok(Arc::new(
            LocalFsBackend::new(&options.local)?.with_base_url(base_url),
        )),
        StorageBackendKind::S3 => Ok(Arc::new(S3Backend::new(&options.s3).await?)),
    }
}

/// Validate a logical object path and return its segments.
///
/// Logical paths always use `/`; segments must be non-empty and free of
/// traversal components so they can be joined onto any host separator.
pub(crate) fn path_segments(path: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return Err(BaliseError::storage(path, "empty object path"));
    }
    for segment in &segments {
        if *segment == "." || *segment == ".." || segment.contains('\\') || segment.contains('\0') {
            return Err(BaliseError::storage(path, format!("invalid path segment '{segment}'")));
        }
    }
    Ok(segments)
}
