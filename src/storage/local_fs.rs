//! Local filesystem storage backend.
//!
//! Objects live under a configured base path. The filesystem has no user
//! metadata, so the SHA-256 digest is kept in a `<path>.sha256` sidecar
//! file; sidecars never appear in listings and are removed with their
//! object. Empty parent directories are pruned on delete, best effort.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::config::LocalStorageOptions;
use crate::error::{BaliseError, Result};
use super::{path_segments, ObjectMetadata, ObjectReader, StorageBackend, UploadResult};

const SIDECAR_SUFFIX: &str = ".sha256";
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Filesystem-backed object store.
#[derive(Debug)]
pub struct LocalFsBackend {
    base_path: PathBuf,
    base_url: String,
    serve_directly: bool,
}

impl LocalFsBackend {
    /// Create a backend rooted at the configured base path.
    ///
    /// # Errors
    ///
    /// Returns an error if the base directory cannot be created.
    pub fn new(options: &LocalStorageOptions) -> Result<Self> {
        let base_path = PathBuf::from(&options.base_path);
        std::fs::create_dir_all(&base_path)?;
        Ok(Self {
            base_path,
            base_url: String::new(),
            serve_directly: options.serve_directly,
        })
    }

    /// Set the externally visible base URL used when serving directly.
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Resolve a logical path onto the host filesystem.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let mut full = self.base_path.clone();
        for segment in path_segments(path)? {
            full.push(segment);
        }
        Ok(full)
    }

    fn sidecar(full: &Path) -> PathBuf {
        let mut os = full.as_os_str().to_owned();
        os.push(SIDECAR_SUFFIX);
        PathBuf::from(os)
    }

    /// Remove now-empty parents between `full` and the base path.
    fn prune_empty_parents(&self, full: &Path) {
        let mut dir = full.parent();
        while let Some(parent) = dir {
            if parent == self.base_path || !parent.starts_with(&self.base_path) {
                break;
            }
            match std::fs::remove_dir(parent) {
                Ok(()) => dir = parent.parent(),
                // Not empty or already gone; stop quietly.
                Err(_) => break,
            }
        }
    }

    fn logical_path(&self, full: &Path) -> Option<String> {
        let rel = full.strip_prefix(&self.base_path).ok()?;
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    async fn write_stream(
        &self,
        full: &Path,
        mut reader: ObjectReader,
    ) -> Result<(u64, String)> {
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(full).await?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut buf = vec![0u8; COPY_BUF_SIZE];
        loop {
            let n = match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(full).await;
                    return Err(e.into());
                }
            };
            hasher.update(&buf[..n]);
            if let Err(e) = file.write_all(&buf[..n]).await {
                drop(file);
                let _ = tokio::fs::remove_file(full).await;
                return Err(e.into());
            }
            written += n as u64;
        }
        file.flush().await?;
        Ok((written, hex::encode(hasher.finalize())))
    }
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn upload(
        &self,
        path: &str,
        reader: ObjectReader,
        _size_hint: Option<u64>,
    ) -> Result<UploadResult> {
        let full = self.resolve(path)?;
        let (stored_size, sha256_hex) = self.write_stream(&full, reader).await?;
        tokio::fs::write(Self::sidecar(&full), &sha256_hex).await?;
        Ok(UploadResult {
            path: path.to_string(),
            stored_size,
            sha256_hex,
        })
    }

    async fn upload_multipart(
        &self,
        path: &str,
        reader: ObjectReader,
        _part_size: usize,
    ) -> Result<UploadResult> {
        // Parts are an S3 concern; one streamed write has the same
        // guarantees on a filesystem.
        self.upload(path, reader, None).await
    }

    async fn download(&self, path: &str) -> Result<ObjectReader> {
        let full = self.resolve(path)?;
        match tokio::fs::File::open(&full).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BaliseError::ObjectNotFound { path: path.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }
        let _ = tokio::fs::remove_file(Self::sidecar(&full)).await;
        self.prune_empty_parents(&full);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::try_exists(&full).await?)
    }

    async fn get_metadata(&self, path: &str) -> Result<ObjectMetadata> {
        let full = self.resolve(path)?;
        let meta = match tokio::fs::metadata(&full).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BaliseError::ObjectNotFound { path: path.to_string() });
            }
            Err(e) => return Err(e.into()),
        };

        let sha256_hex = match tokio::fs::read_to_string(Self::sidecar(&full)).await {
            Ok(stored) => stored.trim().to_string(),
            Err(_) => {
                // No sidecar: compute by streaming the object once.
                let mut file = tokio::fs::File::open(&full).await?;
                let mut hasher = Sha256::new();
                let mut buf = vec![0u8; COPY_BUF_SIZE];
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                hex::encode(hasher.finalize())
            }
        };

        let last_modified = meta
            .modified()
            .ok()
            .map(chrono::DateTime::<chrono::Utc>::from);

        Ok(ObjectMetadata {
            path: path.to_string(),
            size: meta.len(),
            sha256_hex: Some(sha256_hex),
            last_modified,
        })
    }

    async fn get_url(&self, path: &str, _ttl: Duration) -> Result<String> {
        let full = self.resolve(path)?;
        if !tokio::fs::try_exists(&full).await? {
            return Err(BaliseError::ObjectNotFound { path: path.to_string() });
        }
        if self.serve_directly && !self.base_url.is_empty() {
            Ok(format!("{}/v1/files/{}", self.base_url.trim_end_matches('/'), path))
        } else {
            Ok(format!("file://{}", full.display()))
        }
    }

    async fn list_objects(&self, prefix: &str, max_keys: usize) -> Result<Vec<String>> {
        let base = self.base_path.clone();
        let prefix = prefix.to_string();
        // walkdir is synchronous; run the scan off the async threads.
        let keys = tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            for entry in walkdir::WalkDir::new(&base)
                .follow_links(false)
                .into_iter()
                .filter_map(std::result::Result::ok)
            {
                if !entry.file_type().is_file() {
                    continue;
                }
                let Some(rel) = entry.path().strip_prefix(&base).ok() else {
                    continue;
                };
                let logical = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect::<Vec<_>>()
                    .join("/");
                if logical.ends_with(SIDECAR_SUFFIX) {
                    continue;
                }
                if logical.starts_with(&prefix) {
                    keys.push(logical);
                }
                if keys.len() >= max_keys {
                    break;
                }
            }
            keys.sort();
            keys
        })
        .await
        .map_err(|e| BaliseError::internal(format!("list task failed: {e}")))?;
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        // usize::MAX effectively means "everything under the prefix".
        let keys = self.list_objects(prefix, usize::MAX).await?;
        for key in keys {
            self.delete(&key).await?;
        }
        Ok(())
    }
}
