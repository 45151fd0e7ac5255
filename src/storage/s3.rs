//! S3-compatible storage backend.
//!
//! Works against AWS S3 and any S3-compatible endpoint (custom endpoints
//! force path-style addressing). Credentials come from one of four modes:
//! the ambient chain, static keys, a web-identity token file, or an
//! assumed role.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, MetadataDirective, ObjectIdentifier};
use aws_sdk_s3::Client;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::config::{S3AuthMode, S3StorageOptions};
use crate::error::{BaliseError, Result};
use super::{ObjectMetadata, ObjectReader, StorageBackend, UploadResult, SHA256_METADATA_KEY};

/// S3 limits a single DeleteObjects call to 1000 keys.
const MAX_KEYS_PER_DELETE: usize = 1000;
const READ_BUF_SIZE: usize = 64 * 1024;

/// S3-compatible object store.
#[derive(Debug, Clone)]
pub struct S3Backend {
    client: Client,
    bucket: String,
}

impl S3Backend {
    /// Build a client for the configured endpoint and auth mode.
    ///
    /// # Errors
    ///
    /// Returns `ConfigMissing` when the selected auth mode lacks its
    /// required fields.
    pub async fn new(options: &S3StorageOptions) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::v2023_11_09())
            .region(Region::new(options.region.clone()));

        match options.auth_mode {
            S3AuthMode::Default => {}
            S3AuthMode::Static => {
                let access_key = options.access_key_id.clone().ok_or(BaliseError::ConfigMissing {
                    key: "storage.s3.access_key_id".to_string(),
                })?;
                let secret_key = options.secret_access_key.clone().ok_or(BaliseError::ConfigMissing {
                    key: "storage.s3.secret_access_key".to_string(),
                })?;
                loader = loader.credentials_provider(Credentials::new(
                    access_key, secret_key, None, None, "balise-static",
                ));
            }
            S3AuthMode::Oidc => {
                let token_file = options
                    .web_identity_token_file
                    .clone()
                    .ok_or(BaliseError::ConfigMissing {
                        key: "storage.s3.web_identity_token_file".to_string(),
                    })?;
                let role_arn = options.role_arn.clone().ok_or(BaliseError::ConfigMissing {
                    key: "storage.s3.role_arn".to_string(),
                })?;
                // The SDK's web-identity provider reads the standard
                // variables; bind the configured values to them.
                std::env::set_var("AWS_WEB_IDENTITY_TOKEN_FILE", token_file);
                std::env::set_var("AWS_ROLE_ARN", role_arn);
                std::env::set_var("AWS_ROLE_SESSION_NAME", "balise-mirror");
            }
            S3AuthMode::AssumeRole => {
                let role_arn = options.role_arn.clone().ok_or(BaliseError::ConfigMissing {
                    key: "storage.s3.role_arn".to_string(),
                })?;
                let mut builder = aws_config::sts::AssumeRoleProvider::builder(role_arn)
                    .region(Region::new(options.region.clone()))
                    .session_name("balise-mirror");
                if let Some(external_id) = &options.external_id {
                    builder = builder.external_id(external_id);
                }
                loader = loader.credentials_provider(builder.build().await);
            }
        }

        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &options.endpoint {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        } else if options.force_path_style {
            builder = builder.force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        Ok(Self {
            client,
            bucket: options.bucket.clone(),
        })
    }

    /// Wrap an existing client; used by the tests.
    #[must_use]
    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    fn map_sdk_err<E: std::fmt::Display>(path: &str, err: E) -> BaliseError {
        BaliseError::storage(path, err.to_string())
    }

    async fn abort_multipart(&self, path: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(path)
            .upload_id(upload_id)
            .send()
            .await
        {
            tracing::warn!(path = %path, error = %e, "Failed to abort multipart upload");
        }
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn upload(
        &self,
        path: &str,
        mut reader: ObjectReader,
        size_hint: Option<u64>,
    ) -> Result<UploadResult> {
        super::path_segments(path)?;
        // PutObject needs the full body; buffer while hashing. Callers
        // with large objects use upload_multipart instead.
        let mut body = size_hint.map_or_else(Vec::new, |hint| {
            Vec::with_capacity(usize::try_from(hint).unwrap_or(0))
        });
        reader
            .read_to_end(&mut body)
            .await
            .map_err(|e| Self::map_sdk_err(path, e))?;
        let sha256_hex = hex::encode(Sha256::digest(&body));
        let stored_size = body.len() as u64;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .metadata(SHA256_METADATA_KEY, &sha256_hex)
            .body(ByteStream::from(Bytes::from(body)))
            .send()
            .await
            .map_err(|e| Self::map_sdk_err(path, e))?;

        Ok(UploadResult {
            path: path.to_string(),
            stored_size,
            sha256_hex,
        })
    }

    async fn upload_multipart(
        &self,
        path: &str,
        mut reader: ObjectReader,
        part_size: usize,
    ) -> Result<UploadResult> {
        super::path_segments(path)?;
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| Self::map_sdk_err(path, e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| BaliseError::storage(path, "multipart create returned no upload id"))?
            .to_string();

        let mut hasher = Sha256::new();
        let mut completed_parts = Vec::new();
        let mut part_number: i32 = 1;
        let mut total: u64 = 0;

        loop {
            // Fill one part, tolerating short reads from the source.
            let mut part = Vec::with_capacity(part_size);
            let mut chunk = vec![0u8; READ_BUF_SIZE];
            while part.len() < part_size {
                let n = match reader.read(&mut chunk).await {
                    Ok(n) => n,
                    Err(e) => {
                        self.abort_multipart(path, &upload_id).await;
                        return Err(Self::map_sdk_err(path, e));
                    }
                };
                if n == 0 {
                    break;
                }
                part.extend_from_slice(&chunk[..n]);
            }
            if part.is_empty() {
                break;
            }
            hasher.update(&part);
            total += part.len() as u64;
            let last_part = part.len() < part_size;

            let uploaded = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(path)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(Bytes::from(part)))
                .send()
                .await;
            let uploaded = match uploaded {
                Ok(part) => part,
                Err(e) => {
                    self.abort_multipart(path, &upload_id).await;
                    return Err(Self::map_sdk_err(path, e));
                }
            };
            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .build(),
            );
            part_number += 1;
            if last_part {
                break;
            }
        }

        let sha256_hex = hex::encode(hasher.finalize());
        let complete = self
            .client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(path)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await;
        if let Err(e) = complete {
            self.abort_multipart(path, &upload_id).await;
            return Err(Self::map_sdk_err(path, e));
        }

        // Multipart uploads cannot carry user metadata at create time in a
        // way that survives all S3-compatible stores; patch it in place.
        let patch = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, path))
            .key(path)
            .metadata_directive(MetadataDirective::Replace)
            .metadata(SHA256_METADATA_KEY, &sha256_hex)
            .send()
            .await;
        if let Err(e) = patch {
            tracing::warn!(path = %path, error = %e, "Failed to patch sha256 metadata after multipart upload");
        }

        Ok(UploadResult {
            path: path.to_string(),
            stored_size: total,
            sha256_hex,
        })
    }

    async fn download(&self, path: &str) -> Result<ObjectReader> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await;
        match response {
            Ok(output) => Ok(Box::new(output.body.into_async_read())),
            Err(sdk_err) => {
                if sdk_err
                    .as_service_error()
                    .is_some_and(|e| e.is_no_such_key())
                {
                    Err(BaliseError::ObjectNotFound { path: path.to_string() })
                } else {
                    Err(Self::map_sdk_err(path, sdk_err))
                }
            }
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        // DeleteObject succeeds for absent keys, matching the contract.
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| Self::map_sdk_err(path, e))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await;
        match response {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                if sdk_err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    Ok(false)
                } else {
                    Err(Self::map_sdk_err(path, sdk_err))
                }
            }
        }
    }

    async fn get_metadata(&self, path: &str) -> Result<ObjectMetadata> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await;
        let head = match head {
            Ok(head) => head,
            Err(sdk_err) => {
                return if sdk_err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    Err(BaliseError::ObjectNotFound { path: path.to_string() })
                } else {
                    Err(Self::map_sdk_err(path, sdk_err))
                };
            }
        };

        let size = head.content_length().unwrap_or(0).max(0) as u64;
        let last_modified = head
            .last_modified()
            .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), t.subsec_nanos()));

        let stored = head
            .metadata()
            .and_then(|m| m.get(SHA256_METADATA_KEY))
            .cloned();
        let sha256_hex = match stored {
            Some(hash) => Some(hash),
            None => {
                // No stored digest: stream the object once to compute it.
                let mut reader = self.download(path).await?;
                let mut hasher = Sha256::new();
                let mut buf = vec![0u8; READ_BUF_SIZE];
                loop {
                    let n = reader.read(&mut buf).await.map_err(|e| Self::map_sdk_err(path, e))?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Some(hex::encode(hasher.finalize()))
            }
        };

        Ok(ObjectMetadata {
            path: path.to_string(),
            size,
            sha256_hex,
            last_modified,
        })
    }

    async fn get_url(&self, path: &str, ttl: Duration) -> Result<String> {
        if !self.exists(path).await? {
            return Err(BaliseError::ObjectNotFound { path: path.to_string() });
        }
        let config = PresigningConfig::expires_in(ttl)
            .map_err(|e| Self::map_sdk_err(path, e))?;
        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .presigned(config)
            .await
            .map_err(|e| Self::map_sdk_err(path, e))?;
        Ok(presigned.uri().to_string())
    }

    async fn list_objects(&self, prefix: &str, max_keys: usize) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation_token.take())
                .send()
                .await
                .map_err(|e| Self::map_sdk_err(prefix, e))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                    if keys.len() >= max_keys {
                        return Ok(keys);
                    }
                }
            }

            match response.next_continuation_token() {
                Some(token) => continuation_token = Some(token.to_string()),
                None => break,
            }
        }
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let keys = self.list_objects(prefix, usize::MAX).await?;
        for chunk in keys.chunks(MAX_KEYS_PER_DELETE) {
            let mut identifiers = Vec::with_capacity(chunk.len());
            for key in chunk {
                identifiers.push(
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|e| Self::map_sdk_err(key, e))?,
                );
            }
            self.client
                .delete_objects()
                .bucket(&self.bucket)
                .delete(
                    Delete::builder()
                        .set_objects(Some(identifiers))
                        .build()
                        .map_err(|e| Self::map_sdk_err(prefix, e))?,
                )
                .send()
                .await
                .map_err(|e| Self::map_sdk_err(prefix, e))?;
        }
        Ok(())
    }
}
