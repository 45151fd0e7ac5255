//! CLI binary mirroring (terraform / opentofu).
//!
//! Differs from provider mirroring in three ways: version and platform
//! rows are upserted as `pending` metadata before any download, which
//! makes per-platform retries cheap on reruns; a platform whose artifact
//! is already stored is marked synced without re-downloading; and after a
//! run the greatest stable synced version gets the `is_latest` flag in a
//! single atomic update.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::error::{BaliseError, Result};
use crate::persist::BinaryMirrorStore;
use crate::storage::StorageBackend;
use crate::types::{BinaryMirrorConfig, BinarySyncStatus, BinaryVersion};
use crate::version::{compare, is_stable, PlatformFilter, VersionFilter};
use super::upstream::{HttpClient, ReleasesClient, ReleaseVersion};
use super::{shasums, SyncOutcome};

/// Run one CLI-binary mirror configuration to completion.
pub async fn sync_binary_config(
    store: &dyn BinaryMirrorStore,
    storage: &dyn StorageBackend,
    http: &HttpClient,
    config: &BinaryMirrorConfig,
    verify_keys: &HashMap<String, String>,
) -> SyncOutcome {
    let product = config.tool.product();
    let releases = ReleasesClient::new(http.clone(), &config.upstream_url, product);
    let mut index = match releases.index().await {
        Ok(index) => index,
        Err(e) => return SyncOutcome::failed(e.to_string()),
    };
    index.sort_by(|a, b| compare(&a.version, &b.version));

    let all_versions: Vec<String> = index.iter().map(|v| v.version.clone()).collect();
    let filter = VersionFilter::parse(config.version_filter.as_deref());
    let matching = filter.apply(&all_versions);
    if matching.is_empty() {
        return SyncOutcome::failed(format!(
            "no {product} versions match filter '{}' ({} upstream versions available)",
            config.version_filter.as_deref().unwrap_or(""),
            all_versions.len()
        ));
    }
    let platform_filter = PlatformFilter::parse(config.platform_filter.as_deref());

    // First pass: upsert metadata so later passes and reruns are cheap.
    let mut planned: Vec<(BinaryVersion, ReleaseVersion)> = Vec::new();
    for version in &matching {
        let Some(release) = index.iter().find(|v| &v.version == version) else {
            continue;
        };
        let row = match store.upsert_binary_version(config.id, version).await {
            Ok(row) => row,
            Err(e) => {
                tracing::error!(version = %version, error = %e, "Failed to upsert version row");
                continue;
            }
        };
        for build in &release.builds {
            if !platform_filter.matches(&build.os, &build.arch) {
                continue;
            }
            if let Err(e) = store
                .upsert_binary_platform(
                    row.id,
                    &build.os,
                    &build.arch,
                    &build.url,
                    &build.filename,
                    storage.name(),
                )
                .await
            {
                tracing::error!(
                    version = %version,
                    platform = %format!("{}/{}", build.os, build.arch),
                    error = %e,
                    "Failed to upsert platform row"
                );
            }
        }
        planned.push((row, release.clone()));
    }

    // Second pass: download.
    let mut outcome = SyncOutcome::default();
    let mut version_reports = Vec::new();
    for (row, release) in planned {
        match sync_binary_version(store, storage, &releases, config, verify_keys, &row).await {
            Ok(status) => {
                match status {
                    BinarySyncStatus::Failed => outcome.versions_failed += 1,
                    _ => outcome.versions_synced += 1,
                }
                version_reports.push(serde_json::json!({
                    "version": release.version,
                    "status": status.as_str(),
                }));
            }
            Err(e) => {
                outcome.versions_failed += 1;
                tracing::warn!(version = %release.version, error = %e, "Binary version sync failed");
                version_reports.push(serde_json::json!({
                    "version": release.version,
                    "error": e.to_string(),
                }));
            }
        }
    }
    outcome.details = serde_json::json!({ "tool": product, "versions": version_reports });

    if let Err(e) = update_latest(store, config).await {
        tracing::error!(config_id = %config.id, error = %e, "Failed to update latest version flag");
    }

    outcome
}

/// Sync one version's platforms; returns the aggregate status.
async fn sync_binary_version(
    store: &dyn BinaryMirrorStore,
    storage: &dyn StorageBackend,
    releases: &ReleasesClient,
    config: &BinaryMirrorConfig,
    verify_keys: &HashMap<String, String>,
    version: &BinaryVersion,
) -> Result<BinarySyncStatus> {
    store
        .set_binary_version_status(version.id, BinarySyncStatus::Syncing)
        .await?;

    let sums_text = match releases.shasums(&version.version).await {
        Ok(text) => text,
        Err(e) => {
            store
                .set_binary_version_status(version.id, BinarySyncStatus::Failed)
                .await?;
            return Err(BaliseError::sync(format!(
                "SHA256SUMS for {} unavailable: {e}",
                version.version
            )));
        }
    };
    let sums = shasums::parse(&sums_text);

    let mut sums_gpg_verified = false;
    if config.gpg_verify {
        if let Some(armor) = verify_keys.get(config.tool.product()) {
            match releases.shasums_signature(&version.version).await {
                Ok(signature) => {
                    match shasums::verify_detached(sums_text.as_bytes(), &signature, &[armor.clone()]) {
                        Ok(verified) => sums_gpg_verified = verified,
                        Err(e) => {
                            tracing::warn!(version = %version.version, error = %e, "SUMS GPG verification failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(version = %version.version, error = %e, "SHA256SUMS.sig download failed");
                }
            }
        }
    }
    store
        .set_binary_version_sums_verified(version.id, sums_gpg_verified)
        .await?;

    let platforms = store.list_binary_platforms(version.id).await?;
    let mut succeeded = 0usize;
    let mut failed = 0usize;
    for mut platform in platforms {
        // Idempotent re-entry: a stored artifact that still exists needs
        // no download.
        if let Some(storage_key) = &platform.storage_key {
            if storage.exists(storage_key).await.unwrap_or(false) {
                platform.sync_status = BinarySyncStatus::Synced;
                store.update_binary_platform(platform).await?;
                succeeded += 1;
                continue;
            }
        }

        let body = match releases.fetch_bytes(&platform.upstream_url).await {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!(
                    version = %version.version,
                    platform = %format!("{}/{}", platform.os, platform.arch),
                    error = %e,
                    "Binary download failed"
                );
                platform.sync_status = BinarySyncStatus::Failed;
                store.update_binary_platform(platform).await?;
                failed += 1;
                continue;
            }
        };

        let actual = hex::encode(Sha256::digest(&body));
        if let Some(expected) = sums.get(&platform.filename) {
            if *expected != actual {
                tracing::warn!(
                    version = %version.version,
                    filename = %platform.filename,
                    expected = %expected,
                    actual = %actual,
                    "Checksum mismatch"
                );
                platform.sync_status = BinarySyncStatus::Failed;
                platform.sha256_verified = false;
                store.update_binary_platform(platform).await?;
                failed += 1;
                continue;
            }
        }

        let path = format!(
            "terraform-binaries/{}/{}/{}/{}",
            version.version, platform.os, platform.arch, platform.filename
        );
        match storage.upload_bytes(&path, body).await {
            Ok(stored) => {
                platform.storage_key = Some(stored.path);
                platform.sha256_verified = true;
                platform.gpg_verified = sums_gpg_verified;
                platform.sync_status = BinarySyncStatus::Synced;
                store.update_binary_platform(platform).await?;
                succeeded += 1;
            }
            Err(e) => {
                tracing::warn!(
                    version = %version.version,
                    platform = %format!("{}/{}", platform.os, platform.arch),
                    error = %e,
                    "Binary upload failed"
                );
                platform.sync_status = BinarySyncStatus::Failed;
                store.update_binary_platform(platform).await?;
                failed += 1;
            }
        }
    }

    let aggregate = if failed == 0 && succeeded > 0 {
        BinarySyncStatus::Synced
    } else if succeeded == 0 {
        BinarySyncStatus::Failed
    } else {
        BinarySyncStatus::Partial
    };
    store.set_binary_version_status(version.id, aggregate).await?;
    Ok(aggregate)
}

/// Mark the greatest stable synced version as latest.
async fn update_latest(store: &dyn BinaryMirrorStore, config: &BinaryMirrorConfig) -> Result<()> {
    let versions = store.list_binary_versions(config.id).await?;
    let latest = versions
        .iter()
        .filter(|v| v.sync_status == BinarySyncStatus::Synced && is_stable(&v.version))
        .max_by(|a, b| compare(&a.version, &b.version));
    if let Some(latest) = latest {
        store.set_latest_binary_version(config.id, latest.id).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalStorageOptions;
    use crate::persist::MemoryStore;
    use crate::storage::LocalFsBackend;
    use crate::types::MirrorTool;
    use serde_json::json;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(upstream: &str) -> BinaryMirrorConfig {
        BinaryMirrorConfig {
            id: Uuid::new_v4(),
            tool: MirrorTool::Terraform,
            upstream_url: upstream.to_string(),
            gpg_verify: false,
            platform_filter: Some(r#"["linux/amd64"]"#.to_string()),
            version_filter: None,
            interval_minutes: 60,
            enabled: true,
            last_sync_at: None,
        }
    }

    fn storage_in(dir: &tempfile::TempDir) -> LocalFsBackend {
        LocalFsBackend::new(&LocalStorageOptions {
            base_path: dir.path().to_string_lossy().into_owned(),
            serve_directly: false,
        })
        .unwrap()
    }

    async fn mount_release(server: &MockServer, version: &str, body: &'static [u8]) {
        let digest = hex::encode(Sha256::digest(body));
        let filename = format!("terraform_{version}_linux_amd64.zip");
        Mock::given(method("GET"))
            .and(path(format!("/terraform/{version}/terraform_{version}_SHA256SUMS")))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!("{digest}  {filename}\n")))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/artifacts/{filename}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    async fn mount_index(server: &MockServer, versions: &[&str]) {
        let mut version_map = serde_json::Map::new();
        for version in versions {
            version_map.insert(
                (*version).to_string(),
                json!({
                    "version": version,
                    "builds": [
                        {
                            "os": "linux", "arch": "amd64",
                            "filename": format!("terraform_{version}_linux_amd64.zip"),
                            "url": format!("{}/artifacts/terraform_{version}_linux_amd64.zip", server.uri()),
                        },
                        {
                            "os": "windows", "arch": "386",
                            "filename": format!("terraform_{version}_windows_386.zip"),
                            "url": format!("{}/artifacts/terraform_{version}_windows_386.zip", server.uri()),
                        }
                    ]
                }),
            );
        }
        Mock::given(method("GET"))
            .and(path("/terraform/index.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "terraform",
                "versions": version_map,
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn full_run_stores_binaries_and_flags_latest() {
        let server = MockServer::start().await;
        mount_index(&server, &["1.5.0", "1.6.0", "1.7.0-beta1"]).await;
        mount_release(&server, "1.5.0", b"one-five").await;
        mount_release(&server, "1.6.0", b"one-six").await;
        mount_release(&server, "1.7.0-beta1", b"beta").await;

        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);
        let config = config_for(&server.uri());

        let outcome = sync_binary_config(
            &store,
            &storage,
            &HttpClient::default(),
            &config,
            &HashMap::new(),
        )
        .await;

        assert!(outcome.error.is_none(), "outcome: {outcome:?}");
        assert_eq!(outcome.versions_synced, 3);
        assert!(storage
            .exists("terraform-binaries/1.6.0/linux/amd64/terraform_1.6.0_linux_amd64.zip")
            .await
            .unwrap());

        // The pre-release is synced but never latest.
        let versions = store.list_binary_versions(config.id).await.unwrap();
        let latest: Vec<_> = versions.iter().filter(|v| v.is_latest).collect();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].version, "1.6.0");
    }

    #[tokio::test]
    async fn platform_filter_limits_rows_to_matching_builds() {
        let server = MockServer::start().await;
        mount_index(&server, &["1.6.0"]).await;
        mount_release(&server, "1.6.0", b"one-six").await;

        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);
        let config = config_for(&server.uri());

        sync_binary_config(&store, &storage, &HttpClient::default(), &config, &HashMap::new()).await;

        // Only linux/amd64 passed the filter; windows/386 has no row.
        assert_eq!(store.binary_platforms.len(), 1);
        let row = store.binary_platforms.iter().next().unwrap().clone();
        assert_eq!((row.os.as_str(), row.arch.as_str()), ("linux", "amd64"));
        assert!(row.sha256_verified);
        assert_eq!(row.sync_status, BinarySyncStatus::Synced);
    }

    #[tokio::test]
    async fn rerun_skips_platforms_whose_artifact_exists() {
        let server = MockServer::start().await;
        mount_index(&server, &["1.6.0"]).await;
        mount_release(&server, "1.6.0", b"one-six").await;

        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);
        let config = config_for(&server.uri());

        sync_binary_config(&store, &storage, &HttpClient::default(), &config, &HashMap::new()).await;

        // Replace the artifact mock with a failing one; the rerun must
        // not need it.
        server.reset().await;
        mount_index(&server, &["1.6.0"]).await;
        Mock::given(method("GET"))
            .and(path("/terraform/1.6.0/terraform_1.6.0_SHA256SUMS"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ignored"))
            .mount(&server)
            .await;

        let outcome = sync_binary_config(
            &store,
            &storage,
            &HttpClient::default(),
            &config,
            &HashMap::new(),
        )
        .await;
        assert!(outcome.error.is_none());
        assert_eq!(outcome.versions_synced, 1);
        let row = store.binary_platforms.iter().next().unwrap().clone();
        assert_eq!(row.sync_status, BinarySyncStatus::Synced);
    }

    #[tokio::test]
    async fn checksum_mismatch_marks_the_platform_failed() {
        let server = MockServer::start().await;
        mount_index(&server, &["1.6.0"]).await;
        let filename = "terraform_1.6.0_linux_amd64.zip";
        Mock::given(method("GET"))
            .and(path("/terraform/1.6.0/terraform_1.6.0_SHA256SUMS"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "2222222222222222222222222222222222222222222222222222222222222222  {filename}\n"
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/artifacts/{filename}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
            .mount(&server)
            .await;

        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);
        let config = config_for(&server.uri());

        let outcome = sync_binary_config(
            &store,
            &storage,
            &HttpClient::default(),
            &config,
            &HashMap::new(),
        )
        .await;
        assert_eq!(outcome.versions_failed, 1);
        let row = store.binary_platforms.iter().next().unwrap().clone();
        assert_eq!(row.sync_status, BinarySyncStatus::Failed);
        assert!(row.storage_key.is_none());
        assert!(storage
            .list_objects("terraform-binaries/", 10)
            .await
            .unwrap()
            .is_empty());
    }
}
