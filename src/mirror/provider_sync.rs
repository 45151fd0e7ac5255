//! Per-configuration provider sync.
//!
//! Filter combinations decide the `(namespace, provider)` targets:
//! neither filter set fails the run, a namespace alone fails the run
//! (enumeration is unsupported), a provider alone defaults the namespace
//! to `hashicorp`, and both iterate the Cartesian product. Per-item
//! failures are counted and logged, never fatal to the run.

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{BaliseError, Result};
use crate::persist::MirrorStore;
use crate::storage::StorageBackend;
use crate::types::{
    MirrorConfiguration, MirroredProvider, MirroredProviderVersion, ProviderVersion,
    ProviderVersionPlatform,
};
use crate::version::{PlatformFilter, VersionFilter};
use super::upstream::{HttpClient, PackageInfo, RegistryClient, UpstreamVersion};
use super::{shasums, SyncOutcome};

/// Run one provider mirror configuration to completion.
pub async fn sync_configuration(
    store: &dyn MirrorStore,
    storage: &dyn StorageBackend,
    http: &HttpClient,
    config: &MirrorConfiguration,
) -> SyncOutcome {
    let registry = RegistryClient::new(http.clone(), &config.upstream_url);
    let providers_base = match registry.discover().await {
        Ok(base) => base,
        Err(e) => return SyncOutcome::failed(e.to_string()),
    };

    let targets = match sync_targets(config) {
        Ok(targets) => targets,
        Err(e) => return SyncOutcome::failed(e.to_string()),
    };

    let mut outcome = SyncOutcome::default();
    let mut provider_reports = Vec::new();
    for (namespace, name) in targets {
        match sync_provider(store, storage, &registry, &providers_base, config, &namespace, &name).await {
            Ok((synced, failed)) => {
                outcome.providers_synced += 1;
                outcome.versions_synced += synced;
                outcome.versions_failed += failed;
                provider_reports.push(serde_json::json!({
                    "provider": format!("{namespace}/{name}"),
                    "versions_synced": synced,
                    "versions_failed": failed,
                }));
            }
            Err(e) => {
                tracing::warn!(
                    provider = %format!("{namespace}/{name}"),
                    error = %e,
                    "Provider sync failed"
                );
                outcome.providers_failed += 1;
                provider_reports.push(serde_json::json!({
                    "provider": format!("{namespace}/{name}"),
                    "error": e.to_string(),
                }));
            }
        }
    }
    outcome.details = serde_json::json!({ "providers": provider_reports });
    outcome
}

/// `(namespace, provider)` combinations derived from the filters.
fn sync_targets(config: &MirrorConfiguration) -> Result<Vec<(String, String)>> {
    let namespaces = split_filter(config.namespace_filter.as_deref());
    let providers = split_filter(config.provider_filter.as_deref());

    match (namespaces.is_empty(), providers.is_empty()) {
        (true, true) => Err(BaliseError::sync("full registry mirroring not yet implemented")),
        (false, true) => Err(BaliseError::sync("provider enumeration not yet implemented")),
        (true, false) => Ok(providers
            .into_iter()
            .map(|p| ("hashicorp".to_string(), p))
            .collect()),
        (false, false) => {
            let mut targets = Vec::with_capacity(namespaces.len() * providers.len());
            for namespace in &namespaces {
                for provider in &providers {
                    targets.push((namespace.clone(), provider.clone()));
                }
            }
            Ok(targets)
        }
    }
}

fn split_filter(filter: Option<&str>) -> Vec<String> {
    filter
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Sync one `(namespace, provider)`; returns `(versions_synced,
/// versions_failed)`.
async fn sync_provider(
    store: &dyn MirrorStore,
    storage: &dyn StorageBackend,
    registry: &RegistryClient,
    providers_base: &str,
    config: &MirrorConfiguration,
    namespace: &str,
    name: &str,
) -> Result<(u32, u32)> {
    let upstream_versions = registry.list_versions(providers_base, namespace, name).await?;
    let version_strings: Vec<String> =
        upstream_versions.iter().map(|v| v.version.clone()).collect();

    let filter = VersionFilter::parse(config.version_filter.as_deref());
    let matching = filter.apply(&version_strings);
    if matching.is_empty() {
        return Err(BaliseError::sync(format!(
            "no versions of {namespace}/{name} match filter '{}' ({} upstream versions available)",
            config.version_filter.as_deref().unwrap_or(""),
            version_strings.len()
        )));
    }

    let provider = store
        .ensure_provider(
            namespace,
            name,
            &format!("Mirrored from {}", config.upstream_url),
            &config.upstream_url,
        )
        .await?;
    let tracked = store
        .ensure_mirrored_provider(config.id, provider.id, namespace, name)
        .await?;

    // Index of versions already stored locally.
    let local_versions = store.list_provider_versions(provider.id).await?;
    let platform_filter = PlatformFilter::parse(config.platform_filter.as_deref());

    let mut synced = 0u32;
    let mut failed = 0u32;
    for version in &matching {
        let Some(upstream) = upstream_versions.iter().find(|v| &v.version == version) else {
            continue;
        };

        if let Some(local) = local_versions.iter().find(|v| &v.version == version) {
            // Already mirrored: only backfill a missing tracking row.
            if !store.mirrored_version_exists(tracked.id, version).await? {
                tracing::warn!(
                    provider = %format!("{namespace}/{name}"),
                    version = %version,
                    "Backfilling missing mirror tracking row"
                );
                store
                    .create_mirrored_version(MirroredProviderVersion {
                        id: Uuid::new_v4(),
                        mirrored_provider_id: tracked.id,
                        version_id: local.id,
                        upstream_version: version.clone(),
                        shasum_verified: false,
                        gpg_verified: false,
                    })
                    .await?;
            }
            continue;
        }

        match sync_version(
            store,
            storage,
            registry,
            providers_base,
            &tracked,
            namespace,
            name,
            upstream,
            &platform_filter,
        )
        .await
        {
            Ok(()) => synced += 1,
            Err(e) => {
                tracing::warn!(
                    provider = %format!("{namespace}/{name}"),
                    version = %version,
                    error = %e,
                    "Version sync failed"
                );
                failed += 1;
            }
        }
    }

    store
        .update_mirrored_provider_sync(tracked.id, Utc::now(), matching.first().cloned())
        .await?;

    Ok((synced, failed))
}

/// Download and store one upstream version.
#[allow(clippy::too_many_arguments)]
async fn sync_version(
    store: &dyn MirrorStore,
    storage: &dyn StorageBackend,
    registry: &RegistryClient,
    providers_base: &str,
    tracked: &MirroredProvider,
    namespace: &str,
    name: &str,
    upstream: &UpstreamVersion,
    platform_filter: &PlatformFilter,
) -> Result<()> {
    let first_platform = upstream.platforms.first().ok_or_else(|| {
        BaliseError::sync(format!("upstream lists no platforms for {}", upstream.version))
    })?;
    let info = registry
        .package_info(
            providers_base,
            namespace,
            name,
            &upstream.version,
            &first_platform.os,
            &first_platform.arch,
        )
        .await?;

    // SHA256SUMS and, when keys are published, its signature.
    let mut sums = std::collections::BTreeMap::new();
    let mut sums_bytes: Option<bytes::Bytes> = None;
    if let Some(sums_url) = &info.shasums_url {
        match registry.fetch_bytes(sums_url).await {
            Ok(bytes) => {
                sums = shasums::parse(&String::from_utf8_lossy(&bytes));
                sums_bytes = Some(bytes);
            }
            Err(e) => {
                tracing::warn!(version = %upstream.version, error = %e, "SHA256SUMS download failed");
            }
        }
    }
    let shasum_verified = sums_bytes.is_some();

    let armored_keys: Vec<String> = info
        .signing_keys
        .as_ref()
        .map(|keys| {
            keys.gpg_public_keys
                .iter()
                .filter_map(|k| k.ascii_armor.clone())
                .collect()
        })
        .unwrap_or_default();
    let mut gpg_verified = false;
    if !armored_keys.is_empty() {
        if let (Some(signature_url), Some(sums_bytes)) = (&info.shasums_signature_url, &sums_bytes) {
            match registry.fetch_bytes(signature_url).await {
                Ok(signature) => {
                    match shasums::verify_detached(sums_bytes, &signature, &armored_keys) {
                        Ok(verified) => gpg_verified = verified,
                        Err(e) => {
                            tracing::warn!(version = %upstream.version, error = %e, "GPG verification failed");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(version = %upstream.version, error = %e, "SHA256SUMS signature download failed");
                }
            }
        }
    }

    let version_row = ProviderVersion {
        id: Uuid::new_v4(),
        provider_id: tracked.provider_id,
        version: upstream.version.clone(),
        protocols: if info.protocols.is_empty() {
            upstream.protocols.clone()
        } else {
            info.protocols.clone()
        },
        gpg_key_id: info
            .signing_keys
            .as_ref()
            .and_then(|keys| keys.gpg_public_keys.first())
            .and_then(|k| k.key_id.clone()),
        shasums_url: info.shasums_url.clone(),
        shasums_signature_url: info.shasums_signature_url.clone(),
    };
    store.create_provider_version(version_row.clone()).await?;

    let mut platforms_synced = 0u32;
    for platform in &upstream.platforms {
        if !platform_filter.matches(&platform.os, &platform.arch) {
            continue;
        }
        match sync_platform_binary(
            store,
            storage,
            registry,
            providers_base,
            namespace,
            name,
            &version_row,
            &platform.os,
            &platform.arch,
            &sums,
        )
        .await
        {
            Ok(()) => platforms_synced += 1,
            Err(e) => {
                tracing::warn!(
                    version = %upstream.version,
                    platform = %format!("{}/{}", platform.os, platform.arch),
                    error = %e,
                    "Platform sync failed"
                );
            }
        }
    }

    if platforms_synced == 0 {
        // Nothing usable was stored (download failures or a filter that
        // excluded every platform); drop the empty version row.
        store.delete_provider_version(version_row.id).await?;
        return Err(BaliseError::sync(format!(
            "no platforms downloaded for {}",
            upstream.version
        )));
    }

    store
        .create_mirrored_version(MirroredProviderVersion {
            id: Uuid::new_v4(),
            mirrored_provider_id: tracked.id,
            version_id: version_row.id,
            upstream_version: upstream.version.clone(),
            shasum_verified,
            gpg_verified,
        })
        .await?;

    Ok(())
}

/// Download, verify, and store one platform binary.
#[allow(clippy::too_many_arguments)]
async fn sync_platform_binary(
    store: &dyn MirrorStore,
    storage: &dyn StorageBackend,
    registry: &RegistryClient,
    providers_base: &str,
    namespace: &str,
    name: &str,
    version: &ProviderVersion,
    os: &str,
    arch: &str,
    sums: &std::collections::BTreeMap<String, String>,
) -> Result<()> {
    let info: PackageInfo = registry
        .package_info(providers_base, namespace, name, &version.version, os, arch)
        .await?;

    let body = registry.fetch_bytes(&info.download_url).await?;
    let actual = hex::encode(Sha256::digest(&body));

    let expected = sums
        .get(&info.filename)
        .cloned()
        .or_else(|| info.shasum.clone());
    if let Some(expected) = expected {
        let expected = expected.to_ascii_lowercase();
        if expected != actual {
            return Err(BaliseError::ChecksumMismatch {
                filename: info.filename.clone(),
                expected,
                actual,
            });
        }
    }

    let path = format!(
        "providers/{namespace}/{name}/{}/{os}/{arch}/{}",
        version.version, info.filename
    );
    let stored = storage.upload_bytes(&path, body).await?;

    store
        .create_version_platform(ProviderVersionPlatform {
            id: Uuid::new_v4(),
            version_id: version.id,
            os: os.to_string(),
            arch: arch.to_string(),
            filename: info.filename,
            storage_path: stored.path,
            size: stored.stored_size,
            sha256: stored.sha256_hex,
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalStorageOptions;
    use crate::persist::MemoryStore;
    use crate::storage::LocalFsBackend;
    use crate::types::SyncStatus;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config_for(upstream: &str) -> MirrorConfiguration {
        MirrorConfiguration {
            id: Uuid::new_v4(),
            name: "test".into(),
            upstream_url: upstream.to_string(),
            namespace_filter: Some("hashicorp".into()),
            provider_filter: Some("null".into()),
            version_filter: None,
            platform_filter: None,
            interval_minutes: 60,
            enabled: true,
            last_sync_at: None,
            last_sync_status: SyncStatus::Idle,
        }
    }

    fn storage_in(dir: &tempfile::TempDir) -> LocalFsBackend {
        LocalFsBackend::new(&LocalStorageOptions {
            base_path: dir.path().to_string_lossy().into_owned(),
            serve_directly: false,
        })
        .unwrap()
    }

    async fn mount_upstream(server: &MockServer, body: &'static [u8]) {
        let digest = hex::encode(Sha256::digest(body));
        mount_upstream_with_sums_digest(server, body, digest).await;
    }

    async fn mount_upstream_with_sums_digest(
        server: &MockServer,
        body: &'static [u8],
        sums_digest: String,
    ) {
        let digest = hex::encode(Sha256::digest(body));
        Mock::given(method("GET"))
            .and(path("/.well-known/terraform.json"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"providers.v1": "/v1/providers/"})),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/providers/hashicorp/null/versions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "versions": [
                    {"version": "1.0.0", "protocols": ["5.0"], "platforms": [
                        {"os": "linux", "arch": "amd64"}
                    ]}
                ]
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/providers/hashicorp/null/1.0.0/download/linux/amd64"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "download_url": format!("{}/artifacts/terraform-provider-null_1.0.0_linux_amd64.zip", server.uri()),
                "filename": "terraform-provider-null_1.0.0_linux_amd64.zip",
                "shasums_url": format!("{}/artifacts/SHA256SUMS", server.uri()),
                "shasums_signature_url": null,
                "shasum": digest,
                "protocols": ["5.0"],
                "signing_keys": {"gpg_public_keys": []}
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/artifacts/SHA256SUMS"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "{sums_digest}  terraform-provider-null_1.0.0_linux_amd64.zip\n"
            )))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/artifacts/terraform-provider-null_1.0.0_linux_amd64.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn full_sync_stores_binary_and_tracking_rows() {
        let server = MockServer::start().await;
        mount_upstream(&server, b"provider binary bytes").await;
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);
        let config = config_for(&server.uri());

        let outcome =
            sync_configuration(&store, &storage, &HttpClient::default(), &config).await;

        assert!(outcome.error.is_none(), "outcome: {outcome:?}");
        assert_eq!(outcome.providers_synced, 1);
        assert_eq!(outcome.versions_synced, 1);
        assert_eq!(outcome.versions_failed, 0);
        assert_eq!(store.provider_versions.len(), 1);
        assert_eq!(store.mirrored_versions.len(), 1);
        let tracked = store.mirrored_versions.iter().next().unwrap().clone();
        assert!(tracked.shasum_verified);
        assert!(!tracked.gpg_verified);
        assert!(storage
            .exists("providers/hashicorp/null/1.0.0/linux/amd64/terraform-provider-null_1.0.0_linux_amd64.zip")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn rerunning_a_successful_sync_is_idempotent() {
        let server = MockServer::start().await;
        mount_upstream(&server, b"provider binary bytes").await;
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);
        let config = config_for(&server.uri());

        let first = sync_configuration(&store, &storage, &HttpClient::default(), &config).await;
        assert!(first.error.is_none());
        let versions_after_first = store.provider_versions.len();
        let tracking_after_first = store.mirrored_versions.len();
        let objects_after_first = storage.list_objects("providers/", 100).await.unwrap();

        let second = sync_configuration(&store, &storage, &HttpClient::default(), &config).await;
        assert!(second.error.is_none());
        assert_eq!(second.versions_synced, 0);
        assert_eq!(store.provider_versions.len(), versions_after_first);
        assert_eq!(store.mirrored_versions.len(), tracking_after_first);
        assert_eq!(
            storage.list_objects("providers/", 100).await.unwrap(),
            objects_after_first
        );
    }

    #[tokio::test]
    async fn sha_mismatch_fails_the_platform_and_stores_nothing() {
        let server = MockServer::start().await;
        // SUMS declares a digest the downloaded bytes cannot hash to.
        mount_upstream_with_sums_digest(
            &server,
            b"provider binary bytes",
            "1111111111111111111111111111111111111111111111111111111111111111".to_string(),
        )
        .await;

        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);
        let config = config_for(&server.uri());

        let outcome = sync_configuration(&store, &storage, &HttpClient::default(), &config).await;

        // The version failed and no object was uploaded.
        assert_eq!(outcome.versions_failed, 1);
        assert_eq!(outcome.versions_synced, 0);
        assert!(storage.list_objects("providers/", 100).await.unwrap().is_empty());
        // The failed version row was deleted.
        assert_eq!(store.provider_versions.len(), 0);
    }

    #[tokio::test]
    async fn filter_combinations_fail_with_the_documented_messages() {
        let mut config = config_for("https://unused.example.com");
        config.namespace_filter = None;
        config.provider_filter = None;
        assert_eq!(
            sync_targets(&config).unwrap_err().to_string(),
            "Mirror sync failed: full registry mirroring not yet implemented"
        );

        config.namespace_filter = Some("hashicorp".into());
        assert_eq!(
            sync_targets(&config).unwrap_err().to_string(),
            "Mirror sync failed: provider enumeration not yet implemented"
        );

        config.namespace_filter = None;
        config.provider_filter = Some("aws".into());
        assert_eq!(
            sync_targets(&config).unwrap(),
            vec![("hashicorp".to_string(), "aws".to_string())]
        );

        config.namespace_filter = Some("acme,globex".into());
        config.provider_filter = Some("aws,null".into());
        let targets = sync_targets(&config).unwrap();
        assert_eq!(targets.len(), 4);
        assert!(targets.contains(&("globex".to_string(), "null".to_string())));
    }

    #[tokio::test]
    async fn platform_filter_excluding_everything_fails_the_version() {
        let server = MockServer::start().await;
        mount_upstream(&server, b"provider binary bytes").await;
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let storage = storage_in(&dir);
        let mut config = config_for(&server.uri());
        config.platform_filter = Some(r#"["windows/amd64"]"#.to_string());

        let outcome = sync_configuration(&store, &storage, &HttpClient::default(), &config).await;
        assert_eq!(outcome.versions_failed, 1);
        assert_eq!(store.provider_versions.len(), 0);
    }
}
