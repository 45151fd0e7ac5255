//! Persistence contracts.
//!
//! The relational layer is an external collaborator; these traits are the
//! interfaces the engine and gateway consume. [`MemoryStore`] is a
//! process-local implementation backing the standalone binary and the
//! test-suite. Sync history rows are append-only and identifiers are never
//! reused, no matter the implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{
    ApiKey, AuditEntry, BinaryMirrorConfig, BinarySyncStatus, BinaryVersion,
    BinaryVersionPlatform, MirrorConfiguration, MirroredProvider, MirroredProviderVersion,
    ModuleSourceRepo, ModuleVersion, Organization, OrganizationMember, Provider, ProviderVersion,
    ProviderVersionPlatform, RoleTemplate, ScmProviderRecord, SyncHistory, SyncStatus,
    SystemSettings, User,
};

// =============================================================================
// Contracts
// =============================================================================

/// Users, organizations, and effective scopes.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>>;

    /// Union of scopes across all of the user's organization memberships.
    async fn user_scopes(&self, user_id: Uuid) -> Result<Vec<String>>;
}

/// API keys.
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Candidate keys sharing a cleartext prefix. Prefix lookup keeps the
    /// bcrypt comparisons per request bounded.
    async fn find_keys_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>>;

    async fn touch_last_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Keys expiring at or before `cutoff` that have not been notified.
    async fn expiring_unnotified(&self, cutoff: DateTime<Utc>) -> Result<Vec<ApiKey>>;

    /// Record that the expiry notification went out. Only called after a
    /// successful send, which makes delivery at-most-once.
    async fn mark_notified(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

/// System settings consulted by the setup middleware.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn system_settings(&self) -> Result<SystemSettings>;
    async fn update_system_settings(&self, settings: SystemSettings) -> Result<()>;
}

/// Audit sink. Writes are fire-and-forget from the gateway's view.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn record(&self, entry: AuditEntry) -> Result<()>;
}

/// Provider mirror state.
#[async_trait]
pub trait MirrorStore: Send + Sync {
    async fn due_configurations(&self, now: DateTime<Utc>) -> Result<Vec<MirrorConfiguration>>;
    async fn get_configuration(&self, id: Uuid) -> Result<Option<MirrorConfiguration>>;
    async fn set_configuration_status(
        &self,
        id: Uuid,
        status: SyncStatus,
        last_sync_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn insert_history(&self, history: SyncHistory) -> Result<()>;
    async fn complete_history(&self, history: SyncHistory) -> Result<()>;
    async fn list_history(&self, config_id: Uuid) -> Result<Vec<SyncHistory>>;

    /// Upsert the local provider row a mirror materializes into.
    async fn ensure_provider(
        &self,
        namespace: &str,
        provider_type: &str,
        description: &str,
        source_url: &str,
    ) -> Result<Provider>;

    /// Upsert the tracking link between a mirror and a local provider.
    async fn ensure_mirrored_provider(
        &self,
        mirror_id: Uuid,
        provider_id: Uuid,
        namespace: &str,
        provider_type: &str,
    ) -> Result<MirroredProvider>;

    async fn update_mirrored_provider_sync(
        &self,
        id: Uuid,
        last_synced_at: DateTime<Utc>,
        last_sync_version: Option<String>,
    ) -> Result<()>;

    async fn list_provider_versions(&self, provider_id: Uuid) -> Result<Vec<ProviderVersion>>;
    async fn create_provider_version(&self, version: ProviderVersion) -> Result<()>;
    async fn delete_provider_version(&self, id: Uuid) -> Result<()>;
    async fn create_version_platform(&self, platform: ProviderVersionPlatform) -> Result<()>;

    async fn mirrored_version_exists(
        &self,
        mirrored_provider_id: Uuid,
        upstream_version: &str,
    ) -> Result<bool>;
    async fn create_mirrored_version(&self, version: MirroredProviderVersion) -> Result<()>;
}

/// CLI-binary mirror state.
#[async_trait]
pub trait BinaryMirrorStore: Send + Sync {
    async fn due_binary_configs(&self, now: DateTime<Utc>) -> Result<Vec<BinaryMirrorConfig>>;
    async fn get_binary_config(&self, id: Uuid) -> Result<Option<BinaryMirrorConfig>>;
    async fn touch_binary_config(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Upsert a version row; new rows start `pending`.
    async fn upsert_binary_version(&self, config_id: Uuid, version: &str) -> Result<BinaryVersion>;

    /// Upsert a platform row; new rows start `pending`.
    async fn upsert_binary_platform(
        &self,
        version_id: Uuid,
        os: &str,
        arch: &str,
        upstream_url: &str,
        filename: &str,
        storage_backend: &str,
    ) -> Result<BinaryVersionPlatform>;

    async fn set_binary_version_status(&self, id: Uuid, status: BinarySyncStatus) -> Result<()>;
    async fn set_binary_version_sums_verified(&self, id: Uuid, verified: bool) -> Result<()>;
    async fn list_binary_platforms(&self, version_id: Uuid) -> Result<Vec<BinaryVersionPlatform>>;
    async fn update_binary_platform(&self, platform: BinaryVersionPlatform) -> Result<()>;

    async fn list_binary_versions(&self, config_id: Uuid) -> Result<Vec<BinaryVersion>>;

    /// Atomically mark `version_id` as the latest for its configuration
    /// and clear the flag everywhere else.
    async fn set_latest_binary_version(&self, config_id: Uuid, version_id: Uuid) -> Result<()>;
}

/// Modules and their SCM links, as needed by the tag verifier.
#[async_trait]
pub trait ModuleStore: Send + Sync {
    /// Module versions carrying both a tag name and a commit SHA.
    async fn module_versions_with_tags(&self) -> Result<Vec<ModuleVersion>>;
    async fn module_source_repo(&self, module_id: Uuid) -> Result<Option<ModuleSourceRepo>>;
    async fn scm_provider(&self, id: Uuid) -> Result<Option<ScmProviderRecord>>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

/// Process-local store. Every collection is a concurrent map keyed by id;
/// cross-entity invariants are enforced the same way the contracts
/// describe them.
#[derive(Debug, Default)]
pub struct MemoryStore {
    pub users: DashMap<Uuid, User>,
    pub organizations: DashMap<Uuid, Organization>,
    pub role_templates: DashMap<Uuid, RoleTemplate>,
    pub memberships: DashMap<(Uuid, Uuid), OrganizationMember>,
    pub api_keys: DashMap<Uuid, ApiKey>,
    pub settings: std::sync::RwLock<SystemSettings>,
    pub audit_log: std::sync::Mutex<Vec<AuditEntry>>,

    pub mirror_configs: DashMap<Uuid, MirrorConfiguration>,
    pub sync_history: std::sync::Mutex<Vec<SyncHistory>>,
    pub providers: DashMap<Uuid, Provider>,
    pub mirrored_providers: DashMap<Uuid, MirroredProvider>,
    pub provider_versions: DashMap<Uuid, ProviderVersion>,
    pub version_platforms: DashMap<Uuid, ProviderVersionPlatform>,
    pub mirrored_versions: DashMap<Uuid, MirroredProviderVersion>,

    pub binary_configs: DashMap<Uuid, BinaryMirrorConfig>,
    pub binary_versions: DashMap<Uuid, BinaryVersion>,
    pub binary_platforms: DashMap<Uuid, BinaryVersionPlatform>,

    pub module_versions: DashMap<Uuid, ModuleVersion>,
    pub module_repos: DashMap<Uuid, ModuleSourceRepo>,
    pub scm_providers: DashMap<Uuid, ScmProviderRecord>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_user(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn user_scopes(&self, user_id: Uuid) -> Result<Vec<String>> {
        let mut scopes: Vec<String> = Vec::new();
        for entry in &self.memberships {
            let member = entry.value();
            if member.user_id != user_id {
                continue;
            }
            if let Some(template) = self.role_templates.get(&member.role_template_id) {
                for scope in &template.scopes {
                    if !scopes.contains(scope) {
                        scopes.push(scope.clone());
                    }
                }
            }
        }
        Ok(scopes)
    }
}

#[async_trait]
impl ApiKeyStore for MemoryStore {
    async fn find_keys_by_prefix(&self, prefix: &str) -> Result<Vec<ApiKey>> {
        Ok(self
            .api_keys
            .iter()
            .filter(|k| k.key_prefix == prefix)
            .map(|k| k.clone())
            .collect())
    }

    async fn touch_last_used(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut key) = self.api_keys.get_mut(&id) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn expiring_unnotified(&self, cutoff: DateTime<Utc>) -> Result<Vec<ApiKey>> {
        Ok(self
            .api_keys
            .iter()
            .filter(|k| {
                k.expiry_notification_sent_at.is_none()
                    && k.expires_at.is_some_and(|at| at <= cutoff)
            })
            .map(|k| k.clone())
            .collect())
    }

    async fn mark_notified(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut key) = self.api_keys.get_mut(&id) {
            // Monotonic once set.
            if key.expiry_notification_sent_at.is_none() {
                key.expiry_notification_sent_at = Some(at);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for MemoryStore {
    async fn system_settings(&self) -> Result<SystemSettings> {
        Ok(self.settings.read().expect("settings lock").clone())
    }

    async fn update_system_settings(&self, settings: SystemSettings) -> Result<()> {
        *self.settings.write().expect("settings lock") = settings;
        Ok(())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        self.audit_log.lock().expect("audit lock").push(entry);
        Ok(())
    }
}

#[async_trait]
impl MirrorStore for MemoryStore {
    async fn due_configurations(&self, now: DateTime<Utc>) -> Result<Vec<MirrorConfiguration>> {
        Ok(self
            .mirror_configs
            .iter()
            .filter(|c| c.is_due(now))
            .map(|c| c.clone())
            .collect())
    }

    async fn get_configuration(&self, id: Uuid) -> Result<Option<MirrorConfiguration>> {
        Ok(self.mirror_configs.get(&id).map(|c| c.clone()))
    }

    async fn set_configuration_status(
        &self,
        id: Uuid,
        status: SyncStatus,
        last_sync_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if let Some(mut config) = self.mirror_configs.get_mut(&id) {
            config.last_sync_status = status;
            if let Some(at) = last_sync_at {
                config.last_sync_at = Some(at);
            }
        }
        Ok(())
    }

    async fn insert_history(&self, history: SyncHistory) -> Result<()> {
        self.sync_history.lock().expect("history lock").push(history);
        Ok(())
    }

    async fn complete_history(&self, history: SyncHistory) -> Result<()> {
        let mut rows = self.sync_history.lock().expect("history lock");
        match rows.iter_mut().find(|h| h.id == history.id) {
            Some(row) => *row = history,
            // The running row should exist; recover by appending.
            None => rows.push(history),
        }
        Ok(())
    }

    async fn list_history(&self, config_id: Uuid) -> Result<Vec<SyncHistory>> {
        Ok(self
            .sync_history
            .lock()
            .expect("history lock")
            .iter()
            .filter(|h| h.config_id == config_id)
            .cloned()
            .collect())
    }

    async fn ensure_provider(
        &self,
        namespace: &str,
        provider_type: &str,
        description: &str,
        source_url: &str,
    ) -> Result<Provider> {
        for provider in &self.providers {
            if provider.namespace == namespace && provider.provider_type == provider_type {
                return Ok(provider.clone());
            }
        }
        let provider = Provider {
            id: Uuid::new_v4(),
            namespace: namespace.to_string(),
            provider_type: provider_type.to_string(),
            description: description.to_string(),
            source_url: source_url.to_string(),
        };
        self.providers.insert(provider.id, provider.clone());
        Ok(provider)
    }

    async fn ensure_mirrored_provider(
        &self,
        mirror_id: Uuid,
        provider_id: Uuid,
        namespace: &str,
        provider_type: &str,
    ) -> Result<MirroredProvider> {
        for tracked in &self.mirrored_providers {
            if tracked.mirror_id == mirror_id && tracked.provider_id == provider_id {
                return Ok(tracked.clone());
            }
        }
        let tracked = MirroredProvider {
            id: Uuid::new_v4(),
            mirror_id,
            provider_id,
            upstream_namespace: namespace.to_string(),
            upstream_type: provider_type.to_string(),
            last_synced_at: None,
            last_sync_version: None,
            sync_enabled: true,
        };
        self.mirrored_providers.insert(tracked.id, tracked.clone());
        Ok(tracked)
    }

    async fn update_mirrored_provider_sync(
        &self,
        id: Uuid,
        last_synced_at: DateTime<Utc>,
        last_sync_version: Option<String>,
    ) -> Result<()> {
        if let Some(mut tracked) = self.mirrored_providers.get_mut(&id) {
            tracked.last_synced_at = Some(last_synced_at);
            if last_sync_version.is_some() {
                tracked.last_sync_version = last_sync_version;
            }
        }
        Ok(())
    }

    async fn list_provider_versions(&self, provider_id: Uuid) -> Result<Vec<ProviderVersion>> {
        Ok(self
            .provider_versions
            .iter()
            .filter(|v| v.provider_id == provider_id)
            .map(|v| v.clone())
            .collect())
    }

    async fn create_provider_version(&self, version: ProviderVersion) -> Result<()> {
        self.provider_versions.insert(version.id, version);
        Ok(())
    }

    async fn delete_provider_version(&self, id: Uuid) -> Result<()> {
        self.provider_versions.remove(&id);
        self.version_platforms.retain(|_, p| p.version_id != id);
        Ok(())
    }

    async fn create_version_platform(&self, platform: ProviderVersionPlatform) -> Result<()> {
        self.version_platforms.insert(platform.id, platform);
        Ok(())
    }

    async fn mirrored_version_exists(
        &self,
        mirrored_provider_id: Uuid,
        upstream_version: &str,
    ) -> Result<bool> {
        Ok(self.mirrored_versions.iter().any(|v| {
            v.mirrored_provider_id == mirrored_provider_id && v.upstream_version == upstream_version
        }))
    }

    async fn create_mirrored_version(&self, version: MirroredProviderVersion) -> Result<()> {
        self.mirrored_versions.insert(version.id, version);
        Ok(())
    }
}

#[async_trait]
impl BinaryMirrorStore for MemoryStore {
    async fn due_binary_configs(&self, now: DateTime<Utc>) -> Result<Vec<BinaryMirrorConfig>> {
        Ok(self
            .binary_configs
            .iter()
            .filter(|c| {
                c.enabled
                    && c.last_sync_at.map_or(true, |last| {
                        last + chrono::Duration::minutes(c.interval_minutes) <= now
                    })
            })
            .map(|c| c.clone())
            .collect())
    }

    async fn get_binary_config(&self, id: Uuid) -> Result<Option<BinaryMirrorConfig>> {
        Ok(self.binary_configs.get(&id).map(|c| c.clone()))
    }

    async fn touch_binary_config(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if let Some(mut config) = self.binary_configs.get_mut(&id) {
            config.last_sync_at = Some(at);
        }
        Ok(())
    }

    async fn upsert_binary_version(&self, config_id: Uuid, version: &str) -> Result<BinaryVersion> {
        for row in &self.binary_versions {
            if row.config_id == config_id && row.version == version {
                return Ok(row.clone());
            }
        }
        let row = BinaryVersion {
            id: Uuid::new_v4(),
            config_id,
            version: version.to_string(),
            sync_status: BinarySyncStatus::Pending,
            is_latest: false,
            sums_gpg_verified: false,
        };
        self.binary_versions.insert(row.id, row.clone());
        Ok(row)
    }

    async fn upsert_binary_platform(
        &self,
        version_id: Uuid,
        os: &str,
        arch: &str,
        upstream_url: &str,
        filename: &str,
        storage_backend: &str,
    ) -> Result<BinaryVersionPlatform> {
        for row in &self.binary_platforms {
            if row.version_id == version_id && row.os == os && row.arch == arch {
                return Ok(row.clone());
            }
        }
        let row = BinaryVersionPlatform {
            id: Uuid::new_v4(),
            version_id,
            os: os.to_string(),
            arch: arch.to_string(),
            upstream_url: upstream_url.to_string(),
            filename: filename.to_string(),
            storage_key: None,
            storage_backend: storage_backend.to_string(),
            sha256_verified: false,
            gpg_verified: false,
            sync_status: BinarySyncStatus::Pending,
        };
        self.binary_platforms.insert(row.id, row.clone());
        Ok(row)
    }

    async fn set_binary_version_status(&self, id: Uuid, status: BinarySyncStatus) -> Result<()> {
        if let Some(mut row) = self.binary_versions.get_mut(&id) {
            row.sync_status = status;
        }
        Ok(())
    }

    async fn set_binary_version_sums_verified(&self, id: Uuid, verified: bool) -> Result<()> {
        if let Some(mut row) = self.binary_versions.get_mut(&id) {
            row.sums_gpg_verified = verified;
        }
        Ok(())
    }

    async fn list_binary_platforms(&self, version_id: Uuid) -> Result<Vec<BinaryVersionPlatform>> {
        Ok(self
            .binary_platforms
            .iter()
            .filter(|p| p.version_id == version_id)
            .map(|p| p.clone())
            .collect())
    }

    async fn update_binary_platform(&self, platform: BinaryVersionPlatform) -> Result<()> {
        self.binary_platforms.insert(platform.id, platform);
        Ok(())
    }

    async fn list_binary_versions(&self, config_id: Uuid) -> Result<Vec<BinaryVersion>> {
        Ok(self
            .binary_versions
            .iter()
            .filter(|v| v.config_id == config_id)
            .map(|v| v.clone())
            .collect())
    }

    async fn set_latest_binary_version(&self, config_id: Uuid, version_id: Uuid) -> Result<()> {
        // One pass over the config's rows keeps the flag single-owner.
        for mut row in self.binary_versions.iter_mut() {
            if row.config_id == config_id {
                row.is_latest = row.id == version_id;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ModuleStore for MemoryStore {
    async fn module_versions_with_tags(&self) -> Result<Vec<ModuleVersion>> {
        Ok(self
            .module_versions
            .iter()
            .filter(|v| v.tag_name.is_some() && v.commit_sha.is_some())
            .map(|v| v.clone())
            .collect())
    }

    async fn module_source_repo(&self, module_id: Uuid) -> Result<Option<ModuleSourceRepo>> {
        Ok(self.module_repos.get(&module_id).map(|r| r.clone()))
    }

    async fn scm_provider(&self, id: Uuid) -> Result<Option<ScmProviderRecord>> {
        Ok(self.scm_providers.get(&id).map(|p| p.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn user_scopes_are_the_union_of_memberships() {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let (org_a, org_b) = (Uuid::new_v4(), Uuid::new_v4());
        let reader = RoleTemplate {
            id: Uuid::new_v4(),
            name: "reader".into(),
            scopes: vec!["modules:read".into(), "providers:read".into()],
        };
        let operator = RoleTemplate {
            id: Uuid::new_v4(),
            name: "operator".into(),
            scopes: vec!["providers:read".into(), "mirrors:manage".into()],
        };
        store.role_templates.insert(reader.id, reader.clone());
        store.role_templates.insert(operator.id, operator.clone());
        store.memberships.insert(
            (org_a, user_id),
            OrganizationMember {
                organization_id: org_a,
                user_id,
                role_template_id: reader.id,
            },
        );
        store.memberships.insert(
            (org_b, user_id),
            OrganizationMember {
                organization_id: org_b,
                user_id,
                role_template_id: operator.id,
            },
        );

        let mut scopes = store.user_scopes(user_id).await.unwrap();
        scopes.sort();
        assert_eq!(scopes, vec!["mirrors:manage", "modules:read", "providers:read"]);
    }

    #[tokio::test]
    async fn mark_notified_is_monotonic() {
        let store = MemoryStore::new();
        let id = Uuid::new_v4();
        let now = Utc::now();
        store.api_keys.insert(
            id,
            ApiKey {
                id,
                user_id: None,
                organization_id: None,
                secret_hash: String::new(),
                key_prefix: "blse_abcde".into(),
                name: "k".into(),
                description: String::new(),
                scopes: vec![],
                expires_at: Some(now + chrono::Duration::days(3)),
                last_used_at: None,
                expiry_notification_sent_at: None,
                created_at: now,
            },
        );

        store.mark_notified(id, now).await.unwrap();
        let later = now + chrono::Duration::hours(1);
        store.mark_notified(id, later).await.unwrap();
        let stored = store.api_keys.get(&id).unwrap();
        assert_eq!(stored.expiry_notification_sent_at, Some(now));
    }

    #[tokio::test]
    async fn expiring_unnotified_excludes_notified_keys() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let make = |notified: bool| ApiKey {
            id: Uuid::new_v4(),
            user_id: None,
            organization_id: None,
            secret_hash: String::new(),
            key_prefix: "blse_abcde".into(),
            name: "k".into(),
            description: String::new(),
            scopes: vec![],
            expires_at: Some(now + chrono::Duration::days(2)),
            last_used_at: None,
            expiry_notification_sent_at: notified.then_some(now),
            created_at: now,
        };
        let pending = make(false);
        let done = make(true);
        store.api_keys.insert(pending.id, pending.clone());
        store.api_keys.insert(done.id, done);

        let due = store
            .expiring_unnotified(now + chrono::Duration::days(7))
            .await
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, pending.id);
    }

    #[tokio::test]
    async fn ensure_provider_is_an_upsert() {
        let store = MemoryStore::new();
        let first = store
            .ensure_provider("hashicorp", "aws", "mirrored", "https://upstream")
            .await
            .unwrap();
        let second = store
            .ensure_provider("hashicorp", "aws", "mirrored", "https://upstream")
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.providers.len(), 1);
    }

    #[tokio::test]
    async fn set_latest_is_exclusive_per_config() {
        let store = MemoryStore::new();
        let config_id = Uuid::new_v4();
        let a = store.upsert_binary_version(config_id, "1.5.0").await.unwrap();
        let b = store.upsert_binary_version(config_id, "1.6.0").await.unwrap();

        store.set_latest_binary_version(config_id, a.id).await.unwrap();
        store.set_latest_binary_version(config_id, b.id).await.unwrap();

        let versions = store.list_binary_versions(config_id).await.unwrap();
        let latest: Vec<_> = versions.iter().filter(|v| v.is_latest).collect();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, b.id);
    }
}
