//! Tag-immutability verification.
//!
//! Published module versions record `(tag_name, commit_sha)` at publish
//! time; that pair must hold on every later observation. The verifier
//! periodically re-resolves each tag upstream and emits a violation log
//! record when the commit moved. It never mutates the version row, and
//! it skips silently whenever it cannot check: unlinked modules, missing
//! tag or SHA, credential decryption failure, unreachable upstream.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::crypto::SecretSealer;
use crate::error::Result;
use crate::persist::ModuleStore;
use crate::scm::{build_connector, Connector, ConnectorSettings, ProviderKind};

/// Builds connectors; swapped out in tests.
pub type ConnectorFactory =
    Arc<dyn Fn(ConnectorSettings) -> Result<Box<dyn Connector>> + Send + Sync>;

const DEFAULT_INTERVAL_HOURS: i64 = 24;

pub struct TagVerifier {
    modules: Arc<dyn ModuleStore>,
    sealer: SecretSealer,
    interval: Duration,
    factory: ConnectorFactory,
}

impl TagVerifier {
    #[must_use]
    pub fn new(modules: Arc<dyn ModuleStore>, sealer: SecretSealer, interval_hours: i64) -> Self {
        Self::with_factory(modules, sealer, interval_hours, Arc::new(build_connector))
    }

    #[must_use]
    pub fn with_factory(
        modules: Arc<dyn ModuleStore>,
        sealer: SecretSealer,
        interval_hours: i64,
        factory: ConnectorFactory,
    ) -> Self {
        let interval_hours = if interval_hours <= 0 {
            DEFAULT_INTERVAL_HOURS
        } else {
            interval_hours
        };
        Self {
            modules,
            sealer,
            interval: Duration::from_secs(interval_hours as u64 * 3600),
            factory,
        }
    }

    /// Tick loop; exits on cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs(), "Tag verifier started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    tracing::info!("Tag verifier stopping");
                    break;
                }
                _ = ticker.tick() => {
                    match self.run_once().await {
                        Ok(violations) if violations > 0 => {
                            tracing::warn!(violations, "Tag verification pass found violations");
                        }
                        Ok(_) => tracing::debug!("Tag verification pass clean"),
                        Err(e) => tracing::error!(error = %e, "Tag verification pass failed"),
                    }
                }
            }
        }
    }

    /// One verification pass; returns the number of violations seen.
    pub async fn run_once(&self) -> Result<u32> {
        let mut violations = 0u32;
        for version in self.modules.module_versions_with_tags().await? {
            let (Some(tag_name), Some(recorded_sha)) = (&version.tag_name, &version.commit_sha)
            else {
                continue;
            };

            let Some(repo) = self.modules.module_source_repo(version.module_id).await? else {
                continue;
            };
            let Some(provider) = self.modules.scm_provider(repo.provider_id).await? else {
                continue;
            };

            let secret = match self.sealer.open(&provider.client_secret_sealed) {
                Ok(secret) => secret,
                Err(e) => {
                    tracing::debug!(provider_id = %provider.id, error = %e, "Skipping module: credential decryption failed");
                    continue;
                }
            };
            let Ok(kind) = ProviderKind::parse(&provider.kind) else {
                continue;
            };
            let settings = ConnectorSettings {
                kind: Some(kind),
                instance_base_url: provider.instance_base_url.clone(),
                client_id: Some(provider.client_id.clone()),
                client_secret: Some(secret.clone()),
                callback_url: Some(String::new()),
                tenant_id: provider.tenant_id.clone(),
            };
            let connector = match (self.factory)(settings) {
                Ok(connector) => connector,
                Err(e) => {
                    tracing::debug!(provider_id = %provider.id, error = %e, "Skipping module: connector construction failed");
                    continue;
                }
            };

            let observed = match connector
                .fetch_tag_by_name(&secret, &repo.owner, &repo.name, tag_name)
                .await
            {
                Ok(tag) => tag,
                Err(e) => {
                    tracing::debug!(
                        module_id = %version.module_id,
                        tag = %tag_name,
                        error = %e,
                        "Skipping module: tag lookup failed"
                    );
                    continue;
                }
            };

            if &observed.commit_sha != recorded_sha {
                violations += 1;
                tracing::error!(
                    module_id = %version.module_id,
                    version_id = %version.id,
                    version = %version.version,
                    tag = %tag_name,
                    recorded_sha = %recorded_sha,
                    observed_sha = %observed.commit_sha,
                    "Version immutability violation: tag no longer points at the published commit"
                );
            }
        }
        Ok(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BaliseError;
    use crate::persist::MemoryStore;
    use crate::scm::{
        ArchiveKind, BranchRef, CommitInfo, Page, RemoteRepository, TagRef, WebhookDelivery,
    };
    use crate::types::{AccessToken, ModuleSourceRepo, ModuleVersion, ScmProviderRecord};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::Utc;
    use uuid::Uuid;

    /// Connector double that serves a fixed tag map.
    struct FixedTags {
        tags: std::collections::HashMap<String, String>,
    }

    #[async_trait]
    impl Connector for FixedTags {
        fn platform(&self) -> ProviderKind {
            ProviderKind::GitHub
        }
        fn authorization_endpoint(&self, _: &str, _: &[String]) -> Result<String> {
            unreachable!("not used by the verifier")
        }
        async fn complete_authorization(&self, _: &str) -> Result<AccessToken> {
            unreachable!("not used by the verifier")
        }
        async fn renew_token(&self, _: &str) -> Result<AccessToken> {
            unreachable!("not used by the verifier")
        }
        async fn fetch_repositories(&self, _: &str, _: Page) -> Result<Vec<RemoteRepository>> {
            Ok(vec![])
        }
        async fn fetch_repository(&self, _: &str, owner: &str, name: &str) -> Result<RemoteRepository> {
            Err(BaliseError::RepoNotFound {
                owner: owner.into(),
                name: name.into(),
            })
        }
        async fn search_repositories(&self, _: &str, _: &str, _: Page) -> Result<Vec<RemoteRepository>> {
            Ok(vec![])
        }
        async fn fetch_branches(&self, _: &str, _: &str, _: &str, _: Page) -> Result<Vec<BranchRef>> {
            Ok(vec![])
        }
        async fn fetch_tags(&self, _: &str, _: &str, _: &str, _: Page) -> Result<Vec<TagRef>> {
            Ok(vec![])
        }
        async fn fetch_tag_by_name(&self, _: &str, _: &str, _: &str, tag: &str) -> Result<TagRef> {
            self.tags
                .get(tag)
                .map(|sha| TagRef {
                    name: tag.to_string(),
                    commit_sha: sha.clone(),
                })
                .ok_or_else(|| BaliseError::TagNotFound { tag: tag.to_string() })
        }
        async fn fetch_commit(&self, _: &str, _: &str, _: &str, sha: &str) -> Result<CommitInfo> {
            Err(BaliseError::CommitNotFound { sha: sha.into() })
        }
        async fn download_source_archive(
            &self,
            _: &str,
            _: &str,
            _: &str,
            _: &str,
            _: ArchiveKind,
        ) -> Result<Bytes> {
            Err(BaliseError::ArchiveDownloadFailed {
                message: "not supported".into(),
            })
        }
        async fn register_webhook(&self, _: &str, _: &str, _: &str, _: &str, _: &str) -> Result<String> {
            Err(BaliseError::WebhookCreationFailed {
                message: "not supported".into(),
            })
        }
        async fn remove_webhook(&self, _: &str, _: &str, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        fn parse_delivery(&self, _: &[(String, String)], _: &[u8]) -> Result<WebhookDelivery> {
            Err(BaliseError::PayloadInvalid {
                message: "not supported".into(),
            })
        }
        fn verify_delivery_signature(&self, _: &[(String, String)], _: &[u8], _: &str) -> Result<()> {
            Ok(())
        }
    }

    fn seed(store: &MemoryStore, sealer: &SecretSealer, tag: &str, sha: &str) -> Uuid {
        let module_id = Uuid::new_v4();
        let provider_id = Uuid::new_v4();
        store.scm_providers.insert(
            provider_id,
            ScmProviderRecord {
                id: provider_id,
                kind: "github".into(),
                instance_base_url: None,
                client_id: "client".into(),
                client_secret_sealed: sealer.seal("oauth-secret").unwrap(),
                tenant_id: None,
                webhook_secret: "hook".into(),
            },
        );
        store.module_repos.insert(
            module_id,
            ModuleSourceRepo {
                module_id,
                provider_id,
                owner: "acme".into(),
                name: "vpc".into(),
                default_branch: "main".into(),
                webhook_id: None,
                last_synced_at: None,
                last_sync_commit: None,
            },
        );
        let version_id = Uuid::new_v4();
        store.module_versions.insert(
            version_id,
            ModuleVersion {
                id: version_id,
                module_id,
                version: "1.0.0".into(),
                commit_sha: Some(sha.into()),
                tag_name: Some(tag.into()),
                created_at: Utc::now(),
            },
        );
        module_id
    }

    fn verifier_with_tags(
        store: Arc<MemoryStore>,
        sealer: SecretSealer,
        tags: &[(&str, &str)],
    ) -> TagVerifier {
        let tags: std::collections::HashMap<String, String> = tags
            .iter()
            .map(|(t, s)| ((*t).to_string(), (*s).to_string()))
            .collect();
        TagVerifier::with_factory(
            store,
            sealer,
            24,
            Arc::new(move |_settings| {
                Ok(Box::new(FixedTags { tags: tags.clone() }) as Box<dyn Connector>)
            }),
        )
    }

    #[tokio::test]
    async fn moved_tag_is_a_violation_and_nothing_is_mutated() {
        let store = Arc::new(MemoryStore::new());
        let sealer = SecretSealer::ephemeral();
        seed(&store, &sealer, "v1.0.0", "aaaa");

        let verifier = verifier_with_tags(store.clone(), sealer, &[("v1.0.0", "bbbb")]);
        let violations = verifier.run_once().await.unwrap();
        assert_eq!(violations, 1);

        // The stored version still records the original SHA.
        let stored = store.module_versions.iter().next().unwrap().clone();
        assert_eq!(stored.commit_sha.as_deref(), Some("aaaa"));
    }

    #[tokio::test]
    async fn matching_tag_is_clean() {
        let store = Arc::new(MemoryStore::new());
        let sealer = SecretSealer::ephemeral();
        seed(&store, &sealer, "v1.0.0", "aaaa");

        let verifier = verifier_with_tags(store.clone(), sealer, &[("v1.0.0", "aaaa")]);
        assert_eq!(verifier.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_tag_upstream_is_a_silent_skip() {
        let store = Arc::new(MemoryStore::new());
        let sealer = SecretSealer::ephemeral();
        seed(&store, &sealer, "v1.0.0", "aaaa");

        let verifier = verifier_with_tags(store.clone(), sealer, &[]);
        assert_eq!(verifier.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn undecryptable_credentials_are_a_silent_skip() {
        let store = Arc::new(MemoryStore::new());
        let seeding_sealer = SecretSealer::ephemeral();
        seed(&store, &seeding_sealer, "v1.0.0", "aaaa");

        // A different key cannot open the sealed secret.
        let verifier = verifier_with_tags(store.clone(), SecretSealer::ephemeral(), &[("v1.0.0", "bbbb")]);
        assert_eq!(verifier.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unlinked_modules_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let sealer = SecretSealer::ephemeral();
        let module_id = seed(&store, &sealer, "v1.0.0", "aaaa");
        store.module_repos.remove(&module_id);

        let verifier = verifier_with_tags(store.clone(), sealer, &[("v1.0.0", "bbbb")]);
        assert_eq!(verifier.run_once().await.unwrap(), 0);
    }
}
