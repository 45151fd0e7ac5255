//! Mirror sync engine.
//!
//! One engine instance per process. A scheduler task scans for due
//! configurations (an immediate scan at start, then interval ticks) and
//! spawns one worker per configuration. The `active_syncs` set gives each
//! configuration mutual exclusion: at most one sync per configuration at
//! a time, while different configurations sync concurrently.
//!
//! Workers always record their terminal sync-history row, even during
//! shutdown: post-sync persistence runs detached under a 30-second
//! cleanup timeout.

pub mod binary_sync;
pub mod provider_sync;
pub mod shasums;
pub mod upstream;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{BaliseError, Result};
use crate::persist::{BinaryMirrorStore, MirrorStore};
use crate::storage::StorageBackend;
use crate::types::{BinaryMirrorConfig, MirrorConfiguration, SyncHistory, SyncStatus};
use upstream::HttpClient;

/// How long post-sync persistence may take once the run is over.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Aggregated result of one mirror run.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
    pub providers_synced: u32,
    pub providers_failed: u32,
    pub versions_synced: u32,
    pub versions_failed: u32,
    /// Run-fatal error message; `Some` marks the run failed.
    pub error: Option<String>,
    pub details: serde_json::Value,
}

impl SyncOutcome {
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn status(&self) -> SyncStatus {
        if self.error.is_some() {
            SyncStatus::Failed
        } else {
            SyncStatus::Success
        }
    }
}

/// The mirror sync engine.
pub struct MirrorEngine {
    store: Arc<dyn MirrorStore>,
    binary_store: Arc<dyn BinaryMirrorStore>,
    storage: Arc<dyn StorageBackend>,
    http: HttpClient,
    scan_interval: Duration,
    stop: CancellationToken,
    active_syncs: Mutex<HashSet<Uuid>>,
    /// GPG keys for CLI binary verification, keyed by product name.
    verify_keys: std::collections::HashMap<String, String>,
}

impl MirrorEngine {
    #[must_use]
    pub fn new(
        store: Arc<dyn MirrorStore>,
        binary_store: Arc<dyn BinaryMirrorStore>,
        storage: Arc<dyn StorageBackend>,
        scan_interval_minutes: i64,
        verify_keys: std::collections::HashMap<String, String>,
    ) -> Self {
        let scan_interval_minutes = if scan_interval_minutes <= 0 { 5 } else { scan_interval_minutes };
        Self {
            store,
            binary_store,
            storage,
            http: HttpClient::default(),
            scan_interval: Duration::from_secs(scan_interval_minutes as u64 * 60),
            stop: CancellationToken::new(),
            active_syncs: Mutex::new(HashSet::new()),
            verify_keys,
        }
    }

    /// Request shutdown: the scheduler exits its loop; in-flight workers
    /// run to completion.
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    #[must_use]
    pub fn is_sync_active(&self, config_id: Uuid) -> bool {
        self.active_syncs.lock().expect("active_syncs lock").contains(&config_id)
    }

    /// Atomically claim a configuration for syncing.
    fn try_acquire(&self, config_id: Uuid) -> bool {
        self.active_syncs.lock().expect("active_syncs lock").insert(config_id)
    }

    fn release(&self, config_id: Uuid) {
        self.active_syncs.lock().expect("active_syncs lock").remove(&config_id);
    }

    /// Scheduler loop: immediate scan, then interval ticks, until
    /// shutdown.
    pub async fn run_scheduler(self: Arc<Self>) {
        tracing::info!(
            interval_secs = self.scan_interval.as_secs(),
            "Mirror scheduler started"
        );
        Arc::clone(&self).scan_once().await;
        let mut ticker = tokio::time::interval(self.scan_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick fires immediately; consume it.
        ticker.tick().await;
        loop {
            tokio::select! {
                () = self.stop.cancelled() => {
                    tracing::info!("Mirror scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    Arc::clone(&self).scan_once().await;
                }
            }
        }
    }

    /// One scheduled scan over both mirror kinds.
    async fn scan_once(self: Arc<Self>) {
        let now = Utc::now();

        match self.store.due_configurations(now).await {
            Ok(configs) => {
                for config in configs {
                    if !self.try_acquire(config.id) {
                        tracing::debug!(config_id = %config.id, "Sync already in progress, skipping");
                        continue;
                    }
                    let engine = Arc::clone(&self);
                    tokio::spawn(async move {
                        engine.run_provider_worker(config).await;
                    });
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to query due mirror configurations"),
        }

        match self.binary_store.due_binary_configs(now).await {
            Ok(configs) => {
                for config in configs {
                    if !self.try_acquire(config.id) {
                        tracing::debug!(config_id = %config.id, "Binary sync already in progress, skipping");
                        continue;
                    }
                    let engine = Arc::clone(&self);
                    tokio::spawn(async move {
                        engine.run_binary_worker(config).await;
                    });
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to query due binary mirror configurations"),
        }
    }

    /// Manually trigger a provider mirror sync.
    ///
    /// The worker runs detached from the caller: the HTTP request that
    /// triggered it finishes long before the sync does.
    ///
    /// # Errors
    ///
    /// `SyncFailed("sync already in progress")` when the configuration is
    /// being synced, or the configuration is unknown.
    pub async fn trigger_manual_sync(self: Arc<Self>, config_id: Uuid) -> Result<()> {
        if !self.try_acquire(config_id) {
            return Err(BaliseError::sync("sync already in progress"));
        }
        let config = match self.store.get_configuration(config_id).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                self.release(config_id);
                return Err(BaliseError::sync(format!("unknown mirror configuration {config_id}")));
            }
            Err(e) => {
                self.release(config_id);
                return Err(e);
            }
        };
        let engine = Arc::clone(&self);
        tokio::spawn(async move {
            engine.run_provider_worker(config).await;
        });
        Ok(())
    }

    /// Manually trigger a CLI-binary mirror sync.
    pub async fn trigger_manual_binary_sync(self: Arc<Self>, config_id: Uuid) -> Result<()> {
        if !self.try_acquire(config_id) {
            return Err(BaliseError::sync("sync already in progress"));
        }
        let config = match self.binary_store.get_binary_config(config_id).await {
            Ok(Some(config)) => config,
            Ok(None) => {
                self.release(config_id);
                return Err(BaliseError::sync(format!("unknown binary mirror configuration {config_id}")));
            }
            Err(e) => {
                self.release(config_id);
                return Err(e);
            }
        };
        let engine = Arc::clone(&self);
        tokio::spawn(async move {
            engine.run_binary_worker(config).await;
        });
        Ok(())
    }

    /// Per-configuration provider worker: history row, status flips,
    /// sync, terminal persistence, release.
    pub async fn run_provider_worker(self: Arc<Self>, config: MirrorConfiguration) {
        let started_at = Utc::now();
        let history_id = Uuid::new_v4();
        let running = SyncHistory {
            id: history_id,
            config_id: config.id,
            started_at,
            completed_at: None,
            status: SyncStatus::InProgress,
            providers_synced: 0,
            providers_failed: 0,
            versions_synced: 0,
            versions_failed: 0,
            error_message: None,
            details: None,
        };
        if let Err(e) = self.store.insert_history(running).await {
            tracing::error!(config_id = %config.id, error = %e, "Failed to create sync history row");
        }
        if let Err(e) = self
            .store
            .set_configuration_status(config.id, SyncStatus::InProgress, None)
            .await
        {
            tracing::error!(config_id = %config.id, error = %e, "Failed to mark configuration in progress");
        }

        tracing::info!(config_id = %config.id, name = %config.name, "Provider mirror sync started");
        let outcome = provider_sync::sync_configuration(
            self.store.as_ref(),
            self.storage.as_ref(),
            &self.http,
            &config,
        )
        .await;

        self.persist_provider_outcome(&config, history_id, started_at, &outcome)
            .await;
        self.release(config.id);
        tracing::info!(
            config_id = %config.id,
            status = outcome.status().as_str(),
            providers_synced = outcome.providers_synced,
            versions_synced = outcome.versions_synced,
            "Provider mirror sync finished"
        );
    }

    /// Terminal persistence under the cleanup timeout, so completion is
    /// recorded even when shutdown races the worker.
    async fn persist_provider_outcome(
        &self,
        config: &MirrorConfiguration,
        history_id: Uuid,
        started_at: chrono::DateTime<Utc>,
        outcome: &SyncOutcome,
    ) {
        let completed_at = Utc::now();
        let terminal = SyncHistory {
            id: history_id,
            config_id: config.id,
            started_at,
            completed_at: Some(completed_at),
            status: outcome.status(),
            providers_synced: outcome.providers_synced,
            providers_failed: outcome.providers_failed,
            versions_synced: outcome.versions_synced,
            versions_failed: outcome.versions_failed,
            error_message: outcome.error.clone(),
            details: serde_json::to_string(&outcome.details).ok(),
        };

        let persist = async {
            if let Err(e) = self.store.complete_history(terminal).await {
                tracing::error!(config_id = %config.id, error = %e, "Failed to write terminal sync history");
            }
            if let Err(e) = self
                .store
                .set_configuration_status(config.id, outcome.status(), Some(completed_at))
                .await
            {
                tracing::error!(config_id = %config.id, error = %e, "Failed to update configuration status");
            }
        };
        if tokio::time::timeout(CLEANUP_TIMEOUT, persist).await.is_err() {
            tracing::error!(config_id = %config.id, "Post-sync persistence timed out");
        }
    }

    /// Per-configuration CLI-binary worker.
    pub async fn run_binary_worker(self: Arc<Self>, config: BinaryMirrorConfig) {
        let started_at = Utc::now();
        let history_id = Uuid::new_v4();
        let running = SyncHistory {
            id: history_id,
            config_id: config.id,
            started_at,
            completed_at: None,
            status: SyncStatus::InProgress,
            providers_synced: 0,
            providers_failed: 0,
            versions_synced: 0,
            versions_failed: 0,
            error_message: None,
            details: None,
        };
        if let Err(e) = self.store.insert_history(running).await {
            tracing::error!(config_id = %config.id, error = %e, "Failed to create sync history row");
        }

        tracing::info!(config_id = %config.id, tool = config.tool.product(), "Binary mirror sync started");
        let outcome = binary_sync::sync_binary_config(
            self.binary_store.as_ref(),
            self.storage.as_ref(),
            &self.http,
            &config,
            &self.verify_keys,
        )
        .await;

        let completed_at = Utc::now();
        let terminal = SyncHistory {
            id: history_id,
            config_id: config.id,
            started_at,
            completed_at: Some(completed_at),
            status: outcome.status(),
            providers_synced: outcome.providers_synced,
            providers_failed: outcome.providers_failed,
            versions_synced: outcome.versions_synced,
            versions_failed: outcome.versions_failed,
            error_message: outcome.error.clone(),
            details: serde_json::to_string(&outcome.details).ok(),
        };
        let persist = async {
            if let Err(e) = self.store.complete_history(terminal).await {
                tracing::error!(config_id = %config.id, error = %e, "Failed to write terminal sync history");
            }
            if let Err(e) = self.binary_store.touch_binary_config(config.id, completed_at).await {
                tracing::error!(config_id = %config.id, error = %e, "Failed to touch binary configuration");
            }
        };
        if tokio::time::timeout(CLEANUP_TIMEOUT, persist).await.is_err() {
            tracing::error!(config_id = %config.id, "Post-sync persistence timed out");
        }

        self.release(config.id);
        tracing::info!(
            config_id = %config.id,
            status = outcome.status().as_str(),
            versions_synced = outcome.versions_synced,
            "Binary mirror sync finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalStorageOptions;
    use crate::persist::MemoryStore;
    use crate::storage::LocalFsBackend;

    fn engine(store: Arc<MemoryStore>, dir: &tempfile::TempDir) -> Arc<MirrorEngine> {
        let storage = Arc::new(
            LocalFsBackend::new(&LocalStorageOptions {
                base_path: dir.path().to_string_lossy().into_owned(),
                serve_directly: false,
            })
            .unwrap(),
        );
        Arc::new(MirrorEngine::new(
            store.clone(),
            store,
            storage,
            5,
            std::collections::HashMap::new(),
        ))
    }

    #[tokio::test]
    async fn manual_trigger_rejects_overlapping_syncs() {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(store, &dir);
        let config_id = Uuid::new_v4();

        assert!(engine.try_acquire(config_id));
        let err = engine.clone().trigger_manual_sync(config_id).await.unwrap_err();
        assert!(err.to_string().contains("sync already in progress"));
        engine.release(config_id);
        assert!(!engine.is_sync_active(config_id));
    }

    #[tokio::test]
    async fn manual_trigger_unknown_configuration_releases_the_slot() {
        let store = Arc::new(MemoryStore::new());
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(store, &dir);
        let config_id = Uuid::new_v4();

        assert!(engine.clone().trigger_manual_sync(config_id).await.is_err());
        // The failed trigger must not leave the configuration claimed.
        assert!(!engine.is_sync_active(config_id));
    }

    #[test]
    fn outcome_status_reflects_error() {
        assert_eq!(SyncOutcome::default().status(), SyncStatus::Success);
        assert_eq!(SyncOutcome::failed("boom").status(), SyncStatus::Failed);
    }
}
