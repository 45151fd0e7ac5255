//! Core domain types shared across Balise.
//!
//! These mirror the persisted rows the relational layer owns. Identifiers
//! are created once and never reused; sync history rows are append-only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Number of cleartext characters of an API key stored for candidate lookup.
pub const KEY_PREFIX_LENGTH: usize = 10;

// =============================================================================
// Identity and access
// =============================================================================

/// A registered user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub display_name: String,
    /// Subject of the external identity that provisioned this user, if any.
    pub external_subject: Option<String>,
}

/// An organization grouping users and resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
}

/// A named set of scope strings assignable to members.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleTemplate {
    pub id: Uuid,
    pub name: String,
    pub scopes: Vec<String>,
}

/// Membership of a user in an organization, carrying a role template.
///
/// A user inherits the union of scopes from all memberships.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrganizationMember {
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub role_template_id: Uuid,
}

/// An API key. The cleartext secret is never persisted; only its bcrypt
/// hash and the first [`KEY_PREFIX_LENGTH`] cleartext characters survive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub secret_hash: String,
    pub key_prefix: String,
    pub name: String,
    pub description: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    /// Once set this is monotonic; it gates at-most-once expiry mail.
    pub expiry_notification_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    /// Whether the key is expired at `now`. An expired key still exists.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

// =============================================================================
// SCM
// =============================================================================

/// A configured SCM provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScmProviderRecord {
    pub id: Uuid,
    /// One of `github`, `gitlab`, `azuredevops`, `bitbucket_dc`.
    pub kind: String,
    /// Instance base URL; optional for cloud-hosted providers.
    pub instance_base_url: Option<String>,
    pub client_id: String,
    /// AES-256-GCM sealed OAuth client secret (see [`crate::crypto`]).
    pub client_secret_sealed: String,
    /// Required for `azuredevops`.
    pub tenant_id: Option<String>,
    pub webhook_secret: String,
}

/// An access token returned by an SCM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

impl AccessToken {
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Link between a registry module and its source repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSourceRepo {
    pub module_id: Uuid,
    pub provider_id: Uuid,
    pub owner: String,
    pub name: String,
    pub default_branch: String,
    pub webhook_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_sync_commit: Option<String>,
}

/// A published module version linked to an SCM tag.
///
/// Once created, `(tag_name, commit_sha)` is immutable; a later observation
/// of the same tag pointing at a different SHA is a violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleVersion {
    pub id: Uuid,
    pub module_id: Uuid,
    pub version: String,
    pub commit_sha: Option<String>,
    pub tag_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Mirroring
// =============================================================================

/// Status of the most recent sync of a mirror configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    InProgress,
    Success,
    Failed,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }
}

/// A provider mirror configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfiguration {
    pub id: Uuid,
    pub name: String,
    pub upstream_url: String,
    pub namespace_filter: Option<String>,
    pub provider_filter: Option<String>,
    pub version_filter: Option<String>,
    /// JSON array of `"os/arch"` strings; absent or malformed means all.
    pub platform_filter: Option<String>,
    pub interval_minutes: i64,
    pub enabled: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub last_sync_status: SyncStatus,
}

impl MirrorConfiguration {
    /// Whether the configuration is due for a scheduled sync at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_sync_at {
            None => true,
            Some(last) => last + chrono::Duration::minutes(self.interval_minutes) <= now,
        }
    }
}

/// Link between a mirror configuration and a locally materialized provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirroredProvider {
    pub id: Uuid,
    pub mirror_id: Uuid,
    pub provider_id: Uuid,
    pub upstream_namespace: String,
    pub upstream_type: String,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_sync_version: Option<String>,
    pub sync_enabled: bool,
}

/// A locally materialized provider row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: Uuid,
    pub namespace: String,
    pub provider_type: String,
    pub description: String,
    pub source_url: String,
}

/// A locally materialized provider version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderVersion {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub version: String,
    pub protocols: Vec<String>,
    pub gpg_key_id: Option<String>,
    pub shasums_url: Option<String>,
    pub shasums_signature_url: Option<String>,
}

/// A platform artifact of a provider version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderVersionPlatform {
    pub id: Uuid,
    pub version_id: Uuid,
    pub os: String,
    pub arch: String,
    pub filename: String,
    pub storage_path: String,
    pub size: u64,
    pub sha256: String,
}

/// Per-version mirror tracking row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirroredProviderVersion {
    pub id: Uuid,
    pub mirrored_provider_id: Uuid,
    pub version_id: Uuid,
    pub upstream_version: String,
    pub shasum_verified: bool,
    pub gpg_verified: bool,
}

/// Which CLI tool a binary mirror tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorTool {
    Terraform,
    Opentofu,
    Custom,
}

impl MirrorTool {
    /// Upstream URL path component for the tool. Unknown values default
    /// to the terraform product line.
    #[must_use]
    pub fn product(&self) -> &'static str {
        match self {
            Self::Opentofu => "opentofu",
            Self::Terraform | Self::Custom => "terraform",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "opentofu" => Self::Opentofu,
            "custom" => Self::Custom,
            _ => Self::Terraform,
        }
    }
}

/// A CLI-binary mirror configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryMirrorConfig {
    pub id: Uuid,
    pub tool: MirrorTool,
    pub upstream_url: String,
    pub gpg_verify: bool,
    pub platform_filter: Option<String>,
    pub version_filter: Option<String>,
    pub interval_minutes: i64,
    pub enabled: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Sync state of a CLI-binary version or platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinarySyncStatus {
    Pending,
    Syncing,
    Synced,
    Partial,
    Failed,
}

impl BinarySyncStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

/// A CLI tool version tracked by a binary mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryVersion {
    pub id: Uuid,
    pub config_id: Uuid,
    pub version: String,
    pub sync_status: BinarySyncStatus,
    /// Set on the greatest stable synced version per configuration.
    pub is_latest: bool,
    pub sums_gpg_verified: bool,
}

/// A platform artifact of a CLI tool version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryVersionPlatform {
    pub id: Uuid,
    pub version_id: Uuid,
    pub os: String,
    pub arch: String,
    pub upstream_url: String,
    pub filename: String,
    /// Absent until the artifact has been stored.
    pub storage_key: Option<String>,
    pub storage_backend: String,
    pub sha256_verified: bool,
    pub gpg_verified: bool,
    pub sync_status: BinarySyncStatus,
}

// =============================================================================
// Sync history
// =============================================================================

/// Append-only record of one mirror run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncHistory {
    pub id: Uuid,
    pub config_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: SyncStatus,
    pub providers_synced: u32,
    pub providers_failed: u32,
    pub versions_synced: u32,
    pub versions_failed: u32,
    pub error_message: Option<String>,
    /// JSON-encoded details payload.
    pub details: Option<String>,
}

/// System-wide settings consulted by the setup middleware.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemSettings {
    pub setup_completed: bool,
    /// bcrypt hash of the single-use setup token.
    pub setup_token_hash: Option<String>,
}

/// One audit log entry, written after the handler completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub user_id: Option<Uuid>,
    pub api_key_id: Option<Uuid>,
    pub method: String,
    pub path: String,
    pub status: u16,
    pub resource_type: Option<String>,
    pub action: Option<String>,
    pub request_id: String,
}
