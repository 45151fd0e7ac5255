//! SCM integration layer.
//!
//! This module provides a uniform [`Connector`] abstraction over the four
//! supported source platforms:
//! - GitHub ([`github`])
//! - GitLab ([`gitlab`])
//! - Azure DevOps ([`azure_devops`])
//! - Bitbucket Data Center ([`bitbucket`])
//!
//! Connectors are built through a registry keyed by [`ProviderKind`];
//! adding a platform means registering another builder, no core change.
//! Every operation that fails upstream returns a typed error carrying the
//! HTTP status code and the upstream message body.

pub mod archive;
pub mod azure_devops;
pub mod bitbucket;
pub mod github;
pub mod gitlab;

pub use azure_devops::AzureDevOpsConnector;
pub use bitbucket::BitbucketConnector;
pub use github::GitHubConnector;
pub use gitlab::GitLabConnector;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{BaliseError, Result};
use crate::types::AccessToken;

/// Supported SCM platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    GitHub,
    GitLab,
    AzureDevOps,
    BitbucketDc,
}

impl ProviderKind {
    /// Get the platform name as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::AzureDevOps => "azuredevops",
            Self::BitbucketDc => "bitbucket_dc",
        }
    }

    /// Parse a platform kind from its stored string form.
    ///
    /// # Errors
    ///
    /// Returns `InvalidProviderKind` for unknown values.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "github" => Ok(Self::GitHub),
            "gitlab" => Ok(Self::GitLab),
            "azuredevops" => Ok(Self::AzureDevOps),
            "bitbucket_dc" => Ok(Self::BitbucketDc),
            other => Err(BaliseError::InvalidProviderKind { kind: other.to_string() }),
        }
    }

    /// Whether the platform authenticates with personal access tokens
    /// instead of OAuth.
    #[must_use]
    pub fn is_pat_based(&self) -> bool {
        matches!(self, Self::BitbucketDc)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Settings a connector is built from.
#[derive(Debug, Clone, Default)]
pub struct ConnectorSettings {
    pub kind: Option<ProviderKind>,
    /// Instance base URL; optional for cloud-hosted platforms.
    pub instance_base_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub callback_url: Option<String>,
    /// Entra ID tenant; required for Azure DevOps.
    pub tenant_id: Option<String>,
}

/// Pagination request. Defaults to page 1 with 30 items; `per_page` is
/// capped at 100.
#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: u32,
    pub per_page: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self { page: 1, per_page: 30 }
    }
}

impl Page {
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            page: self.page.max(1),
            per_page: self.per_page.clamp(1, 100),
        }
    }
}

/// A repository as reported by a platform API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRepository {
    pub owner: String,
    pub name: String,
    pub clone_url: String,
    pub default_branch: String,
    pub archived: bool,
    pub fork: bool,
    pub platform_id: String,
}

/// A branch reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchRef {
    pub name: String,
    pub commit_sha: String,
}

/// A tag reference. `name` is canonical (no `refs/tags/` prefix).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TagRef {
    pub name: String,
    pub commit_sha: String,
}

/// A single commit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub author_name: String,
    pub author_email: String,
    pub authored_at: Option<DateTime<Utc>>,
}

/// Requested source-archive format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    TarGz,
    Zip,
}

/// A parsed webhook delivery.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub event: String,
    pub repo_owner: String,
    pub repo_name: String,
    /// Canonical ref name for push/tag events.
    pub ref_name: Option<String>,
    pub commit_sha: Option<String>,
}

/// Platform connector contract.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The platform this connector handles.
    fn platform(&self) -> ProviderKind;

    /// URL users are redirected to for OAuth consent. An empty `scopes`
    /// slice selects the platform default.
    fn authorization_endpoint(&self, state: &str, scopes: &[String]) -> Result<String>;

    /// Exchange an authorization code for access + refresh tokens.
    async fn complete_authorization(&self, code: &str) -> Result<AccessToken>;

    /// Refresh an access token.
    async fn renew_token(&self, refresh_token: &str) -> Result<AccessToken>;

    /// Paginated repository listing for the authenticated account.
    async fn fetch_repositories(&self, token: &str, page: Page) -> Result<Vec<RemoteRepository>>;

    /// A single repository.
    async fn fetch_repository(&self, token: &str, owner: &str, name: &str) -> Result<RemoteRepository>;

    /// Substring search over repositories. Platforms without native
    /// search filter in-memory across everything visible.
    async fn search_repositories(
        &self,
        token: &str,
        query: &str,
        page: Page,
    ) -> Result<Vec<RemoteRepository>>;

    async fn fetch_branches(&self, token: &str, owner: &str, name: &str, page: Page) -> Result<Vec<BranchRef>>;

    async fn fetch_tags(&self, token: &str, owner: &str, name: &str, page: Page) -> Result<Vec<TagRef>>;

    /// A single tag by canonical name.
    async fn fetch_tag_by_name(&self, token: &str, owner: &str, name: &str, tag: &str) -> Result<TagRef>;

    async fn fetch_commit(&self, token: &str, owner: &str, name: &str, sha: &str) -> Result<CommitInfo>;

    /// Download a source archive at `git_ref`. The returned bytes are
    /// always tar+gzip when `kind` is [`ArchiveKind::TarGz`], even on
    /// platforms that only serve zip.
    async fn download_source_archive(
        &self,
        token: &str,
        owner: &str,
        name: &str,
        git_ref: &str,
        kind: ArchiveKind,
    ) -> Result<Bytes>;

    /// Register a push webhook; returns the platform webhook id.
    async fn register_webhook(&self, token: &str, owner: &str, name: &str, callback_url: &str, secret: &str) -> Result<String>;

    async fn remove_webhook(&self, token: &str, owner: &str, name: &str, webhook_id: &str) -> Result<()>;

    /// Parse a delivery body into the platform-independent form.
    fn parse_delivery(&self, headers: &[(String, String)], body: &[u8]) -> Result<WebhookDelivery>;

    /// Verify the platform signature over a delivery body.
    fn verify_delivery_signature(
        &self,
        headers: &[(String, String)],
        body: &[u8],
        secret: &str,
    ) -> Result<()>;
}

/// A connector builder registered for one platform kind.
pub type ConnectorBuilder = fn(ConnectorSettings) -> Result<Box<dyn Connector>>;

/// The builder registry. Adding a platform means adding one entry.
pub const REGISTRY: &[(ProviderKind, ConnectorBuilder)] = &[
    (ProviderKind::GitHub, |s| Ok(Box::new(GitHubConnector::new(s)?))),
    (ProviderKind::GitLab, |s| Ok(Box::new(GitLabConnector::new(s)?))),
    (ProviderKind::AzureDevOps, |s| Ok(Box::new(AzureDevOpsConnector::new(s)?))),
    (ProviderKind::BitbucketDc, |s| Ok(Box::new(BitbucketConnector::new(s)?))),
];

/// Validate settings and build the connector for their kind.
///
/// PAT-based platforms may omit the OAuth triple; every other platform
/// must provide client id, client secret, and callback URL.
///
/// # Errors
///
/// Returns the specific missing-field error, or `ProviderNotSupported`
/// when no builder is registered for the kind.
pub fn build_connector(settings: ConnectorSettings) -> Result<Box<dyn Connector>> {
    let kind = settings.kind.ok_or_else(|| BaliseError::InvalidProviderKind {
        kind: "<unset>".to_string(),
    })?;

    if !kind.is_pat_based() {
        if settings.client_id.as_deref().is_none_or_empty() {
            return Err(BaliseError::MissingClientId { kind: kind.to_string() });
        }
        if settings.client_secret.as_deref().is_none_or_empty() {
            return Err(BaliseError::MissingClientSecret { kind: kind.to_string() });
        }
        if settings.callback_url.as_deref().is_none_or_empty() {
            return Err(BaliseError::MissingCallbackUrl { kind: kind.to_string() });
        }
    }

    for (registered, builder) in REGISTRY {
        if *registered == kind {
            return builder(settings);
        }
    }
    Err(BaliseError::ProviderNotSupported { kind: kind.to_string() })
}

/// Strip `refs/heads/` and `refs/tags/` prefixes off a ref name.
#[must_use]
pub fn canonicalize_ref(name: &str) -> &str {
    name.strip_prefix("refs/tags/")
        .or_else(|| name.strip_prefix("refs/heads/"))
        .unwrap_or(name)
}

/// Shared HTTP client used by the connectors.
pub(crate) fn api_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(concat!("balise/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("reqwest client")
}

/// Read a failed response into a typed API error.
pub(crate) async fn api_error(platform: ProviderKind, response: reqwest::Response) -> BaliseError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    BaliseError::api(platform.as_str(), status, message)
}

/// Constant-time byte comparison for signature checks.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// HMAC-SHA-256 over `body`, hex-encoded.
pub(crate) fn hmac_sha256_hex(secret: &str, body: &[u8]) -> String {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Find a header value case-insensitively.
pub(crate) fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

trait OptStrExt {
    fn is_none_or_empty(&self) -> bool;
}

impl OptStrExt for Option<&str> {
    fn is_none_or_empty(&self) -> bool {
        self.map_or(true, |s| s.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oauth_settings(kind: ProviderKind) -> ConnectorSettings {
        ConnectorSettings {
            kind: Some(kind),
            instance_base_url: Some("https://dev.azure.com/acme".to_string()),
            client_id: Some("client".to_string()),
            client_secret: Some("secret".to_string()),
            callback_url: Some("https://registry.example.com/callback".to_string()),
            tenant_id: Some("tenant-guid".to_string()),
        }
    }

    #[test]
    fn kind_round_trips_through_strings() {
        for kind in [
            ProviderKind::GitHub,
            ProviderKind::GitLab,
            ProviderKind::AzureDevOps,
            ProviderKind::BitbucketDc,
        ] {
            assert_eq!(ProviderKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(matches!(
            ProviderKind::parse("subversion"),
            Err(BaliseError::InvalidProviderKind { .. })
        ));
    }

    #[test]
    fn oauth_platforms_require_the_full_triple() {
        let mut settings = oauth_settings(ProviderKind::GitHub);
        settings.client_id = None;
        assert!(matches!(
            build_connector(settings).err(),
            Some(BaliseError::MissingClientId { .. })
        ));

        let mut settings = oauth_settings(ProviderKind::GitLab);
        settings.client_secret = Some("  ".to_string());
        assert!(matches!(
            build_connector(settings).err(),
            Some(BaliseError::MissingClientSecret { .. })
        ));

        let mut settings = oauth_settings(ProviderKind::GitHub);
        settings.callback_url = None;
        assert!(matches!(
            build_connector(settings).err(),
            Some(BaliseError::MissingCallbackUrl { .. })
        ));
    }

    #[test]
    fn pat_platform_builds_without_oauth_fields() {
        let settings = ConnectorSettings {
            kind: Some(ProviderKind::BitbucketDc),
            instance_base_url: Some("https://bitbucket.example.com".to_string()),
            ..ConnectorSettings::default()
        };
        let connector = build_connector(settings).unwrap();
        assert_eq!(connector.platform(), ProviderKind::BitbucketDc);
    }

    #[test]
    fn registry_dispatches_every_kind() {
        for kind in [ProviderKind::GitHub, ProviderKind::GitLab, ProviderKind::AzureDevOps] {
            let connector = build_connector(oauth_settings(kind)).unwrap();
            assert_eq!(connector.platform(), kind);
        }
    }

    #[test]
    fn refs_are_canonicalized() {
        assert_eq!(canonicalize_ref("refs/tags/v1.0.0"), "v1.0.0");
        assert_eq!(canonicalize_ref("refs/heads/main"), "main");
        assert_eq!(canonicalize_ref("v1.0.0"), "v1.0.0");
    }

    #[test]
    fn page_normalization_caps_per_page() {
        let page = Page { page: 0, per_page: 500 }.normalized();
        assert_eq!(page.page, 1);
        assert_eq!(page.per_page, 100);
        let default = Page::default();
        assert_eq!((default.page, default.per_page), (1, 30));
    }

    #[test]
    fn hmac_hex_matches_known_vector() {
        // RFC 4231 test case 2 ("Jefe" / "what do ya want for nothing?").
        let mac = hmac_sha256_hex("Jefe", b"what do ya want for nothing?");
        assert_eq!(
            mac,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn constant_time_eq_basic() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }
}
