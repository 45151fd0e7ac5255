//! Upstream registry and release-index clients.
//!
//! [`HttpClient`] is a retrying wrapper shared by both: server errors and
//! 429 responses are retried with exponential backoff. [`RegistryClient`]
//! speaks the provider registry protocol (service discovery, version
//! listing, platform download info); [`ReleasesClient`] speaks the CLI
//! release index (`/<product>/index.json`).

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use serde::Deserialize;

use crate::error::{BaliseError, Result};

/// Retry policy for upstream fetches.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

/// HTTP client wrapper with retry and backoff.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: reqwest::Client,
    retry: RetryConfig,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl HttpClient {
    #[must_use]
    pub fn new(retry: RetryConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .user_agent(concat!("balise/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client");
        Self { client, retry }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let mut attempts = 0;
        let mut delay = self.retry.delay_ms;
        loop {
            attempts += 1;
            let response = self.client.get(url).send().await.map_err(|e| {
                BaliseError::api("upstream", 0, format!("request to {url} failed: {e}"))
            })?;

            if response.status().is_success() {
                return Ok(response);
            }

            let status = response.status();
            if (status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS)
                && attempts <= self.retry.max_retries
            {
                tracing::warn!(
                    url = %url,
                    status = status.as_u16(),
                    attempt = attempts,
                    "Upstream request failed, retrying in {delay}ms"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay = (delay as f64 * self.retry.backoff_multiplier) as u64;
                continue;
            }

            let code = status.as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BaliseError::api("upstream", code, format!("{url}: {body}")));
        }
    }

    pub async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let response = self.get(url).await?;
        response
            .json()
            .await
            .map_err(|e| BaliseError::api("upstream", 0, format!("unparseable body from {url}: {e}")))
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Bytes> {
        let response = self.get(url).await?;
        response
            .bytes()
            .await
            .map_err(|e| BaliseError::api("upstream", 0, format!("body read from {url} failed: {e}")))
    }

    pub async fn get_text(&self, url: &str) -> Result<String> {
        let response = self.get(url).await?;
        response
            .text()
            .await
            .map_err(|e| BaliseError::api("upstream", 0, format!("body read from {url} failed: {e}")))
    }
}

// =============================================================================
// Provider registry protocol
// =============================================================================

#[derive(Debug, Deserialize)]
struct ServiceDiscovery {
    #[serde(rename = "providers.v1")]
    providers_v1: Option<String>,
}

/// One upstream provider version with its platform list.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamVersion {
    pub version: String,
    #[serde(default)]
    pub protocols: Vec<String>,
    #[serde(default)]
    pub platforms: Vec<UpstreamPlatform>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamPlatform {
    pub os: String,
    pub arch: String,
}

#[derive(Debug, Deserialize)]
struct VersionsResponse {
    versions: Vec<UpstreamVersion>,
}

/// Download info for one `(version, os, arch)`.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageInfo {
    pub download_url: String,
    pub filename: String,
    pub shasums_url: Option<String>,
    pub shasums_signature_url: Option<String>,
    pub shasum: Option<String>,
    #[serde(default)]
    pub protocols: Vec<String>,
    pub signing_keys: Option<SigningKeys>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SigningKeys {
    #[serde(default)]
    pub gpg_public_keys: Vec<GpgPublicKey>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GpgPublicKey {
    pub key_id: Option<String>,
    pub ascii_armor: Option<String>,
}

/// Provider registry client bound to one upstream.
#[derive(Debug, Clone)]
pub struct RegistryClient {
    http: HttpClient,
    base_url: String,
}

impl RegistryClient {
    #[must_use]
    pub fn new(http: HttpClient, upstream_url: &str) -> Self {
        Self {
            http,
            base_url: upstream_url.trim_end_matches('/').to_string(),
        }
    }

    /// Resolve the providers API base through service discovery.
    ///
    /// # Errors
    ///
    /// A missing or invalid discovery document fails the whole run.
    pub async fn discover(&self) -> Result<String> {
        let url = format!("{}/.well-known/terraform.json", self.base_url);
        let discovery: ServiceDiscovery = self.http.get_json(&url).await.map_err(|e| {
            BaliseError::sync(format!("service discovery at {url} failed: {e}"))
        })?;
        let providers = discovery
            .providers_v1
            .ok_or_else(|| BaliseError::sync(format!("{url} does not announce providers.v1")))?;
        if providers.starts_with("http") {
            Ok(providers.trim_end_matches('/').to_string())
        } else {
            Ok(format!(
                "{}/{}",
                self.base_url,
                providers.trim_matches('/')
            ))
        }
    }

    pub async fn list_versions(
        &self,
        providers_base: &str,
        namespace: &str,
        name: &str,
    ) -> Result<Vec<UpstreamVersion>> {
        let url = format!("{providers_base}/{namespace}/{name}/versions");
        let response: VersionsResponse = self.http.get_json(&url).await?;
        Ok(response.versions)
    }

    pub async fn package_info(
        &self,
        providers_base: &str,
        namespace: &str,
        name: &str,
        version: &str,
        os: &str,
        arch: &str,
    ) -> Result<PackageInfo> {
        let url = format!("{providers_base}/{namespace}/{name}/{version}/download/{os}/{arch}");
        self.http.get_json(&url).await
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Bytes> {
        self.http.get_bytes(url).await
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String> {
        self.http.get_text(url).await
    }
}

// =============================================================================
// CLI release index
// =============================================================================

#[derive(Debug, Deserialize)]
struct ReleaseIndex {
    versions: HashMap<String, ReleaseVersion>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseVersion {
    pub version: String,
    #[serde(default)]
    pub builds: Vec<ReleaseBuild>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseBuild {
    pub os: String,
    pub arch: String,
    pub filename: String,
    pub url: String,
}

/// CLI release-index client bound to one upstream and product.
#[derive(Debug, Clone)]
pub struct ReleasesClient {
    http: HttpClient,
    base_url: String,
    product: String,
}

impl ReleasesClient {
    #[must_use]
    pub fn new(http: HttpClient, upstream_url: &str, product: &str) -> Self {
        Self {
            http,
            base_url: upstream_url.trim_end_matches('/').to_string(),
            product: product.to_string(),
        }
    }

    /// All published versions with their builds.
    pub async fn index(&self) -> Result<Vec<ReleaseVersion>> {
        let url = format!("{}/{}/index.json", self.base_url, self.product);
        let index: ReleaseIndex = self
            .http
            .get_json(&url)
            .await
            .map_err(|e| BaliseError::sync(format!("release index at {url} failed: {e}")))?;
        Ok(index.versions.into_values().collect())
    }

    pub async fn shasums(&self, version: &str) -> Result<String> {
        let url = format!(
            "{}/{}/{version}/{}_{version}_SHA256SUMS",
            self.base_url, self.product, self.product
        );
        self.http.get_text(&url).await
    }

    pub async fn shasums_signature(&self, version: &str) -> Result<Bytes> {
        let url = format!(
            "{}/{}/{version}/{}_{version}_SHA256SUMS.sig",
            self.base_url, self.product, self.product
        );
        self.http.get_bytes(&url).await
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<Bytes> {
        self.http.get_bytes(url).await
    }
}
