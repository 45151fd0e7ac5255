//! GitHub connector.
//!
//! Works against github.com and GitHub Enterprise (instance base URL).
//! Webhook deliveries are signed with HMAC-SHA-256 in the
//! `X-Hub-Signature-256` header.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{BaliseError, Result};
use crate::types::AccessToken;
use super::{
    api_client, api_error, canonicalize_ref, constant_time_eq, header_value, hmac_sha256_hex,
    ArchiveKind, BranchRef, CommitInfo, Connector, ConnectorSettings, Page, ProviderKind,
    RemoteRepository, TagRef, WebhookDelivery,
};

const DEFAULT_SCOPES: &str = "repo read:org";

/// GitHub API connector.
pub struct GitHubConnector {
    settings: ConnectorSettings,
    client: reqwest::Client,
    api_base: String,
    web_base: String,
}

impl GitHubConnector {
    /// Build a connector from validated settings.
    pub fn new(settings: ConnectorSettings) -> Result<Self> {
        let web_base = settings
            .instance_base_url
            .clone()
            .unwrap_or_else(|| "https://github.com".to_string());
        let web_base = web_base.trim_end_matches('/').to_string();
        let api_base = if web_base == "https://github.com" {
            "https://api.github.com".to_string()
        } else {
            // GitHub Enterprise serves the API under the instance.
            format!("{web_base}/api/v3")
        };
        Ok(Self {
            settings,
            client: api_client(),
            api_base,
            web_base,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_api_base_url(mut self, api_base: String) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    fn get(&self, token: &str, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "application/vnd.github+json")
    }
}

#[derive(Debug, Deserialize)]
struct GitHubRepository {
    id: u64,
    name: String,
    owner: GitHubOwner,
    clone_url: String,
    default_branch: String,
    #[serde(default)]
    archived: bool,
    #[serde(default)]
    fork: bool,
}

#[derive(Debug, Deserialize)]
struct GitHubOwner {
    login: String,
}

impl From<GitHubRepository> for RemoteRepository {
    fn from(r: GitHubRepository) -> Self {
        Self {
            owner: r.owner.login,
            name: r.name,
            clone_url: r.clone_url,
            default_branch: r.default_branch,
            archived: r.archived,
            fork: r.fork,
            platform_id: r.id.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitHubSearchResponse {
    items: Vec<GitHubRepository>,
}

#[derive(Debug, Deserialize)]
struct GitHubBranch {
    name: String,
    commit: GitHubCommitPointer,
}

#[derive(Debug, Deserialize)]
struct GitHubTag {
    name: String,
    commit: GitHubCommitPointer,
}

#[derive(Debug, Deserialize)]
struct GitHubCommitPointer {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GitHubRef {
    object: GitHubRefObject,
}

#[derive(Debug, Deserialize)]
struct GitHubRefObject {
    sha: String,
    #[serde(rename = "type")]
    object_type: String,
}

#[derive(Debug, Deserialize)]
struct GitHubCommit {
    sha: String,
    commit: GitHubCommitDetail,
}

#[derive(Debug, Deserialize)]
struct GitHubCommitDetail {
    message: String,
    author: Option<GitHubCommitAuthor>,
}

#[derive(Debug, Deserialize)]
struct GitHubCommitAuthor {
    name: String,
    email: String,
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GitHubTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    #[serde(default)]
    scope: String,
}

impl GitHubTokenResponse {
    fn into_access_token(self) -> AccessToken {
        AccessToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            scopes: self
                .scope
                .split([',', ' '])
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitHubHook {
    id: u64,
}

#[async_trait]
impl Connector for GitHubConnector {
    fn platform(&self) -> ProviderKind {
        ProviderKind::GitHub
    }

    fn authorization_endpoint(&self, state: &str, scopes: &[String]) -> Result<String> {
        let client_id = self.settings.client_id.as_deref().unwrap_or_default();
        let callback = self.settings.callback_url.as_deref().unwrap_or_default();
        let scope = if scopes.is_empty() {
            DEFAULT_SCOPES.to_string()
        } else {
            scopes.join(" ")
        };
        let mut url = url::Url::parse(&format!("{}/login/oauth/authorize", self.web_base))
            .map_err(|e| BaliseError::internal(format!("authorize URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", client_id)
            .append_pair("redirect_uri", callback)
            .append_pair("scope", &scope)
            .append_pair("state", state);
        Ok(url.into())
    }

    async fn complete_authorization(&self, code: &str) -> Result<AccessToken> {
        let response = self
            .client
            .post(format!("{}/login/oauth/access_token", self.web_base))
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.settings.client_id.as_deref().unwrap_or_default()),
                ("client_secret", self.settings.client_secret.as_deref().unwrap_or_default()),
                ("code", code),
                ("redirect_uri", self.settings.callback_url.as_deref().unwrap_or_default()),
            ])
            .send()
            .await
            .map_err(|e| BaliseError::AuthCodeExchangeFailed {
                platform: "github".to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BaliseError::AuthCodeExchangeFailed {
                platform: "github".to_string(),
                message: format!("status {status}: {body}"),
            });
        }
        let token: GitHubTokenResponse =
            response.json().await.map_err(|e| BaliseError::AuthCodeExchangeFailed {
                platform: "github".to_string(),
                message: format!("unparseable token response: {e}"),
            })?;
        Ok(token.into_access_token())
    }

    async fn renew_token(&self, refresh_token: &str) -> Result<AccessToken> {
        let response = self
            .client
            .post(format!("{}/login/oauth/access_token", self.web_base))
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.settings.client_id.as_deref().unwrap_or_default()),
                ("client_secret", self.settings.client_secret.as_deref().unwrap_or_default()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| BaliseError::TokenRefreshFailed {
                platform: "github".to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BaliseError::TokenRefreshFailed {
                platform: "github".to_string(),
                message: format!("status {status}: {body}"),
            });
        }
        let token: GitHubTokenResponse =
            response.json().await.map_err(|e| BaliseError::TokenRefreshFailed {
                platform: "github".to_string(),
                message: format!("unparseable token response: {e}"),
            })?;
        Ok(token.into_access_token())
    }

    async fn fetch_repositories(&self, token: &str, page: Page) -> Result<Vec<RemoteRepository>> {
        let page = page.normalized();
        let url = format!(
            "{}/user/repos?page={}&per_page={}&sort=full_name",
            self.api_base, page.page, page.per_page
        );
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::GitHub, response).await);
        }
        let repos: Vec<GitHubRepository> = response.json().await.map_err(request_error)?;
        Ok(repos.into_iter().map(Into::into).collect())
    }

    async fn fetch_repository(&self, token: &str, owner: &str, name: &str) -> Result<RemoteRepository> {
        let url = format!("{}/repos/{owner}/{name}", self.api_base);
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        match response.status().as_u16() {
            404 => Err(BaliseError::RepoNotFound {
                owner: owner.to_string(),
                name: name.to_string(),
            }),
            403 => Err(BaliseError::RepoForbidden {
                owner: owner.to_string(),
                name: name.to_string(),
            }),
            s if !(200..300).contains(&s) => Err(api_error(ProviderKind::GitHub, response).await),
            _ => {
                let repo: GitHubRepository = response.json().await.map_err(request_error)?;
                Ok(repo.into())
            }
        }
    }

    async fn search_repositories(
        &self,
        token: &str,
        query: &str,
        page: Page,
    ) -> Result<Vec<RemoteRepository>> {
        let page = page.normalized();
        let url = format!(
            "{}/search/repositories?q={}+in:name&page={}&per_page={}",
            self.api_base,
            urlencode(query),
            page.page,
            page.per_page
        );
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::GitHub, response).await);
        }
        let result: GitHubSearchResponse = response.json().await.map_err(request_error)?;
        Ok(result.items.into_iter().map(Into::into).collect())
    }

    async fn fetch_branches(&self, token: &str, owner: &str, name: &str, page: Page) -> Result<Vec<BranchRef>> {
        let page = page.normalized();
        let url = format!(
            "{}/repos/{owner}/{name}/branches?page={}&per_page={}",
            self.api_base, page.page, page.per_page
        );
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::GitHub, response).await);
        }
        let branches: Vec<GitHubBranch> = response.json().await.map_err(request_error)?;
        Ok(branches
            .into_iter()
            .map(|b| BranchRef {
                name: canonicalize_ref(&b.name).to_string(),
                commit_sha: b.commit.sha,
            })
            .collect())
    }

    async fn fetch_tags(&self, token: &str, owner: &str, name: &str, page: Page) -> Result<Vec<TagRef>> {
        let page = page.normalized();
        let url = format!(
            "{}/repos/{owner}/{name}/tags?page={}&per_page={}",
            self.api_base, page.page, page.per_page
        );
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::GitHub, response).await);
        }
        let tags: Vec<GitHubTag> = response.json().await.map_err(request_error)?;
        Ok(tags
            .into_iter()
            .map(|t| TagRef {
                name: canonicalize_ref(&t.name).to_string(),
                commit_sha: t.commit.sha,
            })
            .collect())
    }

    async fn fetch_tag_by_name(&self, token: &str, owner: &str, name: &str, tag: &str) -> Result<TagRef> {
        let tag = canonicalize_ref(tag);
        let url = format!("{}/repos/{owner}/{name}/git/ref/tags/{tag}", self.api_base);
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if response.status().as_u16() == 404 {
            return Err(BaliseError::TagNotFound { tag: tag.to_string() });
        }
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::GitHub, response).await);
        }
        let reference: GitHubRef = response.json().await.map_err(request_error)?;

        // Annotated tags point at a tag object; dereference to the commit.
        let commit_sha = if reference.object.object_type == "tag" {
            let url = format!(
                "{}/repos/{owner}/{name}/git/tags/{}",
                self.api_base, reference.object.sha
            );
            let response = self.get(token, &url).send().await.map_err(request_error)?;
            if !response.status().is_success() {
                return Err(api_error(ProviderKind::GitHub, response).await);
            }
            let annotated: GitHubRef = response.json().await.map_err(request_error)?;
            annotated.object.sha
        } else {
            reference.object.sha
        };

        Ok(TagRef {
            name: tag.to_string(),
            commit_sha,
        })
    }

    async fn fetch_commit(&self, token: &str, owner: &str, name: &str, sha: &str) -> Result<CommitInfo> {
        let url = format!("{}/repos/{owner}/{name}/commits/{sha}", self.api_base);
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        match response.status().as_u16() {
            404 | 422 => Err(BaliseError::CommitNotFound { sha: sha.to_string() }),
            s if !(200..300).contains(&s) => Err(api_error(ProviderKind::GitHub, response).await),
            _ => {
                let commit: GitHubCommit = response.json().await.map_err(request_error)?;
                let author = commit.commit.author;
                Ok(CommitInfo {
                    sha: commit.sha,
                    message: commit.commit.message,
                    author_name: author.as_ref().map(|a| a.name.clone()).unwrap_or_default(),
                    author_email: author.as_ref().map(|a| a.email.clone()).unwrap_or_default(),
                    authored_at: author.and_then(|a| a.date),
                })
            }
        }
    }

    async fn download_source_archive(
        &self,
        token: &str,
        owner: &str,
        name: &str,
        git_ref: &str,
        kind: ArchiveKind,
    ) -> Result<Bytes> {
        let format = match kind {
            ArchiveKind::TarGz => "tarball",
            ArchiveKind::Zip => "zipball",
        };
        let url = format!("{}/repos/{owner}/{name}/{format}/{git_ref}", self.api_base);
        let response = self.get(token, &url).send().await.map_err(|e| {
            BaliseError::ArchiveDownloadFailed { message: e.to_string() }
        })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(BaliseError::ArchiveDownloadFailed {
                message: format!("github returned status {status}"),
            });
        }
        response
            .bytes()
            .await
            .map_err(|e| BaliseError::ArchiveDownloadFailed { message: e.to_string() })
    }

    async fn register_webhook(
        &self,
        token: &str,
        owner: &str,
        name: &str,
        callback_url: &str,
        secret: &str,
    ) -> Result<String> {
        let url = format!("{}/repos/{owner}/{name}/hooks", self.api_base);
        let body = serde_json::json!({
            "name": "web",
            "active": true,
            "events": ["push"],
            "config": {
                "url": callback_url,
                "content_type": "json",
                "secret": secret,
            }
        });
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "application/vnd.github+json")
            .json(&body)
            .send()
            .await
            .map_err(|e| BaliseError::WebhookCreationFailed { message: e.to_string() })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BaliseError::WebhookCreationFailed {
                message: format!("status {status}: {body}"),
            });
        }
        let hook: GitHubHook = response
            .json()
            .await
            .map_err(|e| BaliseError::WebhookCreationFailed { message: e.to_string() })?;
        Ok(hook.id.to_string())
    }

    async fn remove_webhook(&self, token: &str, owner: &str, name: &str, webhook_id: &str) -> Result<()> {
        let url = format!("{}/repos/{owner}/{name}/hooks/{webhook_id}", self.api_base);
        let response = self
            .client
            .delete(&url)
            .header("Authorization", format!("Bearer {token}"))
            .send()
            .await
            .map_err(request_error)?;
        match response.status().as_u16() {
            404 => Err(BaliseError::WebhookNotFound {
                id: webhook_id.to_string(),
            }),
            s if !(200..300).contains(&s) => Err(api_error(ProviderKind::GitHub, response).await),
            _ => Ok(()),
        }
    }

    fn parse_delivery(&self, headers: &[(String, String)], body: &[u8]) -> Result<WebhookDelivery> {
        let event = header_value(headers, "X-GitHub-Event")
            .unwrap_or("push")
            .to_string();
        let payload: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| BaliseError::PayloadInvalid {
                message: format!("not JSON: {e}"),
            })?;
        let repository = payload.get("repository").ok_or_else(|| BaliseError::PayloadInvalid {
            message: "missing repository".to_string(),
        })?;
        let repo_owner = repository
            .pointer("/owner/login")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let repo_name = repository
            .get("name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let ref_name = payload
            .get("ref")
            .and_then(serde_json::Value::as_str)
            .map(|r| canonicalize_ref(r).to_string());
        let commit_sha = payload
            .get("after")
            .and_then(serde_json::Value::as_str)
            .map(str::to_string);
        Ok(WebhookDelivery {
            event,
            repo_owner,
            repo_name,
            ref_name,
            commit_sha,
        })
    }

    fn verify_delivery_signature(
        &self,
        headers: &[(String, String)],
        body: &[u8],
        secret: &str,
    ) -> Result<()> {
        let signature = header_value(headers, "X-Hub-Signature-256")
            .ok_or(BaliseError::SignatureInvalid)?;
        let expected = format!("sha256={}", hmac_sha256_hex(secret, body));
        if constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            Err(BaliseError::SignatureInvalid)
        }
    }
}

fn request_error(e: reqwest::Error) -> BaliseError {
    BaliseError::api("github", e.status().map_or(0, |s| s.as_u16()), e.to_string())
}

fn urlencode(s: &str) -> String {
    url::form_urlencoded::byte_serialize(s.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector(api_base: String) -> GitHubConnector {
        GitHubConnector::new(ConnectorSettings {
            kind: Some(ProviderKind::GitHub),
            instance_base_url: None,
            client_id: Some("client".into()),
            client_secret: Some("secret".into()),
            callback_url: Some("https://registry.example.com/callback".into()),
            tenant_id: None,
        })
        .unwrap()
        .with_api_base_url(api_base)
    }

    #[tokio::test]
    async fn fetch_repository_maps_404_to_repo_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = connector(server.uri())
            .fetch_repository("token", "acme", "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, BaliseError::RepoNotFound { .. }));
    }

    #[tokio::test]
    async fn fetch_tag_by_name_dereferences_annotated_tags() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/mod/git/ref/tags/v1.0.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": {"sha": "tagobj", "type": "tag"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/repos/acme/mod/git/tags/tagobj"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "object": {"sha": "deadbeef", "type": "commit"}
            })))
            .mount(&server)
            .await;

        let tag = connector(server.uri())
            .fetch_tag_by_name("token", "acme", "mod", "refs/tags/v1.0.0")
            .await
            .unwrap();
        assert_eq!(tag.name, "v1.0.0");
        assert_eq!(tag.commit_sha, "deadbeef");
    }

    #[tokio::test]
    async fn upstream_errors_carry_status_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/repos"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = connector(server.uri())
            .fetch_repositories("token", Page::default())
            .await
            .unwrap_err();
        match err {
            BaliseError::Api { status, message, .. } => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn delivery_signature_round_trip() {
        let connector = connector("http://unused".into());
        let body = br#"{"ref":"refs/tags/v1.0.0"}"#;
        let signature = format!("sha256={}", hmac_sha256_hex("hook-secret", body));
        let headers = vec![("X-Hub-Signature-256".to_string(), signature)];
        assert!(connector
            .verify_delivery_signature(&headers, body, "hook-secret")
            .is_ok());
        assert!(connector
            .verify_delivery_signature(&headers, body, "wrong-secret")
            .is_err());
    }

    #[test]
    fn push_delivery_parses_repo_and_ref() {
        let connector = connector("http://unused".into());
        let body = serde_json::to_vec(&json!({
            "ref": "refs/tags/v2.1.0",
            "after": "abc123",
            "repository": {"name": "vpc", "owner": {"login": "acme"}}
        }))
        .unwrap();
        let headers = vec![("X-GitHub-Event".to_string(), "push".to_string())];
        let delivery = connector.parse_delivery(&headers, &body).unwrap();
        assert_eq!(delivery.repo_owner, "acme");
        assert_eq!(delivery.repo_name, "vpc");
        assert_eq!(delivery.ref_name.as_deref(), Some("v2.1.0"));
        assert_eq!(delivery.commit_sha.as_deref(), Some("abc123"));
    }
}
