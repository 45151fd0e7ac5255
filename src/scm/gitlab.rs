//! GitLab connector.
//!
//! Works against gitlab.com and self-managed instances. Projects are
//! addressed as URL-encoded `owner%2Fname` paths. Webhook deliveries
//! carry the shared secret verbatim in `X-Gitlab-Token`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{BaliseError, Result};
use crate::types::AccessToken;
use super::{
    api_client, api_error, canonicalize_ref, constant_time_eq, header_value, ArchiveKind,
    BranchRef, CommitInfo, Connector, ConnectorSettings, Page, ProviderKind, RemoteRepository,
    TagRef, WebhookDelivery,
};

const DEFAULT_SCOPES: &str = "api read_user";

pub struct GitLabConnector {
    settings: ConnectorSettings,
    client: reqwest::Client,
    base: String,
}

impl GitLabConnector {
    pub fn new(settings: ConnectorSettings) -> Result<Self> {
        let base = settings
            .instance_base_url
            .clone()
            .unwrap_or_else(|| "https://gitlab.com".to_string())
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
            settings,
            client: api_client(),
            base,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(mut self, base: String) -> Self {
        self.base = base.trim_end_matches('/').to_string();
        self
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/v4{path}", self.base)
    }

    fn project_id(owner: &str, name: &str) -> String {
        format!("{owner}%2F{name}")
    }

    fn get(&self, token: &str, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("Authorization", format!("Bearer {token}"))
    }

    async fn token_request(&self, params: &[(&str, &str)], refresh: bool) -> Result<AccessToken> {
        let map_err = |message: String| {
            if refresh {
                BaliseError::TokenRefreshFailed {
                    platform: "gitlab".to_string(),
                    message,
                }
            } else {
                BaliseError::AuthCodeExchangeFailed {
                    platform: "gitlab".to_string(),
                    message,
                }
            }
        };
        let response = self
            .client
            .post(format!("{}/oauth/token", self.base))
            .form(params)
            .send()
            .await
            .map_err(|e| map_err(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(map_err(format!("status {status}: {body}")));
        }
        let token: GitLabTokenResponse = response
            .json()
            .await
            .map_err(|e| map_err(format!("unparseable token response: {e}")))?;
        Ok(token.into_access_token())
    }
}

#[derive(Debug, Deserialize)]
struct GitLabProject {
    id: u64,
    path: String,
    namespace: GitLabNamespace,
    http_url_to_repo: String,
    default_branch: Option<String>,
    #[serde(default)]
    archived: bool,
    forked_from_project: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GitLabNamespace {
    full_path: String,
}

impl From<GitLabProject> for RemoteRepository {
    fn from(p: GitLabProject) -> Self {
        Self {
            owner: p.namespace.full_path,
            name: p.path,
            clone_url: p.http_url_to_repo,
            default_branch: p.default_branch.unwrap_or_else(|| "main".to_string()),
            archived: p.archived,
            fork: p.forked_from_project.is_some(),
            platform_id: p.id.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitLabBranch {
    name: String,
    commit: GitLabCommitPointer,
}

#[derive(Debug, Deserialize)]
struct GitLabTag {
    name: String,
    commit: GitLabCommitPointer,
}

#[derive(Debug, Deserialize)]
struct GitLabCommitPointer {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GitLabCommit {
    id: String,
    message: String,
    author_name: String,
    author_email: String,
    authored_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct GitLabTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    #[serde(default)]
    scope: String,
}

impl GitLabTokenResponse {
    fn into_access_token(self) -> AccessToken {
        AccessToken {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            expires_at: self
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            scopes: self
                .scope
                .split([' ', ','])
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitLabHook {
    id: u64,
}

#[async_trait]
impl Connector for GitLabConnector {
    fn platform(&self) -> ProviderKind {
        ProviderKind::GitLab
    }

    fn authorization_endpoint(&self, state: &str, scopes: &[String]) -> Result<String> {
        let scope = if scopes.is_empty() {
            DEFAULT_SCOPES.to_string()
        } else {
            scopes.join(" ")
        };
        let mut url = url::Url::parse(&format!("{}/oauth/authorize", self.base))
            .map_err(|e| BaliseError::internal(format!("authorize URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client_id", self.settings.client_id.as_deref().unwrap_or_default())
            .append_pair("redirect_uri", self.settings.callback_url.as_deref().unwrap_or_default())
            .append_pair("response_type", "code")
            .append_pair("scope", &scope)
            .append_pair("state", state);
        Ok(url.into())
    }

    async fn complete_authorization(&self, code: &str) -> Result<AccessToken> {
        self.token_request(
            &[
                ("client_id", self.settings.client_id.as_deref().unwrap_or_default()),
                ("client_secret", self.settings.client_secret.as_deref().unwrap_or_default()),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.settings.callback_url.as_deref().unwrap_or_default()),
            ],
            false,
        )
        .await
    }

    async fn renew_token(&self, refresh_token: &str) -> Result<AccessToken> {
        self.token_request(
            &[
                ("client_id", self.settings.client_id.as_deref().unwrap_or_default()),
                ("client_secret", self.settings.client_secret.as_deref().unwrap_or_default()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ],
            true,
        )
        .await
    }

    async fn fetch_repositories(&self, token: &str, page: Page) -> Result<Vec<RemoteRepository>> {
        let page = page.normalized();
        let url = self.api(&format!(
            "/projects?membership=true&page={}&per_page={}",
            page.page, page.per_page
        ));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::GitLab, response).await);
        }
        let projects: Vec<GitLabProject> = response.json().await.map_err(request_error)?;
        Ok(projects.into_iter().map(Into::into).collect())
    }

    async fn fetch_repository(&self, token: &str, owner: &str, name: &str) -> Result<RemoteRepository> {
        let url = self.api(&format!("/projects/{}", Self::project_id(owner, name)));
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
            s if !(200..300).contains(&s) => Err(api_error(ProviderKind::GitLab, response).await),
            _ => {
                let project: GitLabProject = response.json().await.map_err(request_error)?;
                Ok(project.into())
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
        let url = self.api(&format!(
            "/projects?membership=true&search={}&page={}&per_page={}",
            url::form_urlencoded::byte_serialize(query.as_bytes()).collect::<String>(),
            page.page,
            page.per_page
        ));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::GitLab, response).await);
        }
        let projects: Vec<GitLabProject> = response.json().await.map_err(request_error)?;
        Ok(projects.into_iter().map(Into::into).collect())
    }

    async fn fetch_branches(&self, token: &str, owner: &str, name: &str, page: Page) -> Result<Vec<BranchRef>> {
        let page = page.normalized();
        let url = self.api(&format!(
            "/projects/{}/repository/branches?page={}&per_page={}",
            Self::project_id(owner, name),
            page.page,
            page.per_page
        ));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::GitLab, response).await);
        }
        let branches: Vec<GitLabBranch> = response.json().await.map_err(request_error)?;
        Ok(branches
            .into_iter()
            .map(|b| BranchRef {
                name: canonicalize_ref(&b.name).to_string(),
                commit_sha: b.commit.id,
            })
            .collect())
    }

    async fn fetch_tags(&self, token: &str, owner: &str, name: &str, page: Page) -> Result<Vec<TagRef>> {
        let page = page.normalized();
        let url = self.api(&format!(
            "/projects/{}/repository/tags?page={}&per_page={}",
            Self::project_id(owner, name),
            page.page,
            page.per_page
        ));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::GitLab, response).await);
        }
        let tags: Vec<GitLabTag> = response.json().await.map_err(request_error)?;
        Ok(tags
            .into_iter()
            .map(|t| TagRef {
                name: canonicalize_ref(&t.name).to_string(),
                commit_sha: t.commit.id,
            })
            .collect())
    }

    async fn fetch_tag_by_name(&self, token: &str, owner: &str, name: &str, tag: &str) -> Result<TagRef> {
        let tag = canonicalize_ref(tag);
        let url = self.api(&format!(
            "/projects/{}/repository/tags/{tag}",
            Self::project_id(owner, name)
        ));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if response.status().as_u16() == 404 {
            return Err(BaliseError::TagNotFound { tag: tag.to_string() });
        }
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::GitLab, response).await);
        }
        let parsed: GitLabTag = response.json().await.map_err(request_error)?;
        Ok(TagRef {
            name: canonicalize_ref(&parsed.name).to_string(),
            commit_sha: parsed.commit.id,
        })
    }

    async fn fetch_commit(&self, token: &str, owner: &str, name: &str, sha: &str) -> Result<CommitInfo> {
        let url = self.api(&format!(
            "/projects/{}/repository/commits/{sha}",
            Self::project_id(owner, name)
        ));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if response.status().as_u16() == 404 {
            return Err(BaliseError::CommitNotFound { sha: sha.to_string() });
        }
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::GitLab, response).await);
        }
        let commit: GitLabCommit = response.json().await.map_err(request_error)?;
        Ok(CommitInfo {
            sha: commit.id,
            message: commit.message,
            author_name: commit.author_name,
            author_email: commit.author_email,
            authored_at: commit.authored_date,
        })
    }

    async fn download_source_archive(
        &self,
        token: &str,
        owner: &str,
        name: &str,
        git_ref: &str,
        kind: ArchiveKind,
    ) -> Result<Bytes> {
        let extension = match kind {
            ArchiveKind::TarGz => "tar.gz",
            ArchiveKind::Zip => "zip",
        };
        let url = self.api(&format!(
            "/projects/{}/repository/archive.{extension}?sha={git_ref}",
            Self::project_id(owner, name)
        ));
        let response = self.get(token, &url).send().await.map_err(|e| {
            BaliseError::ArchiveDownloadFailed { message: e.to_string() }
        })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(BaliseError::ArchiveDownloadFailed {
                message: format!("gitlab returned status {status}"),
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
        let url = self.api(&format!("/projects/{}/hooks", Self::project_id(owner, name)));
        let body = serde_json::json!({
            "url": callback_url,
            "push_events": true,
            "tag_push_events": true,
            "token": secret,
        });
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {token}"))
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
        let hook: GitLabHook = response
            .json()
            .await
            .map_err(|e| BaliseError::WebhookCreationFailed { message: e.to_string() })?;
        Ok(hook.id.to_string())
    }

    async fn remove_webhook(&self, token: &str, owner: &str, name: &str, webhook_id: &str) -> Result<()> {
        let url = self.api(&format!(
            "/projects/{}/hooks/{webhook_id}",
            Self::project_id(owner, name)
        ));
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
            s if !(200..300).contains(&s) => Err(api_error(ProviderKind::GitLab, response).await),
            _ => Ok(()),
        }
    }

    fn parse_delivery(&self, headers: &[(String, String)], body: &[u8]) -> Result<WebhookDelivery> {
        let event = header_value(headers, "X-Gitlab-Event")
            .unwrap_or("Push Hook")
            .to_string();
        let payload: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| BaliseError::PayloadInvalid {
                message: format!("not JSON: {e}"),
            })?;
        let full_path = payload
            .pointer("/project/path_with_namespace")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| BaliseError::PayloadInvalid {
                message: "missing project.path_with_namespace".to_string(),
            })?;
        let (repo_owner, repo_name) = full_path
            .rsplit_once('/')
            .map(|(o, n)| (o.to_string(), n.to_string()))
            .unwrap_or_else(|| (String::new(), full_path.to_string()));
        let ref_name = payload
            .get("ref")
            .and_then(serde_json::Value::as_str)
            .map(|r| canonicalize_ref(r).to_string());
        let commit_sha = payload
            .get("checkout_sha")
            .or_else(|| payload.get("after"))
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
        _body: &[u8],
        secret: &str,
    ) -> Result<()> {
        // GitLab sends the shared secret itself, not an HMAC.
        let presented = header_value(headers, "X-Gitlab-Token").ok_or(BaliseError::SignatureInvalid)?;
        if constant_time_eq(presented.as_bytes(), secret.as_bytes()) {
            Ok(())
        } else {
            Err(BaliseError::SignatureInvalid)
        }
    }
}

fn request_error(e: reqwest::Error) -> BaliseError {
    BaliseError::api("gitlab", e.status().map_or(0, |s| s.as_u16()), e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn connector(base: String) -> GitLabConnector {
        GitLabConnector::new(ConnectorSettings {
            kind: Some(ProviderKind::GitLab),
            instance_base_url: None,
            client_id: Some("client".into()),
            client_secret: Some("secret".into()),
            callback_url: Some("https://registry.example.com/callback".into()),
            tenant_id: None,
        })
        .unwrap()
        .with_base_url(base)
    }

    #[tokio::test]
    async fn fetch_tag_by_name_strips_ref_prefix() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/acme%2Fvpc/repository/tags/v1.0.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "v1.0.0",
                "commit": {"id": "cafebabe"}
            })))
            .mount(&server)
            .await;

        let tag = connector(server.uri())
            .fetch_tag_by_name("token", "acme", "vpc", "refs/tags/v1.0.0")
            .await
            .unwrap();
        assert_eq!(tag.name, "v1.0.0");
        assert_eq!(tag.commit_sha, "cafebabe");
    }

    #[tokio::test]
    async fn missing_tag_maps_to_tag_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v4/projects/acme%2Fvpc/repository/tags/v9.9.9"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = connector(server.uri())
            .fetch_tag_by_name("token", "acme", "vpc", "v9.9.9")
            .await
            .unwrap_err();
        assert!(matches!(err, BaliseError::TagNotFound { .. }));
    }

    #[test]
    fn token_header_verification_is_equality() {
        let connector = connector("http://unused".into());
        let headers = vec![("X-Gitlab-Token".to_string(), "hook-secret".to_string())];
        assert!(connector.verify_delivery_signature(&headers, b"{}", "hook-secret").is_ok());
        assert!(connector.verify_delivery_signature(&headers, b"{}", "other").is_err());
    }

    #[test]
    fn delivery_splits_namespace_path() {
        let connector = connector("http://unused".into());
        let body = serde_json::to_vec(&json!({
            "ref": "refs/heads/main",
            "checkout_sha": "1234",
            "project": {"path_with_namespace": "group/subgroup/vpc"}
        }))
        .unwrap();
        let delivery = connector.parse_delivery(&[], &body).unwrap();
        assert_eq!(delivery.repo_owner, "group/subgroup");
        assert_eq!(delivery.repo_name, "vpc");
        assert_eq!(delivery.ref_name.as_deref(), Some("main"));
    }
}
