//! Azure DevOps connector.
//!
//! Peculiarities this connector has to absorb:
//! - The instance base URL carries the organization as its first path
//!   segment (`https://dev.azure.com/acme`); host and organization are
//!   addressed separately.
//! - OAuth is Entra-ID based; authorization and token endpoints are
//!   tenant-specific and the resource id is fixed.
//! - The item-download endpoint needs `versionType=commit` for 40-hex
//!   SHAs and `versionType=branch` for everything else.
//! - Expired tokens sometimes come back as HTTP 203 (a sign-in page), not
//!   401; responses are normalized so token refresh still triggers.
//! - Archives are only served as zip; tarball requests are converted
//!   in-process.

use async_trait::async_trait;
use azure_devops_rust_api::core::models::TeamProjectReferenceList;
use azure_devops_rust_api::git::models::GitRepositoryList;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::error::{BaliseError, Result};
use crate::types::AccessToken;
use super::{
    api_client, canonicalize_ref, constant_time_eq, header_value, ArchiveKind, BranchRef,
    CommitInfo, Connector, ConnectorSettings, Page, ProviderKind, RemoteRepository, TagRef,
    WebhookDelivery,
};

/// Well-known Azure DevOps resource id used in Entra scopes.
const ADO_RESOURCE_ID: &str = "499b84ac-1321-427f-aa17-267ca6975798";
const API_VERSION: &str = "7.1";

#[derive(Debug)]
pub struct AzureDevOpsConnector {
    settings: ConnectorSettings,
    client: reqwest::Client,
    /// Host part, e.g. `https://dev.azure.com`.
    host: String,
    /// Organization parsed off the instance URL path.
    organization: String,
}

impl AzureDevOpsConnector {
    pub fn new(settings: ConnectorSettings) -> Result<Self> {
        let instance = settings
            .instance_base_url
            .clone()
            .unwrap_or_else(|| "https://dev.azure.com".to_string());
        let (host, organization) = split_instance_url(&instance)?;
        Ok(Self {
            settings,
            client: api_client(),
            host,
            organization,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_host(mut self, host: String, organization: String) -> Self {
        self.host = host.trim_end_matches('/').to_string();
        self.organization = organization;
        self
    }

    fn org_url(&self, path: &str) -> String {
        format!("{}/{}{path}", self.host, self.organization)
    }

    fn get(&self, token: &str, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("Authorization", format!("Bearer {token}"))
            .header("Accept", "application/json")
    }

    /// Normalize the 203-instead-of-401 behaviour and map error bodies.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status().as_u16();
        if status == 203 {
            // An HTML sign-in page in a 203 wrapper means the token is no
            // longer accepted.
            return Err(BaliseError::api("azuredevops", 401, "unauthenticated (normalized from 203)"));
        }
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(BaliseError::api("azuredevops", status, body));
        }
        Ok(response)
    }

    async fn list_projects(&self, token: &str) -> Result<Vec<String>> {
        let url = format!(
            "{}/{}/_apis/projects?api-version={API_VERSION}&$top=100",
            self.host, self.organization
        );
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        let response = Self::check(response).await?;
        let projects: TeamProjectReferenceList =
            response.json().await.map_err(request_error)?;
        Ok(projects.value.into_iter().map(|p| p.name).collect())
    }

    async fn list_project_repos(&self, token: &str, project: &str) -> Result<Vec<RemoteRepository>> {
        let url = self.org_url(&format!("/{project}/_apis/git/repositories?api-version={API_VERSION}"));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        let response = Self::check(response).await?;
        let repos: GitRepositoryList = response.json().await.map_err(request_error)?;
        Ok(repos
            .value
            .into_iter()
            .map(|r| RemoteRepository {
                owner: project.to_string(),
                name: r.name,
                clone_url: r.web_url.unwrap_or_default(),
                default_branch: r
                    .default_branch
                    .map(|b| canonicalize_ref(&b).to_string())
                    .unwrap_or_else(|| "main".to_string()),
                archived: r.is_disabled.unwrap_or(false),
                fork: r.is_fork.unwrap_or(false),
                platform_id: r.id,
            })
            .collect())
    }

    /// All repositories across all projects; the list endpoints paginate
    /// in-memory because the service has no cross-project listing.
    async fn all_repositories(&self, token: &str) -> Result<Vec<RemoteRepository>> {
        let mut repos = Vec::new();
        for project in self.list_projects(token).await? {
            match self.list_project_repos(token, &project).await {
                Ok(project_repos) => repos.extend(project_repos),
                Err(e) => {
                    tracing::warn!(project = %project, error = %e, "Failed to list repositories in project");
                }
            }
        }
        Ok(repos)
    }

    async fn fetch_refs(&self, token: &str, owner: &str, name: &str, filter: &str) -> Result<Vec<AdoRef>> {
        let url = self.org_url(&format!(
            "/{owner}/_apis/git/repositories/{name}/refs?filter={filter}&api-version={API_VERSION}"
        ));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        let response = Self::check(response).await?;
        let refs: AdoRefList = response.json().await.map_err(request_error)?;
        Ok(refs.value)
    }
}

/// Split `https://dev.azure.com/acme` into host and organization.
fn split_instance_url(instance: &str) -> Result<(String, String)> {
    let parsed = url::Url::parse(instance).map_err(|e| BaliseError::ConfigValue {
        key: "instance_base_url".to_string(),
        message: format!("not a URL: {e}"),
    })?;
    let host = format!(
        "{}://{}",
        parsed.scheme(),
        parsed.host_str().unwrap_or_default()
    );
    let organization = parsed
        .path_segments()
        .and_then(|mut segments| segments.next())
        .unwrap_or_default()
        .to_string();
    if organization.is_empty() {
        return Err(BaliseError::ConfigValue {
            key: "instance_base_url".to_string(),
            message: "Azure DevOps instance URL must include the organization as its first path segment"
                .to_string(),
        });
    }
    Ok((host, organization))
}

/// Whether a ref is a full 40-character hex commit SHA.
fn is_commit_sha(git_ref: &str) -> bool {
    git_ref.len() == 40 && git_ref.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Deserialize)]
struct AdoRefList {
    value: Vec<AdoRef>,
}

#[derive(Debug, Deserialize)]
struct AdoRef {
    name: String,
    #[serde(rename = "objectId")]
    object_id: String,
    /// Commit behind an annotated tag object, when the API peels it.
    #[serde(rename = "peeledObjectId")]
    peeled_object_id: Option<String>,
}

impl AdoRef {
    fn commit_sha(&self) -> String {
        self.peeled_object_id
            .clone()
            .unwrap_or_else(|| self.object_id.clone())
    }
}

#[derive(Debug, Deserialize)]
struct AdoCommit {
    #[serde(rename = "commitId")]
    commit_id: String,
    #[serde(default)]
    comment: String,
    author: Option<AdoCommitAuthor>,
}

#[derive(Debug, Deserialize)]
struct AdoCommitAuthor {
    name: String,
    email: String,
    date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct AdoSubscription {
    id: String,
}

#[derive(Debug, Deserialize)]
struct EntraTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    #[serde(default)]
    scope: String,
}

#[async_trait]
impl Connector for AzureDevOpsConnector {
    fn platform(&self) -> ProviderKind {
        ProviderKind::AzureDevOps
    }

    fn authorization_endpoint(&self, state: &str, scopes: &[String]) -> Result<String> {
        let tenant = self.settings.tenant_id.as_deref().ok_or_else(|| BaliseError::ConfigMissing {
            key: "tenant_id".to_string(),
        })?;
        let scope = if scopes.is_empty() {
            format!("{ADO_RESOURCE_ID}/.default offline_access")
        } else {
            scopes.join(" ")
        };
        let mut url = url::Url::parse(&format!(
            "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/authorize"
        ))
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
        let tenant = self.settings.tenant_id.as_deref().ok_or_else(|| BaliseError::ConfigMissing {
            key: "tenant_id".to_string(),
        })?;
        let response = self
            .client
            .post(format!(
                "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token"
            ))
            .form(&[
                ("client_id", self.settings.client_id.as_deref().unwrap_or_default()),
                ("client_secret", self.settings.client_secret.as_deref().unwrap_or_default()),
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.settings.callback_url.as_deref().unwrap_or_default()),
                ("scope", &format!("{ADO_RESOURCE_ID}/.default offline_access")),
            ])
            .send()
            .await
            .map_err(|e| BaliseError::AuthCodeExchangeFailed {
                platform: "azuredevops".to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BaliseError::AuthCodeExchangeFailed {
                platform: "azuredevops".to_string(),
                message: format!("status {status}: {body}"),
            });
        }
        let token: EntraTokenResponse =
            response.json().await.map_err(|e| BaliseError::AuthCodeExchangeFailed {
                platform: "azuredevops".to_string(),
                message: format!("unparseable token response: {e}"),
            })?;
        Ok(AccessToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            scopes: token.scope.split(' ').filter(|s| !s.is_empty()).map(str::to_string).collect(),
        })
    }

    async fn renew_token(&self, refresh_token: &str) -> Result<AccessToken> {
        let tenant = self.settings.tenant_id.as_deref().ok_or_else(|| BaliseError::ConfigMissing {
            key: "tenant_id".to_string(),
        })?;
        let response = self
            .client
            .post(format!(
                "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token"
            ))
            .form(&[
                ("client_id", self.settings.client_id.as_deref().unwrap_or_default()),
                ("client_secret", self.settings.client_secret.as_deref().unwrap_or_default()),
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("scope", &format!("{ADO_RESOURCE_ID}/.default offline_access")),
            ])
            .send()
            .await
            .map_err(|e| BaliseError::TokenRefreshFailed {
                platform: "azuredevops".to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BaliseError::TokenRefreshFailed {
                platform: "azuredevops".to_string(),
                message: format!("status {status}: {body}"),
            });
        }
        let token: EntraTokenResponse =
            response.json().await.map_err(|e| BaliseError::TokenRefreshFailed {
                platform: "azuredevops".to_string(),
                message: format!("unparseable token response: {e}"),
            })?;
        Ok(AccessToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: token
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            scopes: token.scope.split(' ').filter(|s| !s.is_empty()).map(str::to_string).collect(),
        })
    }

    async fn fetch_repositories(&self, token: &str, page: Page) -> Result<Vec<RemoteRepository>> {
        let page = page.normalized();
        let all = self.all_repositories(token).await?;
        let start = ((page.page - 1) * page.per_page) as usize;
        Ok(all
            .into_iter()
            .skip(start)
            .take(page.per_page as usize)
            .collect())
    }

    async fn fetch_repository(&self, token: &str, owner: &str, name: &str) -> Result<RemoteRepository> {
        let url = self.org_url(&format!(
            "/{owner}/_apis/git/repositories/{name}?api-version={API_VERSION}"
        ));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if response.status().as_u16() == 404 {
            return Err(BaliseError::RepoNotFound {
                owner: owner.to_string(),
                name: name.to_string(),
            });
        }
        let response = Self::check(response).await?;
        let repo: azure_devops_rust_api::git::models::GitRepository =
            response.json().await.map_err(request_error)?;
        Ok(RemoteRepository {
            owner: owner.to_string(),
            name: repo.name,
            clone_url: repo.web_url.unwrap_or_default(),
            default_branch: repo
                .default_branch
                .map(|b| canonicalize_ref(&b).to_string())
                .unwrap_or_else(|| "main".to_string()),
            archived: repo.is_disabled.unwrap_or(false),
            fork: repo.is_fork.unwrap_or(false),
            platform_id: repo.id,
        })
    }

    async fn search_repositories(
        &self,
        token: &str,
        query: &str,
        page: Page,
    ) -> Result<Vec<RemoteRepository>> {
        // No native repository search: filter in-memory across projects.
        let page = page.normalized();
        let needle = query.to_lowercase();
        let matches: Vec<RemoteRepository> = self
            .all_repositories(token)
            .await?
            .into_iter()
            .filter(|r| r.name.to_lowercase().contains(&needle))
            .collect();
        let start = ((page.page - 1) * page.per_page) as usize;
        Ok(matches
            .into_iter()
            .skip(start)
            .take(page.per_page as usize)
            .collect())
    }

    async fn fetch_branches(&self, token: &str, owner: &str, name: &str, page: Page) -> Result<Vec<BranchRef>> {
        let page = page.normalized();
        let refs = self.fetch_refs(token, owner, name, "heads/").await?;
        let start = ((page.page - 1) * page.per_page) as usize;
        Ok(refs
            .into_iter()
            .skip(start)
            .take(page.per_page as usize)
            .map(|r| BranchRef {
                name: canonicalize_ref(&r.name).to_string(),
                commit_sha: r.commit_sha(),
            })
            .collect())
    }

    async fn fetch_tags(&self, token: &str, owner: &str, name: &str, page: Page) -> Result<Vec<TagRef>> {
        let page = page.normalized();
        let refs = self.fetch_refs(token, owner, name, "tags/").await?;
        let start = ((page.page - 1) * page.per_page) as usize;
        Ok(refs
            .into_iter()
            .skip(start)
            .take(page.per_page as usize)
            .map(|r| TagRef {
                name: canonicalize_ref(&r.name).to_string(),
                commit_sha: r.commit_sha(),
            })
            .collect())
    }

    async fn fetch_tag_by_name(&self, token: &str, owner: &str, name: &str, tag: &str) -> Result<TagRef> {
        let tag = canonicalize_ref(tag);
        let refs = self.fetch_refs(token, owner, name, &format!("tags/{tag}")).await?;
        let matched = refs
            .into_iter()
            .find(|r| canonicalize_ref(&r.name) == tag)
            .ok_or_else(|| BaliseError::TagNotFound { tag: tag.to_string() })?;
        Ok(TagRef {
            name: tag.to_string(),
            commit_sha: matched.commit_sha(),
        })
    }

    async fn fetch_commit(&self, token: &str, owner: &str, name: &str, sha: &str) -> Result<CommitInfo> {
        let url = self.org_url(&format!(
            "/{owner}/_apis/git/repositories/{name}/commits/{sha}?api-version={API_VERSION}"
        ));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if response.status().as_u16() == 404 {
            return Err(BaliseError::CommitNotFound { sha: sha.to_string() });
        }
        let response = Self::check(response).await?;
        let commit: AdoCommit = response.json().await.map_err(request_error)?;
        Ok(CommitInfo {
            sha: commit.commit_id,
            message: commit.comment,
            author_name: commit.author.as_ref().map(|a| a.name.clone()).unwrap_or_default(),
            author_email: commit.author.as_ref().map(|a| a.email.clone()).unwrap_or_default(),
            authored_at: commit.author.and_then(|a| a.date),
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
        // 40-hex refs address a commit; anything else is a branch name.
        let version_type = if is_commit_sha(git_ref) { "commit" } else { "branch" };
        let url = self.org_url(&format!(
            "/{owner}/_apis/git/repositories/{name}/items?path=/&versionDescriptor.version={git_ref}&versionDescriptor.versionType={version_type}&$format=zip&download=true&api-version={API_VERSION}"
        ));
        let response = self
            .get(token, &url)
            .header("Accept", "application/zip")
            .send()
            .await
            .map_err(|e| BaliseError::ArchiveDownloadFailed { message: e.to_string() })?;
        let status = response.status().as_u16();
        if status == 203 {
            return Err(BaliseError::api("azuredevops", 401, "unauthenticated (normalized from 203)"));
        }
        if !(200..300).contains(&status) {
            return Err(BaliseError::ArchiveDownloadFailed {
                message: format!("azure devops returned status {status}"),
            });
        }
        let zip_bytes = response
            .bytes()
            .await
            .map_err(|e| BaliseError::ArchiveDownloadFailed { message: e.to_string() })?;

        match kind {
            ArchiveKind::Zip => Ok(zip_bytes),
            // The service only serves zip; convert in-process.
            ArchiveKind::TarGz => super::archive::zip_to_tar_gz(&zip_bytes),
        }
    }

    async fn register_webhook(
        &self,
        token: &str,
        owner: &str,
        name: &str,
        callback_url: &str,
        secret: &str,
    ) -> Result<String> {
        let url = self.org_url(&format!("/_apis/hooks/subscriptions?api-version={API_VERSION}"));
        let body = serde_json::json!({
            "publisherId": "tfs",
            "eventType": "git.push",
            "consumerId": "webHooks",
            "consumerActionId": "httpRequest",
            "publisherInputs": {
                "projectId": owner,
                "repository": name,
            },
            "consumerInputs": {
                "url": callback_url,
                "basicAuthUsername": "balise",
                "basicAuthPassword": secret,
            }
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
        let subscription: AdoSubscription = response
            .json()
            .await
            .map_err(|e| BaliseError::WebhookCreationFailed { message: e.to_string() })?;
        Ok(subscription.id)
    }

    async fn remove_webhook(&self, token: &str, _owner: &str, _name: &str, webhook_id: &str) -> Result<()> {
        let url = self.org_url(&format!(
            "/_apis/hooks/subscriptions/{webhook_id}?api-version={API_VERSION}"
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
            s if !(200..300).contains(&s) => Err(Self::check(response).await.unwrap_err()),
            _ => Ok(()),
        }
    }

    fn parse_delivery(&self, _headers: &[(String, String)], body: &[u8]) -> Result<WebhookDelivery> {
        let payload: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| BaliseError::PayloadInvalid {
                message: format!("not JSON: {e}"),
            })?;
        let event = payload
            .get("eventType")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("git.push")
            .to_string();
        let repo_name = payload
            .pointer("/resource/repository/name")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| BaliseError::PayloadInvalid {
                message: "missing resource.repository.name".to_string(),
            })?
            .to_string();
        let repo_owner = payload
            .pointer("/resource/repository/project/name")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let ref_name = payload
            .pointer("/resource/refUpdates/0/name")
            .and_then(serde_json::Value::as_str)
            .map(|r| canonicalize_ref(r).to_string());
        let commit_sha = payload
            .pointer("/resource/refUpdates/0/newObjectId")
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
        // Service hooks authenticate with the basic credential configured
        // at registration time, not an HMAC.
        let authorization = header_value(headers, "Authorization").ok_or(BaliseError::SignatureInvalid)?;
        let expected = format!("Basic {}", BASE64.encode(format!("balise:{secret}")));
        if constant_time_eq(authorization.as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            Err(BaliseError::SignatureInvalid)
        }
    }
}

fn request_error(e: reqwest::Error) -> BaliseError {
    BaliseError::api("azuredevops", e.status().map_or(0, |s| s.as_u16()), e.to_string())
}
