//! Bitbucket Data Center connector.
//!
//! PAT-based: the instance never participates in OAuth, so the consent
//! and token operations fail with `PatRequired` and callers pass HTTP
//! access tokens straight through. Owners are project keys. Webhook
//! deliveries are signed with HMAC-SHA-256 in `X-Hub-Signature`.

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use crate::error::{BaliseError, Result};
use crate::types::AccessToken;
use super::{
    api_client, api_error, canonicalize_ref, constant_time_eq, header_value, hmac_sha256_hex,
    ArchiveKind, BranchRef, CommitInfo, Connector, ConnectorSettings, Page, ProviderKind,
    RemoteRepository, TagRef, WebhookDelivery,
};

pub struct BitbucketConnector {
    client: reqwest::Client,
    base: String,
}

impl BitbucketConnector {
    pub fn new(settings: ConnectorSettings) -> Result<Self> {
        let base = settings
            .instance_base_url
            .ok_or_else(|| BaliseError::ConfigMissing {
                key: "instance_base_url".to_string(),
            })?
            .trim_end_matches('/')
            .to_string();
        Ok(Self {
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
        format!("{}/rest/api/1.0{path}", self.base)
    }

    fn get(&self, token: &str, url: &str) -> reqwest::RequestBuilder {
        self.client
            .get(url)
            .header("Authorization", format!("Bearer {token}"))
    }
}

#[derive(Debug, Deserialize)]
struct BitbucketPage<T> {
    values: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct BitbucketRepository {
    id: u64,
    slug: String,
    project: BitbucketProject,
    #[serde(default)]
    origin: Option<serde_json::Value>,
    #[serde(default)]
    archived: bool,
    links: Option<BitbucketLinks>,
    #[serde(rename = "defaultBranch")]
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BitbucketProject {
    key: String,
}

#[derive(Debug, Deserialize)]
struct BitbucketLinks {
    #[serde(default)]
    clone: Vec<BitbucketCloneLink>,
}

#[derive(Debug, Deserialize)]
struct BitbucketCloneLink {
    href: String,
    name: String,
}

impl From<BitbucketRepository> for RemoteRepository {
    fn from(r: BitbucketRepository) -> Self {
        let clone_url = r
            .links
            .as_ref()
            .and_then(|links| links.clone.iter().find(|l| l.name == "http"))
            .map(|l| l.href.clone())
            .unwrap_or_default();
        Self {
            owner: r.project.key,
            name: r.slug,
            clone_url,
            default_branch: r
                .default_branch
                .map(|b| canonicalize_ref(&b).to_string())
                .unwrap_or_else(|| "main".to_string()),
            archived: r.archived,
            fork: r.origin.is_some(),
            platform_id: r.id.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BitbucketRef {
    #[serde(rename = "displayId")]
    display_id: String,
    #[serde(rename = "latestCommit")]
    latest_commit: String,
}

#[derive(Debug, Deserialize)]
struct BitbucketCommit {
    id: String,
    #[serde(default)]
    message: String,
    author: Option<BitbucketAuthor>,
    #[serde(rename = "authorTimestamp")]
    author_timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct BitbucketAuthor {
    name: String,
    #[serde(rename = "emailAddress", default)]
    email_address: String,
}

#[derive(Debug, Deserialize)]
struct BitbucketWebhook {
    id: u64,
}

#[async_trait]
impl Connector for BitbucketConnector {
    fn platform(&self) -> ProviderKind {
        ProviderKind::BitbucketDc
    }

    fn authorization_endpoint(&self, _state: &str, _scopes: &[String]) -> Result<String> {
        Err(BaliseError::PatRequired {
            kind: ProviderKind::BitbucketDc.to_string(),
        })
    }

    async fn complete_authorization(&self, _code: &str) -> Result<AccessToken> {
        Err(BaliseError::PatRequired {
            kind: ProviderKind::BitbucketDc.to_string(),
        })
    }

    async fn renew_token(&self, _refresh_token: &str) -> Result<AccessToken> {
        Err(BaliseError::PatRequired {
            kind: ProviderKind::BitbucketDc.to_string(),
        })
    }

    async fn fetch_repositories(&self, token: &str, page: Page) -> Result<Vec<RemoteRepository>> {
        let page = page.normalized();
        let start = (page.page - 1) * page.per_page;
        let url = self.api(&format!("/repos?start={start}&limit={}", page.per_page));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::BitbucketDc, response).await);
        }
        let repos: BitbucketPage<BitbucketRepository> =
            response.json().await.map_err(request_error)?;
        Ok(repos.values.into_iter().map(Into::into).collect())
    }

    async fn fetch_repository(&self, token: &str, owner: &str, name: &str) -> Result<RemoteRepository> {
        let url = self.api(&format!("/projects/{owner}/repos/{name}"));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        match response.status().as_u16() {
            404 => Err(BaliseError::RepoNotFound {
                owner: owner.to_string(),
                name: name.to_string(),
            }),
            401 | 403 => Err(BaliseError::RepoForbidden {
                owner: owner.to_string(),
                name: name.to_string(),
            }),
            s if !(200..300).contains(&s) => Err(api_error(ProviderKind::BitbucketDc, response).await),
            _ => {
                let repo: BitbucketRepository = response.json().await.map_err(request_error)?;
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
        let start = (page.page - 1) * page.per_page;
        let url = self.api(&format!(
            "/repos?name={}&start={start}&limit={}",
            url::form_urlencoded::byte_serialize(query.as_bytes()).collect::<String>(),
            page.per_page
        ));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::BitbucketDc, response).await);
        }
        let repos: BitbucketPage<BitbucketRepository> =
            response.json().await.map_err(request_error)?;
        Ok(repos.values.into_iter().map(Into::into).collect())
    }

    async fn fetch_branches(&self, token: &str, owner: &str, name: &str, page: Page) -> Result<Vec<BranchRef>> {
        let page = page.normalized();
        let start = (page.page - 1) * page.per_page;
        let url = self.api(&format!(
            "/projects/{owner}/repos/{name}/branches?start={start}&limit={}",
            page.per_page
        ));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::BitbucketDc, response).await);
        }
        let refs: BitbucketPage<BitbucketRef> = response.json().await.map_err(request_error)?;
        Ok(refs
            .values
            .into_iter()
            .map(|r| BranchRef {
                name: canonicalize_ref(&r.display_id).to_string(),
                commit_sha: r.latest_commit,
            })
            .collect())
    }

    async fn fetch_tags(&self, token: &str, owner: &str, name: &str, page: Page) -> Result<Vec<TagRef>> {
        let page = page.normalized();
        let start = (page.page - 1) * page.per_page;
        let url = self.api(&format!(
            "/projects/{owner}/repos/{name}/tags?start={start}&limit={}",
            page.per_page
        ));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::BitbucketDc, response).await);
        }
        let refs: BitbucketPage<BitbucketRef> = response.json().await.map_err(request_error)?;
        Ok(refs
            .values
            .into_iter()
            .map(|r| TagRef {
                name: canonicalize_ref(&r.display_id).to_string(),
                commit_sha: r.latest_commit,
            })
            .collect())
    }

    async fn fetch_tag_by_name(&self, token: &str, owner: &str, name: &str, tag: &str) -> Result<TagRef> {
        let tag = canonicalize_ref(tag);
        let url = self.api(&format!("/projects/{owner}/repos/{name}/tags/{tag}"));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if response.status().as_u16() == 404 {
            return Err(BaliseError::TagNotFound { tag: tag.to_string() });
        }
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::BitbucketDc, response).await);
        }
        let parsed: BitbucketRef = response.json().await.map_err(request_error)?;
        Ok(TagRef {
            name: canonicalize_ref(&parsed.display_id).to_string(),
            commit_sha: parsed.latest_commit,
        })
    }

    async fn fetch_commit(&self, token: &str, owner: &str, name: &str, sha: &str) -> Result<CommitInfo> {
        let url = self.api(&format!("/projects/{owner}/repos/{name}/commits/{sha}"));
        let response = self.get(token, &url).send().await.map_err(request_error)?;
        if response.status().as_u16() == 404 {
            return Err(BaliseError::CommitNotFound { sha: sha.to_string() });
        }
        if !response.status().is_success() {
            return Err(api_error(ProviderKind::BitbucketDc, response).await);
        }
        let commit: BitbucketCommit = response.json().await.map_err(request_error)?;
        Ok(CommitInfo {
            sha: commit.id,
            message: commit.message,
            author_name: commit.author.as_ref().map(|a| a.name.clone()).unwrap_or_default(),
            author_email: commit
                .author
                .as_ref()
                .map(|a| a.email_address.clone())
                .unwrap_or_default(),
            authored_at: commit
                .author_timestamp
                .and_then(chrono::DateTime::from_timestamp_millis),
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
        let format = match kind {
            ArchiveKind::TarGz => "tar.gz",
            ArchiveKind::Zip => "zip",
        };
        let url = self.api(&format!(
            "/projects/{owner}/repos/{name}/archive?at={git_ref}&format={format}"
        ));
        let response = self.get(token, &url).send().await.map_err(|e| {
            BaliseError::ArchiveDownloadFailed { message: e.to_string() }
        })?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            return Err(BaliseError::ArchiveDownloadFailed {
                message: format!("bitbucket returned status {status}"),
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
        let url = self.api(&format!("/projects/{owner}/repos/{name}/webhooks"));
        let body = serde_json::json!({
            "name": "balise registry",
            "url": callback_url,
            "active": true,
            "events": ["repo:refs_changed"],
            "configuration": {"secret": secret},
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
        let hook: BitbucketWebhook = response
            .json()
            .await
            .map_err(|e| BaliseError::WebhookCreationFailed { message: e.to_string() })?;
        Ok(hook.id.to_string())
    }

    async fn remove_webhook(&self, token: &str, owner: &str, name: &str, webhook_id: &str) -> Result<()> {
        let url = self.api(&format!("/projects/{owner}/repos/{name}/webhooks/{webhook_id}"));
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
            s if !(200..300).contains(&s) => Err(api_error(ProviderKind::BitbucketDc, response).await),
            _ => Ok(()),
        }
    }

    fn parse_delivery(&self, headers: &[(String, String)], body: &[u8]) -> Result<WebhookDelivery> {
        let event = header_value(headers, "X-Event-Key")
            .unwrap_or("repo:refs_changed")
            .to_string();
        let payload: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| BaliseError::PayloadInvalid {
                message: format!("not JSON: {e}"),
            })?;
        let repo_name = payload
            .pointer("/repository/slug")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| BaliseError::PayloadInvalid {
                message: "missing repository.slug".to_string(),
            })?
            .to_string();
        let repo_owner = payload
            .pointer("/repository/project/key")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        let ref_name = payload
            .pointer("/changes/0/ref/id")
            .and_then(serde_json::Value::as_str)
            .map(|r| canonicalize_ref(r).to_string());
        let commit_sha = payload
            .pointer("/changes/0/toHash")
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
        let signature = header_value(headers, "X-Hub-Signature").ok_or(BaliseError::SignatureInvalid)?;
        let expected = format!("sha256={}", hmac_sha256_hex(secret, body));
        if constant_time_eq(signature.as_bytes(), expected.as_bytes()) {
            Ok(())
        } else {
            Err(BaliseError::SignatureInvalid)
        }
    }
}

fn request_error(e: reqwest::Error) -> BaliseError {
    BaliseError::api(
        "bitbucket_dc",
        e.status().map_or(0, |s| s.as_u16()),
        e.to_string(),
    )
}
