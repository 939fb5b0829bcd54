//! Remote repository API (GitHub REST)

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::GithubConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GithubError {
    #[error("GitHub API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Client setup failed: {0}")]
    Setup(String),
}

impl From<reqwest::Error> for GithubError {
    fn from(err: reqwest::Error) -> Self {
        GithubError::Network(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
}

impl Issue {
    pub fn body_text(&self) -> &str {
        self.body.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub default_branch: String,
    pub clone_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPullRequest {
    pub title: String,
    pub head: String,
    pub base: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
}

#[async_trait]
pub trait RepositoryApi: Send + Sync {
    async fn get_issue(&self, owner: &str, repo: &str, number: u64) -> Result<Issue, GithubError>;

    async fn get_repo(&self, owner: &str, repo: &str) -> Result<RepoInfo, GithubError>;

    async fn create_pull_request(&self, owner: &str, repo: &str, pr: &NewPullRequest) -> Result<PullRequest, GithubError>;
}

/// Split a repository locator into `(owner, name)`.
///
/// Accepts `https://host/owner/name[.git]`, `git@host:owner/name[.git]`,
/// `file://` paths ending in `owner/name`, and bare `owner/name`.
pub fn parse_repo_locator(locator: &str) -> Option<(String, String)> {
    let trimmed = locator.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let path = if let Some((_, rest)) = trimmed.split_once("://") {
        rest.split_once('/').map(|(_, p)| p)?
    } else if let Some((host, rest)) = trimmed.split_once(':')
        && host.contains('@')
    {
        rest
    } else {
        trimmed
    };

    let mut segments = path.rsplit('/').filter(|s| !s.is_empty());
    let name = segments.next()?;
    let owner = segments.next()?;
    let name = name.strip_suffix(".git").unwrap_or(name);
    if name.is_empty() || owner.contains(char::is_whitespace) || name.contains(char::is_whitespace) {
        return None;
    }
    Some((owner.to_string(), name.to_string()))
}

pub struct GithubClient {
    client: Client,
    api_url: String,
    token: String,
}

impl GithubClient {
    pub fn from_config(config: &GithubConfig) -> Result<Self, GithubError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| GithubError::Setup(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github+json")
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T, GithubError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(GithubError::Api {
                status: status.as_u16(),
                body,
            });
        }
        serde_json::from_str(&body).map_err(|e| GithubError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl RepositoryApi for GithubClient {
    async fn get_issue(&self, owner: &str, repo: &str, number: u64) -> Result<Issue, GithubError> {
        let url = self.url(&format!("/repos/{}/{}/issues/{}", owner, repo, number));
        log::debug!("GET {}", url);
        let response = self.authed(self.client.get(&url)).send().await?;
        Self::read_json(response).await
    }

    async fn get_repo(&self, owner: &str, repo: &str) -> Result<RepoInfo, GithubError> {
        let url = self.url(&format!("/repos/{}/{}", owner, repo));
        log::debug!("GET {}", url);
        let response = self.authed(self.client.get(&url)).send().await?;
        Self::read_json(response).await
    }

    async fn create_pull_request(&self, owner: &str, repo: &str, pr: &NewPullRequest) -> Result<PullRequest, GithubError> {
        let url = self.url(&format!("/repos/{}/{}/pulls", owner, repo));
        log::debug!("POST {} head={} base={}", url, pr.head, pr.base);
        let body = json!({
            "title": pr.title,
            "head": pr.head,
            "base": pr.base,
            "body": pr.body,
        });
        let response = self.authed(self.client.post(&url)).json(&body).send().await?;
        Self::read_json(response).await
    }
}

impl std::fmt::Debug for GithubClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubClient").field("api_url", &self.api_url).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(owner: &str, name: &str) -> Option<(String, String)> {
        Some((owner.to_string(), name.to_string()))
    }

    #[test]
    fn test_parse_https() {
        assert_eq!(parse_repo_locator("https://github.com/acme/widgets"), pair("acme", "widgets"));
        assert_eq!(parse_repo_locator("https://github.com/acme/widgets.git"), pair("acme", "widgets"));
        assert_eq!(parse_repo_locator("https://github.com/acme/widgets/"), pair("acme", "widgets"));
    }

    #[test]
    fn test_parse_ssh_and_bare() {
        assert_eq!(parse_repo_locator("git@github.com:acme/widgets.git"), pair("acme", "widgets"));
        assert_eq!(parse_repo_locator("acme/widgets"), pair("acme", "widgets"));
    }

    #[test]
    fn test_parse_file_url() {
        assert_eq!(parse_repo_locator("file:///tmp/repos/acme/widgets"), pair("acme", "widgets"));
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!(parse_repo_locator(""), None);
        assert_eq!(parse_repo_locator("widgets"), None);
        assert_eq!(parse_repo_locator("https://github.com/"), None);
        assert_eq!(parse_repo_locator("https://github.com/acme"), None);
        assert_eq!(parse_repo_locator("not a/repo url"), None);
    }

    #[test]
    fn test_issue_deserialize_null_body() {
        let issue: Issue = serde_json::from_str(r#"{"number": 7, "title": "t", "body": null, "state": "open"}"#).unwrap();
        assert_eq!(issue.number, 7);
        assert_eq!(issue.body_text(), "");
    }

    #[test]
    fn test_repo_info_deserialize() {
        let info: RepoInfo = serde_json::from_str(
            r#"{"default_branch": "main", "clone_url": "https://github.com/a/b.git", "id": 1}"#,
        )
        .unwrap();
        assert_eq!(info.default_branch, "main");
    }

    #[test]
    fn test_client_url_and_debug() {
        let client = GithubClient::from_config(&GithubConfig {
            api_url: "https://ghe.example.com/api/v3/".to_string(),
            token: "ghp_secret".to_string(),
            timeout_ms: 1000,
        })
        .unwrap();
        assert_eq!(client.url("/repos/a/b"), "https://ghe.example.com/api/v3/repos/a/b");
        let debug_str = format!("{:?}", client);
        assert!(!debug_str.contains("ghp_secret"));
    }
}
