#![doc = "GitHub REST client implementing the core `Forge` contract."]
//
//! # Forge client (CLI <-> GitHub)
//!
//! [`GitHubClient`] speaks the small part of the GitHub v3 API the publish workflow needs:
//!
//! - `/authorizations` (basic auth with the user's password) to list or create access tokens,
//! - `/repos/{owner}/{name}` and `/repos/{owner}/{name}/forks` for forks,
//! - `/repos/{owner}/{name}/pulls` to find, open and update pull requests.
//!
//! Any answer outside 2xx is turned into [`ForgeError::Reported`] carrying GitHub's `message`;
//! transport and decoding faults become [`ForgeError::Unexpected`]. The base url is configurable
//! so GitHub Enterprise instances (and test servers) work too.

use async_trait::async_trait;
use opam_publish_core::contract::{
    Forge, ForgeError, NewPullRequest, PullRequest, RepoId, TokenRecord,
};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

/// Scope requested for new access tokens.
const TOKEN_SCOPES: &[&str] = &["public_repo"];

pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiAuthorization {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    note: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiPullRequest {
    number: u64,
    html_url: String,
}

impl From<ApiPullRequest> for PullRequest {
    fn from(pr: ApiPullRequest) -> Self {
        PullRequest {
            number: pr.number,
            html_url: pr.html_url,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

impl GitHubClient {
    pub fn new(api_url: &str) -> Result<Self, ForgeError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("opam-publish/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ForgeError::Unexpected(e.to_string()))?;
        tracing::info!(api_url, "Initialized GitHub client");
        Ok(GitHubClient {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn repo_url(&self, repo: &RepoId, rest: &str) -> String {
        self.url(&format!("/repos/{}/{}{}", repo.owner, repo.name, rest))
    }

    fn with_token(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        request
            .header("Authorization", format!("token {}", token))
            .header("Accept", "application/vnd.github.v3+json")
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ForgeError> {
        let response = request.send().await.map_err(|e| {
            tracing::error!(error = ?e, "GitHub request failed");
            ForgeError::Unexpected(e.to_string())
        })?;
        if response.status().is_success() {
            return Ok(response);
        }
        Err(reported(response).await)
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ForgeError> {
        response.json::<T>().await.map_err(|e| {
            tracing::error!(error = ?e, "Failed to decode GitHub response");
            ForgeError::Unexpected(format!("invalid response from GitHub: {}", e))
        })
    }
}

/// Error for a non-2xx answer, using GitHub's `message` when the body has one.
async fn reported(response: Response) -> ForgeError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .map(|e| e.message)
        .unwrap_or_else(|_| body.trim().to_string());
    tracing::error!(status = %status, message = %message, "GitHub refused the request");
    ForgeError::Reported {
        message: format!("{} ({})", message, status),
    }
}

#[async_trait]
impl Forge for GitHubClient {
    async fn list_tokens(
        &self,
        user: &str,
        password: &str,
    ) -> Result<Vec<TokenRecord>, ForgeError> {
        tracing::info!(user, "Listing access tokens");
        let request = self
            .client
            .get(self.url("/authorizations"))
            .basic_auth(user, Some(password));
        let response = self.send(request).await?;
        let authorizations: Vec<ApiAuthorization> = Self::decode(response).await?;
        tracing::info!(count = authorizations.len(), "Fetched access tokens");
        Ok(authorizations
            .into_iter()
            .map(|a| TokenRecord {
                note: a.note,
                token: a.token.unwrap_or_default(),
            })
            .collect())
    }

    async fn create_token(
        &self,
        user: &str,
        password: &str,
        note: &str,
    ) -> Result<String, ForgeError> {
        tracing::info!(user, note, "Creating access token");
        let request = self
            .client
            .post(self.url("/authorizations"))
            .basic_auth(user, Some(password))
            .json(&json!({ "scopes": TOKEN_SCOPES, "note": note }));
        let response = self.send(request).await?;
        let authorization: ApiAuthorization = Self::decode(response).await?;
        match authorization.token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(ForgeError::Unexpected(
                "GitHub returned an authorization without a token".to_string(),
            )),
        }
    }

    async fn create_fork(&self, token: &str, repo: &RepoId) -> Result<(), ForgeError> {
        tracing::info!(repo = %repo, "Requesting fork");
        let request = self.with_token(self.client.post(self.repo_url(repo, "/forks")), token);
        self.send(request).await?;
        Ok(())
    }

    async fn repo_exists(&self, token: &str, repo: &RepoId) -> Result<bool, ForgeError> {
        let request = self.with_token(self.client.get(self.repo_url(repo, "")), token);
        let response = request
            .send()
            .await
            .map_err(|e| ForgeError::Unexpected(e.to_string()))?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(reported(response).await),
        }
    }

    async fn find_open_pull_request(
        &self,
        token: &str,
        repo: &RepoId,
        user: &str,
        branch: &str,
    ) -> Result<Option<PullRequest>, ForgeError> {
        let head = format!("{}:{}", user, branch);
        let request = self
            .with_token(self.client.get(self.repo_url(repo, "/pulls")), token)
            .query(&[("state", "open"), ("head", head.as_str())]);
        let response = self.send(request).await?;
        let pulls: Vec<ApiPullRequest> = Self::decode(response).await?;
        tracing::info!(repo = %repo, head = %head, found = pulls.len(), "Looked up open pull requests");
        Ok(pulls.into_iter().next().map(PullRequest::from))
    }

    async fn create_pull_request(
        &self,
        token: &str,
        repo: &RepoId,
        request: NewPullRequest,
    ) -> Result<PullRequest, ForgeError> {
        let body = json!({
            "title": request.title,
            "body": request.body,
            "head": request.head,
            "base": request.base,
        });
        let builder = self
            .with_token(self.client.post(self.repo_url(repo, "/pulls")), token)
            .json(&body);
        let response = self.send(builder).await?;
        let pr: ApiPullRequest = Self::decode(response).await?;
        tracing::info!(number = pr.number, url = %pr.html_url, "Opened pull request");
        Ok(pr.into())
    }

    async fn update_pull_request(
        &self,
        token: &str,
        repo: &RepoId,
        number: u64,
        title: &str,
        body: &str,
    ) -> Result<PullRequest, ForgeError> {
        let builder = self
            .with_token(
                self.client
                    .patch(self.repo_url(repo, &format!("/pulls/{}", number))),
                token,
            )
            .json(&json!({ "title": title, "body": body }));
        let response = self.send(builder).await?;
        let pr: ApiPullRequest = Self::decode(response).await?;
        tracing::info!(number = pr.number, "Updated pull request");
        Ok(pr.into())
    }
}
