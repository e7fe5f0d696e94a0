//! GitHub repository contents API store.
//!
//! Version tokens are blob SHAs. GitHub rejects a `PUT` with a stale `sha`
//! with 409 and a `PUT` without `sha` on an existing file with 422, which
//! gives create and update the optimistic semantics the reconciler needs.

use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{CommitMetadata, RemoteFile, RemoteStore};
use crate::error::StoreError;

/// Public GitHub API endpoint.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

const USER_AGENT: &str = concat!("githubfiles-receiver/", env!("CARGO_PKG_VERSION"));

/// GitHub content response for file fetching
#[derive(Debug, Deserialize)]
struct ContentResponse {
    /// Blob SHA
    sha: String,
    /// Base64-encoded content
    #[serde(default)]
    content: Option<String>,
    /// Encoding type (usually "base64")
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Serialize)]
struct Committer<'a> {
    name: &'a str,
    email: &'a str,
}

#[derive(Debug, Serialize)]
struct PutContentRequest<'a> {
    message: &'a str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    committer: Option<Committer<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

/// Store backed by a single GitHub repository.
#[derive(Debug, Clone)]
pub struct GitHubStore {
    client: reqwest::Client,
    api_url: String,
    owner: String,
    repo: String,
    /// Branch read from; `None` reads the default branch
    reference: Option<String>,
    token: Option<String>,
}

impl GitHubStore {
    /// Create a store; every request is bounded by `timeout`.
    pub fn new(
        api_url: &str,
        owner: &str,
        repo: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            owner: owner.to_string(),
            repo: repo.to_string(),
            reference: None,
            token,
        })
    }

    /// Read files from `branch` instead of the default branch.
    #[must_use]
    pub fn with_branch(mut self, branch: &str) -> Self {
        self.reference = (!branch.is_empty()).then(|| branch.to_string());
        self
    }

    fn contents_url(&self, path: &str) -> String {
        let encoded: Vec<_> = path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(urlencoding::encode)
            .collect();
        format!(
            "{}/repos/{}/{}/contents/{}",
            self.api_url,
            self.owner,
            self.repo,
            encoded.join("/")
        )
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, url)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");

        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {token}")),
            None => request,
        }
    }
}

fn decode_content(response: ContentResponse, path: &str) -> Result<RemoteFile, StoreError> {
    let encoded = response.content.unwrap_or_default();
    let content = match response.encoding.as_deref() {
        Some("base64") | None => {
            // GitHub returns base64 with newlines, so we need to strip them
            let clean: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(clean)
                .map_err(|e| StoreError::Decode(format!("{path}: {e}")))?
        }
        Some(other) => {
            return Err(StoreError::Decode(format!(
                "{path}: unsupported encoding `{other}`"
            )));
        }
    };

    Ok(RemoteFile {
        path: path.to_string(),
        content,
        version: Some(response.sha),
    })
}

/// GitHub answers a create over an existing file with 422 and this message;
/// every other 422 is a validation failure.
fn is_missing_sha(body: &str) -> bool {
    #[derive(Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        message: String,
    }

    serde_json::from_str::<ErrorBody>(body)
        .is_ok_and(|e| e.message.contains("\"sha\" wasn't supplied"))
}

#[async_trait]
impl RemoteStore for GitHubStore {
    async fn get(&self, path: &str) -> Result<RemoteFile, StoreError> {
        let url = self.contents_url(path);
        debug!(url = %url, "Fetching file from GitHub");

        let mut request = self.request(reqwest::Method::GET, &url);
        if let Some(reference) = &self.reference {
            request = request.query(&[("ref", reference)]);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(path.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.bytes().await?;
        // Directories come back as a JSON array and fail here
        let content: ContentResponse = serde_json::from_slice(&body)
            .map_err(|e| StoreError::Decode(format!("{path}: {e}")))?;
        decode_content(content, path)
    }

    async fn create_or_update(
        &self,
        path: &str,
        content: &[u8],
        expected_version: Option<&str>,
        metadata: &CommitMetadata,
    ) -> Result<(), StoreError> {
        let url = self.contents_url(path);
        let committer = (!metadata.author_name.is_empty() && !metadata.author_email.is_empty())
            .then(|| Committer {
                name: &metadata.author_name,
                email: &metadata.author_email,
            });
        let body = PutContentRequest {
            message: &metadata.message,
            content: base64::engine::general_purpose::STANDARD.encode(content),
            branch: (!metadata.branch.is_empty()).then_some(metadata.branch.as_str()),
            committer,
            sha: expected_version,
        };

        debug!(
            url = %url,
            create = expected_version.is_none(),
            "Writing file to GitHub"
        );

        let response = self
            .request(reqwest::Method::PUT, &url)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::CONFLICT => Err(StoreError::Conflict {
                path: path.to_string(),
                reason: format!("version {} is stale", expected_version.unwrap_or("none")),
            }),
            StatusCode::UNPROCESSABLE_ENTITY
                if expected_version.is_none() && is_missing_sha(&body) =>
            {
                Err(StoreError::Conflict {
                    path: path.to_string(),
                    reason: "file was created concurrently".to_string(),
                })
            }
            _ => Err(StoreError::Api {
                status: status.as_u16(),
                body,
            }),
        }
    }
}
