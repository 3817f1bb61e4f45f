//! Minimal GitHub REST client for the operations the core invokes.

use serde::Deserialize;
use tracing::debug;

use crate::{AppError, Result};

const API_BASE: &str = "https://api.github.com";
const USER_AGENT: &str = concat!("claps/", env!("CARGO_PKG_VERSION"));

/// One issue row as returned by the issues listing endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueSummary {
    /// Issue number.
    pub number: u64,
    /// Issue title.
    pub title: String,
    /// Issue body, absent when empty.
    #[serde(default)]
    pub body: Option<String>,
    /// HTML URL of the issue.
    pub html_url: String,
    /// Lifecycle state: `open` or `closed`.
    pub state: String,
    /// Author of the issue.
    pub user: IssueUser,
    /// Present on pull requests; used to filter them out of issue listings.
    #[serde(default)]
    pub pull_request: Option<serde_json::Value>,
}

/// Author reference on an issue.
#[derive(Debug, Clone, Deserialize)]
pub struct IssueUser {
    /// GitHub login.
    pub login: String,
}

/// Thin REST client holding the shared `reqwest` client and token.
#[derive(Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    token: String,
}

impl GithubClient {
    /// Build a client for the given personal access token. An empty token
    /// yields unauthenticated requests (public repositories only).
    #[must_use]
    pub fn new(token: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json");
        if !self.token.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.token));
        }
        builder
    }

    /// Post a comment to an issue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Github` on transport failure or non-2xx status.
    pub async fn post_issue_comment(
        &self,
        owner: &str,
        repo: &str,
        issue: u64,
        body: &str,
    ) -> Result<()> {
        let url = format!("{API_BASE}/repos/{owner}/{repo}/issues/{issue}/comments");
        let response = self
            .request(reqwest::Method::POST, &url)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await
            .map_err(|err| AppError::Github(format!("comment request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(AppError::Github(format!(
                "comment on {owner}/{repo}#{issue} returned {}",
                response.status()
            )));
        }
        debug!(owner, repo, issue, "issue comment posted");
        Ok(())
    }

    /// Fetch the lifecycle state (`open`/`closed`) of an issue.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Github` on transport failure or non-2xx status.
    pub async fn issue_state(&self, owner: &str, repo: &str, issue: u64) -> Result<String> {
        let url = format!("{API_BASE}/repos/{owner}/{repo}/issues/{issue}");
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|err| AppError::Github(format!("issue request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(AppError::Github(format!(
                "issue {owner}/{repo}#{issue} returned {}",
                response.status()
            )));
        }
        let summary: IssueSummary = response
            .json()
            .await
            .map_err(|err| AppError::Github(format!("issue decode failed: {err}")))?;
        Ok(summary.state)
    }

    /// List open issues carrying `label`, excluding pull requests.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Github` on transport failure or non-2xx status.
    pub async fn list_open_labeled_issues(
        &self,
        owner: &str,
        repo: &str,
        label: &str,
    ) -> Result<Vec<IssueSummary>> {
        let url = format!(
            "{API_BASE}/repos/{owner}/{repo}/issues?state=open&labels={label}&per_page=50"
        );
        let response = self
            .request(reqwest::Method::GET, &url)
            .send()
            .await
            .map_err(|err| AppError::Github(format!("issue list request failed: {err}")))?;
        if !response.status().is_success() {
            return Err(AppError::Github(format!(
                "issue list for {owner}/{repo} returned {}",
                response.status()
            )));
        }
        let issues: Vec<IssueSummary> = response
            .json()
            .await
            .map_err(|err| AppError::Github(format!("issue list decode failed: {err}")))?;
        Ok(issues
            .into_iter()
            .filter(|issue| issue.pull_request.is_none())
            .collect())
    }
}
