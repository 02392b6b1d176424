//! Hosting-service capability interface.
//!
//! Review requests (pull requests) are opened through [`HostingClient`].
//! [`GhCliHost`] implements it with the GitHub CLI (`gh`), which also resolves
//! credentials, so bkstg never handles tokens itself.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

use crate::constants::HOSTING_CLI_TIMEOUT;
use crate::core::BkstgError;
use crate::utils::platform::get_gh_command;

/// Request to open a review request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateReviewRequest {
    /// `owner/repo`
    pub repository: String,
    /// Branch with the changes
    pub head: String,
    /// Branch to merge into
    pub base: String,
    /// Title
    pub title: String,
    /// Description
    pub body: String,
}

/// An open (or just created) review request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReviewRequest {
    /// Number on the hosting service, when known
    #[serde(default)]
    pub number: Option<u64>,
    /// Web URL
    pub url: String,
    /// Title
    #[serde(default)]
    pub title: String,
    /// Head branch
    #[serde(default, rename = "headRefName")]
    pub head: String,
    /// Base branch
    #[serde(default, rename = "baseRefName")]
    pub base: String,
}

/// Capability interface over the hosting service.
#[async_trait]
pub trait HostingClient: Send + Sync {
    /// Opens a review request and returns it.
    async fn create_review_request(&self, request: CreateReviewRequest) -> Result<ReviewRequest>;

    /// Lists open review requests whose head branch starts with `head_prefix`.
    async fn list_open_review_requests(
        &self,
        repository: &str,
        head_prefix: &str,
    ) -> Result<Vec<ReviewRequest>>;

    /// Verifies that credentials are available.
    async fn check_auth(&self) -> Result<()>;
}

/// [`HostingClient`] backed by the GitHub CLI.
#[derive(Debug, Clone)]
pub struct GhCliHost {
    timeout: Duration,
}

impl Default for GhCliHost {
    fn default() -> Self {
        Self {
            timeout: HOSTING_CLI_TIMEOUT,
        }
    }
}

impl GhCliHost {
    /// Creates a client with a custom timeout.
    #[must_use]
    pub const fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout,
        }
    }

    async fn run(&self, operation: &str, repository: Option<&str>, args: &[&str]) -> Result<String> {
        let gh = get_gh_command();
        tracing::debug!(target: "hosting", "Executing command: {} {}", gh, args.join(" "));

        let mut cmd = Command::new(gh);
        cmd.args(args)
            .env("GH_PROMPT_DISABLED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BkstgError::HostingError {
                    operation: operation.to_string(),
                    reason: "GitHub CLI 'gh' not found in PATH".to_string(),
                }
                .into());
            }
            Ok(Err(e)) => {
                return Err(anyhow::Error::from(e).context(format!("Failed to run gh {operation}")));
            }
            Err(_) => {
                return Err(BkstgError::Timeout {
                    operation: format!("gh {operation}"),
                    seconds: self.timeout.as_secs(),
                }
                .into());
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if output.status.success() {
            return Ok(stdout);
        }

        Err(classify_gh_failure(operation, repository, &stderr).into())
    }
}

fn classify_gh_failure(operation: &str, repository: Option<&str>, stderr: &str) -> BkstgError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("gh auth login")
        || lowered.contains("not logged in")
        || lowered.contains("authentication")
        || lowered.contains("http 401")
        || lowered.contains("http 403")
    {
        BkstgError::AuthenticationFailed {
            url: repository.unwrap_or("github.com").to_string(),
            detail: stderr.trim().to_string(),
        }
    } else if lowered.contains("could not resolve") || lowered.contains("connection") {
        BkstgError::NetworkError {
            operation: format!("gh {operation}"),
            reason: stderr.trim().to_string(),
        }
    } else {
        BkstgError::HostingError {
            operation: operation.to_string(),
            reason: stderr.trim().to_string(),
        }
    }
}

/// Extracts the number from a `.../pull/<n>` URL.
fn review_number(url: &str) -> Option<u64> {
    url.trim_end_matches('/').rsplit('/').next().and_then(|n| n.parse().ok())
}

#[async_trait]
impl HostingClient for GhCliHost {
    async fn create_review_request(&self, request: CreateReviewRequest) -> Result<ReviewRequest> {
        let stdout = self
            .run(
                "pr create",
                Some(&request.repository),
                &[
                    "pr",
                    "create",
                    "--repo",
                    &request.repository,
                    "--head",
                    &request.head,
                    "--base",
                    &request.base,
                    "--title",
                    &request.title,
                    "--body",
                    &request.body,
                ],
            )
            .await?;

        let url = stdout
            .lines()
            .map(str::trim)
            .rfind(|line| line.starts_with("http"))
            .unwrap_or_else(|| stdout.trim())
            .to_string();

        tracing::info!(target: "hosting", "Opened review request {}", url);
        Ok(ReviewRequest {
            number: review_number(&url),
            url,
            title: request.title,
            head: request.head,
            base: request.base,
        })
    }

    async fn list_open_review_requests(
        &self,
        repository: &str,
        head_prefix: &str,
    ) -> Result<Vec<ReviewRequest>> {
        let stdout = self
            .run(
                "pr list",
                Some(repository),
                &[
                    "pr",
                    "list",
                    "--repo",
                    repository,
                    "--state",
                    "open",
                    "--json",
                    "number,title,url,headRefName,baseRefName",
                ],
            )
            .await?;

        let all: Vec<ReviewRequest> =
            serde_json::from_str(&stdout).context("Failed to parse gh pr list output")?;
        Ok(all.into_iter().filter(|pr| pr.head.starts_with(head_prefix)).collect())
    }

    async fn check_auth(&self) -> Result<()> {
        self.run("auth status", None, &["auth", "status"]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_review_number_from_url() {
        assert_eq!(review_number("https://github.com/acme/cat/pull/42"), Some(42));
        assert_eq!(review_number("https://github.com/acme/cat/pull/42/"), Some(42));
        assert_eq!(review_number("not a url"), None);
    }

    #[test]
    fn test_classify_gh_auth() {
        let err = classify_gh_failure(
            "pr create",
            Some("acme/cat"),
            "To get started with GitHub CLI, please run:  gh auth login",
        );
        assert!(err.is_auth());
    }

    #[test]
    fn test_classify_gh_other() {
        let err = classify_gh_failure("pr create", Some("acme/cat"), "a pull request already exists");
        assert!(matches!(err, BkstgError::HostingError { .. }));
    }

    #[test]
    fn test_parse_pr_list_json() {
        let json = r#"[
            {"number": 7, "title": "bkstg sync", "url": "https://github.com/a/b/pull/7",
             "headRefName": "bkstg-sync-20240101-120000", "baseRefName": "main"},
            {"number": 8, "title": "other", "url": "https://github.com/a/b/pull/8",
             "headRefName": "feature", "baseRefName": "main"}
        ]"#;
        let all: Vec<ReviewRequest> = serde_json::from_str(json).unwrap();
        let ours: Vec<_> = all.into_iter().filter(|pr| pr.head.starts_with("bkstg-sync-")).collect();
        assert_eq!(ours.len(), 1);
        assert_eq!(ours[0].number, Some(7));
    }
}
