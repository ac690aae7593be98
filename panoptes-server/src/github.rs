//! GitHub REST client and the `VcsHost` seam the orchestrator reviews
//! through. Authentication is a plain bearer token; every operation is
//! scoped by owner/name and pull request number.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use panoptes_core::{
    ExistingComment, PullRequestFile, PullRequestReview, RepoRef, ReviewComment, ReviewRequest,
};

/// The version-control operations the review workflow needs.
#[async_trait]
pub trait VcsHost: Send + Sync {
    async fn get_pull_request(&self, repo: &RepoRef, pr_number: u64) -> Result<ReviewRequest>;

    async fn list_files(&self, repo: &RepoRef, pr_number: u64) -> Result<Vec<PullRequestFile>>;

    async fn list_reviews(&self, repo: &RepoRef, pr_number: u64)
        -> Result<Vec<PullRequestReview>>;

    /// Inline review comments previously posted on the diff.
    async fn list_review_comments(
        &self,
        repo: &RepoRef,
        pr_number: u64,
    ) -> Result<Vec<ExistingComment>>;

    /// Conversation (issue) comments on the pull request.
    async fn list_issue_comments(
        &self,
        repo: &RepoRef,
        pr_number: u64,
    ) -> Result<Vec<ExistingComment>>;

    /// Post one inline review comment; returns the created comment.
    async fn post_review_comment(
        &self,
        repo: &RepoRef,
        pr_number: u64,
        comment: &ReviewComment,
    ) -> Result<PostedComment>;

    async fn approve_pull_request(
        &self,
        repo: &RepoRef,
        pr_number: u64,
        message: &str,
    ) -> Result<()>;
}

/// Response for a successfully created review comment.
#[derive(Debug, Clone, Deserialize)]
pub struct PostedComment {
    pub id: u64,
    #[serde(rename = "user", deserialize_with = "login_of_user")]
    pub author: String,
    pub created_at: String,
}

fn login_of_user<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    struct User {
        login: String,
    }
    Ok(User::deserialize(deserializer)?.login)
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    number: u64,
    title: String,
    body: Option<String>,
    user: UserResponse,
    head: RefResponse,
    base: RefResponse,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct FileResponse {
    filename: String,
    status: String,
    additions: u64,
    deletions: u64,
    changes: u64,
    #[serde(default)]
    patch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ReviewResponse {
    state: String,
    user: UserResponse,
}

#[derive(Debug, Deserialize)]
struct CommentResponse {
    id: u64,
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    line: Option<u64>,
    user: UserResponse,
    body: String,
}

#[derive(Debug, Serialize)]
struct CreateReviewCommentRequest<'a> {
    body: &'a str,
    commit_id: &'a str,
    path: &'a str,
    line: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_line: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CreateReviewRequest<'a> {
    body: &'a str,
    event: &'a str,
}

/// GitHub REST v3 client.
#[derive(Clone)]
pub struct GithubClient {
    client: Client,
    token: String,
    base_url: String,
}

impl GithubClient {
    pub fn new(token: String) -> Self {
        Self::with_base_url(token, "https://api.github.com".to_string())
    }

    /// Point the client at a different API root (used against test servers).
    pub fn with_base_url(token: String, base_url: String) -> Self {
        let client = Client::builder()
            .user_agent(concat!("panoptes/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to create HTTP client");
        Self {
            client,
            token,
            base_url,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, what: &str) -> Result<T> {
        let response = self
            .client
            .get(url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .send()
            .await
            .with_context(|| format!("failed to send {what} request"))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("GitHub API error fetching {}: {} - {}", what, status, error_text);
            return Err(anyhow!(
                "GitHub API error fetching {what}: {status} - {error_text}"
            ));
        }

        response
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))
    }

    /// Fetch every page of a paginated listing endpoint.
    async fn get_paginated<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        what: &str,
    ) -> Result<Vec<T>> {
        let per_page = 100;
        let mut page = 1;
        let mut all = Vec::new();
        loop {
            let page_url = format!("{url}?page={page}&per_page={per_page}");
            let items: Vec<T> = self.get_json(&page_url, what).await?;
            let count = items.len();
            all.extend(items);
            if count < per_page {
                break;
            }
            page += 1;
        }
        Ok(all)
    }
}

#[async_trait]
impl VcsHost for GithubClient {
    async fn get_pull_request(&self, repo: &RepoRef, pr_number: u64) -> Result<ReviewRequest> {
        let url = format!("{}/repos/{}/pulls/{}", self.base_url, repo, pr_number);
        info!("Fetching PR #{} from {}", pr_number, repo);

        let pr: PullRequestResponse = self.get_json(&url, "pull request").await?;
        info!(
            "Successfully fetched PR #{} (head: {}, base: {})",
            pr.number, pr.head.sha, pr.base.sha
        );

        Ok(ReviewRequest {
            number: pr.number,
            repo: repo.clone(),
            title: pr.title,
            body: pr.body,
            author: pr.user.login,
            head_sha: pr.head.sha,
            base_sha: pr.base.sha,
        })
    }

    async fn list_files(&self, repo: &RepoRef, pr_number: u64) -> Result<Vec<PullRequestFile>> {
        let url = format!("{}/repos/{}/pulls/{}/files", self.base_url, repo, pr_number);
        info!("Fetching changed files for PR #{} in {}", pr_number, repo);

        let files: Vec<FileResponse> = self.get_paginated(&url, "pull request files").await?;
        info!("Found {} changed files", files.len());

        Ok(files
            .into_iter()
            .map(|f| PullRequestFile {
                filename: f.filename,
                status: f.status,
                additions: f.additions,
                deletions: f.deletions,
                changes: f.changes,
                patch: f.patch.unwrap_or_default(),
            })
            .collect())
    }

    async fn list_reviews(
        &self,
        repo: &RepoRef,
        pr_number: u64,
    ) -> Result<Vec<PullRequestReview>> {
        let url = format!(
            "{}/repos/{}/pulls/{}/reviews",
            self.base_url, repo, pr_number
        );
        let reviews: Vec<ReviewResponse> = self.get_paginated(&url, "pull request reviews").await?;
        Ok(reviews
            .into_iter()
            .map(|r| PullRequestReview {
                state: r.state,
                author: r.user.login,
            })
            .collect())
    }

    async fn list_review_comments(
        &self,
        repo: &RepoRef,
        pr_number: u64,
    ) -> Result<Vec<ExistingComment>> {
        let url = format!(
            "{}/repos/{}/pulls/{}/comments",
            self.base_url, repo, pr_number
        );
        let comments: Vec<CommentResponse> = self.get_paginated(&url, "review comments").await?;
        info!(
            "Found {} review comments on PR #{}",
            comments.len(),
            pr_number
        );
        Ok(comments
            .into_iter()
            .map(|c| ExistingComment {
                id: c.id,
                path: c.path,
                line: c.line,
                author: c.user.login,
                body: c.body,
            })
            .collect())
    }

    async fn list_issue_comments(
        &self,
        repo: &RepoRef,
        pr_number: u64,
    ) -> Result<Vec<ExistingComment>> {
        let url = format!(
            "{}/repos/{}/issues/{}/comments",
            self.base_url, repo, pr_number
        );
        let comments: Vec<CommentResponse> = self.get_paginated(&url, "issue comments").await?;
        Ok(comments
            .into_iter()
            .map(|c| ExistingComment {
                id: c.id,
                path: c.path,
                line: c.line,
                author: c.user.login,
                body: c.body,
            })
            .collect())
    }

    async fn post_review_comment(
        &self,
        repo: &RepoRef,
        pr_number: u64,
        comment: &ReviewComment,
    ) -> Result<PostedComment> {
        let url = format!(
            "{}/repos/{}/pulls/{}/comments",
            self.base_url, repo, pr_number
        );
        info!(
            "Posting review comment to {}:{} on PR #{}",
            comment.path, comment.line, pr_number
        );

        let request_body = CreateReviewCommentRequest {
            body: &comment.body,
            commit_id: &comment.commit_sha,
            path: &comment.path,
            line: comment.line,
            start_line: comment.start_line,
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .json(&request_body)
            .send()
            .await
            .context("failed to send review comment request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("GitHub API error posting comment: {} - {}", status, error_text);
            return Err(anyhow!(
                "GitHub API error posting comment: {status} - {error_text}"
            ));
        }

        let posted: PostedComment = response
            .json()
            .await
            .context("failed to parse posted comment response")?;
        info!("Successfully posted comment with ID: {}", posted.id);
        Ok(posted)
    }

    async fn approve_pull_request(
        &self,
        repo: &RepoRef,
        pr_number: u64,
        message: &str,
    ) -> Result<()> {
        let url = format!(
            "{}/repos/{}/pulls/{}/reviews",
            self.base_url, repo, pr_number
        );
        info!("Approving PR #{} in {}", pr_number, repo);

        let request_body = CreateReviewRequest {
            body: message,
            event: "APPROVE",
        };

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/vnd.github.v3+json")
            .json(&request_body)
            .send()
            .await
            .context("failed to send approval request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("GitHub API error approving PR: {} - {}", status, error_text);
            return Err(anyhow!(
                "GitHub API error approving PR: {status} - {error_text}"
            ));
        }

        info!("Successfully approved PR #{}", pr_number);
        Ok(())
    }
}
