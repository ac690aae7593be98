//! Test support: scripted implementations of every collaborator seam.
//!
//! These live in the crate proper (not behind `cfg(test)`) so integration
//! tests under `tests/` can drive the full review flow without network
//! access.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use panoptes_core::{
    ExistingComment, PullRequestFile, PullRequestReview, RepoRef, ReviewComment, ReviewRequest,
};

use crate::backends::ModelBackend;
use crate::db::{CommentStore, PostedCommentRecord};
use crate::dispatch::CommentClassifier;
use crate::github::{PostedComment, VcsHost};
use crate::notify::Notifier;

pub use crate::flags::StaticFlags;

/// Render a JSON comment array the way a backend would.
pub fn make_comment_json(comments: &[(&str, u64, &str)]) -> String {
    let items: Vec<String> = comments
        .iter()
        .map(|(path, line, body)| {
            serde_json::to_string(&serde_json::json!({
                "path": path,
                "line": line,
                "body": body,
            }))
            .expect("comment JSON")
        })
        .collect();
    format!("[{}]", items.join(","))
}

/// Build a stamped comment for tests that start mid-pipeline.
pub fn make_comment(path: &str, line: u64, body: &str) -> ReviewComment {
    ReviewComment {
        id: format!("{path}-{line}"),
        path: path.to_string(),
        line,
        start_line: None,
        body: body.to_string(),
        category: String::new(),
        provider: "anthropic".to_string(),
        model: "test-model".to_string(),
        commit_sha: "abc123".to_string(),
        rejection_reason: None,
        rejection_model: None,
        acceptance_reason: None,
    }
}

pub fn make_file(name: &str, patch: &str) -> PullRequestFile {
    PullRequestFile {
        filename: name.to_string(),
        status: "modified".to_string(),
        additions: 1,
        deletions: 0,
        changes: 1,
        patch: patch.to_string(),
    }
}

/// A backend that replays a scripted queue of responses and counts calls.
pub struct ScriptedBackend {
    provider: String,
    model: String,
    responses: Mutex<VecDeque<Result<String, String>>>,
    default_response: Option<String>,
    calls: AtomicUsize,
    delay: Option<Duration>,
    model_overrides: Mutex<Vec<String>>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedBackend {
    pub fn new(provider: &str, model: &str) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            responses: Mutex::new(VecDeque::new()),
            default_response: None,
            calls: AtomicUsize::new(0),
            delay: None,
            model_overrides: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Queue a successful raw response.
    pub fn responds(self, raw: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Ok(raw.to_string()));
        self
    }

    /// Queue a failure.
    pub fn fails(self, error: &str) -> Self {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(error.to_string()));
        self
    }

    /// Fallback success response once the scripted queue is exhausted.
    pub fn otherwise(mut self, raw: &str) -> Self {
        self.default_response = Some(raw.to_string());
        self
    }

    /// Delay every call, to exercise arrival-order independence.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// System/user pairs this backend has been called with.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }

    /// Model variants requested through `call_with_model`.
    pub fn model_overrides(&self) -> Vec<String> {
        self.model_overrides.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, system: &str, user: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap()
            .push((system.to_string(), user.to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().unwrap().pop_front();
        match next {
            Some(Ok(raw)) => Ok(raw),
            Some(Err(e)) => Err(anyhow!(e)),
            None => match &self.default_response {
                Some(raw) => Ok(raw.clone()),
                None => Err(anyhow!("no scripted response left for {}", self.provider)),
            },
        }
    }

    async fn call_with_model(&self, system: &str, user: &str, model: &str) -> Result<String> {
        self.model_overrides.lock().unwrap().push(model.to_string());
        self.call(system, user).await
    }
}

/// Classifier returning a fixed category, or always failing.
pub struct FixedClassifier {
    category: Option<String>,
}

impl FixedClassifier {
    pub fn category(category: &str) -> Self {
        Self {
            category: Some(category.to_string()),
        }
    }

    pub fn failing() -> Self {
        Self { category: None }
    }
}

#[async_trait]
impl CommentClassifier for FixedClassifier {
    async fn classify(&self, _body: &str, _full_patch: &str) -> Result<String> {
        self.category
            .clone()
            .ok_or_else(|| anyhow!("classifier unavailable"))
    }
}

/// Captures notifications for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, message: &str) {
        self.messages.lock().unwrap().push(message.to_string());
    }
}

/// In-memory comment store.
#[derive(Default)]
pub struct MemoryStore {
    pub fail: bool,
    records: Mutex<Vec<PostedCommentRecord>>,
}

impl MemoryStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<PostedCommentRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl CommentStore for MemoryStore {
    fn record_posted(&self, record: &PostedCommentRecord) -> Result<()> {
        if self.fail {
            return Err(anyhow!("store unavailable"));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// Scripted VCS host covering every orchestrator and poster path.
#[derive(Default)]
pub struct MockVcs {
    pub pr: Option<ReviewRequest>,
    pub files: Vec<PullRequestFile>,
    pub reviews: Vec<PullRequestReview>,
    pub review_comments: Vec<ExistingComment>,
    pub issue_comments: Vec<ExistingComment>,
    pub fail_pr: bool,
    pub fail_files: bool,
    pub fail_reviews: bool,
    pub fail_review_comments: bool,
    pub fail_issue_comments: bool,
    /// Posting a comment targeting this path fails.
    pub fail_posts_to_path: Option<String>,
    pub fail_approve: bool,
    pub posted: Mutex<Vec<ReviewComment>>,
    pub approvals: Mutex<Vec<String>>,
    pub next_comment_id: AtomicU64,
}

impl MockVcs {
    pub fn with_pr(mut self, repo: &RepoRef, number: u64, head_sha: &str) -> Self {
        self.pr = Some(ReviewRequest {
            number,
            repo: repo.clone(),
            title: format!("PR #{number}"),
            body: Some("Adds a feature.".to_string()),
            author: "alice".to_string(),
            head_sha: head_sha.to_string(),
            base_sha: "base000".to_string(),
        });
        self
    }

    pub fn with_files(mut self, files: Vec<PullRequestFile>) -> Self {
        self.files = files;
        self
    }

    pub fn with_reviews(mut self, states: &[&str]) -> Self {
        self.reviews = states
            .iter()
            .map(|s| PullRequestReview {
                state: s.to_string(),
                author: "bob".to_string(),
            })
            .collect();
        self
    }

    pub fn with_review_comments(mut self, comments: Vec<(&str, &str)>) -> Self {
        self.review_comments = comments
            .into_iter()
            .enumerate()
            .map(|(i, (author, body))| ExistingComment {
                id: i as u64 + 1,
                path: None,
                line: None,
                author: author.to_string(),
                body: body.to_string(),
            })
            .collect();
        self
    }

    pub fn with_issue_comments(mut self, comments: Vec<(&str, &str)>) -> Self {
        self.issue_comments = comments
            .into_iter()
            .enumerate()
            .map(|(i, (author, body))| ExistingComment {
                id: i as u64 + 100,
                path: None,
                line: None,
                author: author.to_string(),
                body: body.to_string(),
            })
            .collect();
        self
    }

    pub fn posted(&self) -> Vec<ReviewComment> {
        self.posted.lock().unwrap().clone()
    }

    pub fn approvals(&self) -> Vec<String> {
        self.approvals.lock().unwrap().clone()
    }
}

#[async_trait]
impl VcsHost for MockVcs {
    async fn get_pull_request(&self, _repo: &RepoRef, pr_number: u64) -> Result<ReviewRequest> {
        if self.fail_pr {
            return Err(anyhow!("pull request fetch unavailable"));
        }
        self.pr
            .clone()
            .ok_or_else(|| anyhow!("no scripted pull request #{pr_number}"))
    }

    async fn list_files(&self, _repo: &RepoRef, _pr_number: u64) -> Result<Vec<PullRequestFile>> {
        if self.fail_files {
            return Err(anyhow!("file listing unavailable"));
        }
        Ok(self.files.clone())
    }

    async fn list_reviews(
        &self,
        _repo: &RepoRef,
        _pr_number: u64,
    ) -> Result<Vec<PullRequestReview>> {
        if self.fail_reviews {
            return Err(anyhow!("review listing unavailable"));
        }
        Ok(self.reviews.clone())
    }

    async fn list_review_comments(
        &self,
        _repo: &RepoRef,
        _pr_number: u64,
    ) -> Result<Vec<ExistingComment>> {
        if self.fail_review_comments {
            return Err(anyhow!("review comment listing unavailable"));
        }
        Ok(self.review_comments.clone())
    }

    async fn list_issue_comments(
        &self,
        _repo: &RepoRef,
        _pr_number: u64,
    ) -> Result<Vec<ExistingComment>> {
        if self.fail_issue_comments {
            return Err(anyhow!("issue comment listing unavailable"));
        }
        Ok(self.issue_comments.clone())
    }

    async fn post_review_comment(
        &self,
        _repo: &RepoRef,
        _pr_number: u64,
        comment: &ReviewComment,
    ) -> Result<PostedComment> {
        if self
            .fail_posts_to_path
            .as_deref()
            .is_some_and(|p| p == comment.path)
        {
            return Err(anyhow!("422 Unprocessable Entity: line not in diff"));
        }
        self.posted.lock().unwrap().push(comment.clone());
        let id = 1000 + self.next_comment_id.fetch_add(1, Ordering::SeqCst);
        Ok(PostedComment {
            id,
            author: "panoptes[bot]".to_string(),
            created_at: "2026-08-08T00:00:00Z".to_string(),
        })
    }

    async fn approve_pull_request(
        &self,
        _repo: &RepoRef,
        _pr_number: u64,
        message: &str,
    ) -> Result<()> {
        if self.fail_approve {
            return Err(anyhow!("approval rejected"));
        }
        self.approvals.lock().unwrap().push(message.to_string());
        Ok(())
    }
}
