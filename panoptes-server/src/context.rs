//! Review context assembly: the pluggable context-map collaborator and the
//! author context built from the PR description and the author's own
//! comments.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use panoptes_core::{PullRequestFile, RepoRef};

use crate::github::VcsHost;

/// Produces the additional key/value context handed to the review prompt
/// (dependency graphs, language signals, code index, knowledge base).
/// Sub-sections are independently fallible; the orchestrator scrubs entries
/// that look like failed analysis before use.
#[async_trait]
pub trait ContextAssembler: Send + Sync {
    async fn assemble(
        &self,
        files: &[PullRequestFile],
        company_id: u64,
    ) -> Result<Map<String, Value>>;
}

/// What the PR author has said about their change.
#[derive(Debug, Clone)]
pub struct AuthorContext {
    pub has_content: bool,
    pub author: String,
    pub description: String,
    pub comments: Vec<String>,
}

impl AuthorContext {
    /// The degraded fallback used when the build fails: flagged content-free
    /// so the prompt builder skips it.
    pub fn content_free(author: impl Into<String>) -> Self {
        Self {
            has_content: false,
            author: author.into(),
            description: String::new(),
            comments: Vec::new(),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({
            "author": self.author,
            "description": self.description,
            "comments": self.comments,
        })
    }
}

/// Builds the author context from the PR body and the author's conversation
/// comments.
pub struct AuthorContextBuilder<'a> {
    vcs: &'a dyn VcsHost,
}

impl<'a> AuthorContextBuilder<'a> {
    pub fn new(vcs: &'a dyn VcsHost) -> Self {
        Self { vcs }
    }

    pub async fn build(
        &self,
        repo: &RepoRef,
        pr_number: u64,
        description: Option<&str>,
        author: &str,
    ) -> Result<AuthorContext> {
        let all_comments = self.vcs.list_issue_comments(repo, pr_number).await?;
        let comments: Vec<String> = all_comments
            .into_iter()
            .filter(|c| c.author == author)
            .map(|c| c.body)
            .collect();

        let description = description.unwrap_or_default().trim().to_string();
        let has_content = !description.is_empty() || !comments.is_empty();

        Ok(AuthorContext {
            has_content,
            author: author.to_string(),
            description,
            comments,
        })
    }
}
