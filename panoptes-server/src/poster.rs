//! Posting the validated comment set and the conditional auto-approval.
//!
//! Every comment entering `post_review_comments` ends up in exactly one of
//! the two partitions: posted or filtered. The approval decision only runs
//! when nothing was posted and automatic approval is enabled.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};

use panoptes_core::{
    build_decision_request, parse_verdict, ApprovalVerdict, RepoRef, ReviewComment,
    GENERIC_APPROVAL_REASON,
};

use crate::backends::ModelBackend;
use crate::db::{CommentStore, PostedCommentRecord};
use crate::github::VcsHost;
use crate::notify::Notifier;

/// Company-policy-aware filter applied to prospective comments before
/// posting. Returns `(kept, dropped)`; dropped comments are annotated by the
/// poster and land in the filtered partition.
pub trait TieredFilter: Send + Sync {
    fn filter(
        &self,
        comments: Vec<ReviewComment>,
        company_id: u64,
    ) -> (Vec<ReviewComment>, Vec<ReviewComment>);
}

fn category_tier(category: &str) -> u8 {
    match category {
        "bug_risk" | "security" => 0,
        "performance" | "maintainability" | "testing" => 1,
        _ => 2,
    }
}

/// Ranks comments by category tier and caps the total per review. Within
/// the cap, original ordering is preserved.
pub struct CategoryTierFilter {
    pub max_comments: usize,
}

impl TieredFilter for CategoryTierFilter {
    fn filter(
        &self,
        comments: Vec<ReviewComment>,
        _company_id: u64,
    ) -> (Vec<ReviewComment>, Vec<ReviewComment>) {
        if comments.len() <= self.max_comments {
            return (comments, Vec::new());
        }

        let mut ranked: Vec<(usize, ReviewComment)> = comments.into_iter().enumerate().collect();
        ranked.sort_by_key(|(i, c)| (category_tier(&c.category), *i));

        let mut kept: Vec<(usize, ReviewComment)> = Vec::with_capacity(self.max_comments);
        let mut dropped = Vec::new();
        for (i, comment) in ranked {
            if kept.len() < self.max_comments {
                kept.push((i, comment));
            } else {
                dropped.push(comment);
            }
        }
        kept.sort_by_key(|(i, _)| *i);
        (kept.into_iter().map(|(_, c)| c).collect(), dropped)
    }
}

/// What happened to the approval decision for this posting run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// Comments were posted, or automatic approval is disabled.
    NotEvaluated,
    Approved { reason: String },
    Declined { reason: String },
    /// The decision call or the verdict grammar failed; no approval action
    /// was taken.
    Failed { error: String },
}

pub struct PostOutcome {
    pub posted: Vec<ReviewComment>,
    pub filtered: Vec<ReviewComment>,
    pub approval: ApprovalOutcome,
}

pub struct Poster {
    vcs: Arc<dyn VcsHost>,
    store: Arc<dyn CommentStore>,
    notifier: Arc<dyn Notifier>,
    decision_backend: Arc<dyn ModelBackend>,
    tiered: Arc<dyn TieredFilter>,
    automatic_approval: bool,
}

fn approval_message(reason: &str) -> String {
    format!(
        "LGTM, ship it! :ship:\n<details>\n<summary>Why was this auto-approved?</summary>\n{reason}\n</details>"
    )
}

impl Poster {
    pub fn new(
        vcs: Arc<dyn VcsHost>,
        store: Arc<dyn CommentStore>,
        notifier: Arc<dyn Notifier>,
        decision_backend: Arc<dyn ModelBackend>,
        tiered: Arc<dyn TieredFilter>,
        automatic_approval: bool,
    ) -> Self {
        Self {
            vcs,
            store,
            notifier,
            decision_backend,
            tiered,
            automatic_approval,
        }
    }

    /// Partition the validated set into posted and filtered, persist posted
    /// comments best-effort, and conditionally render the approval verdict.
    pub async fn post_review_comments(
        &self,
        repo: &RepoRef,
        pr_number: u64,
        company_id: u64,
        comments: Vec<ReviewComment>,
    ) -> PostOutcome {
        let total = comments.len();
        let mut posted = Vec::new();
        let mut filtered = Vec::new();
        let mut prospective = Vec::new();

        for comment in comments {
            if comment.is_rejected() {
                info!(
                    pr_number,
                    reason = comment.rejection_reason.as_deref().unwrap_or_default(),
                    body = %comment.body,
                    "skipping rejected comment"
                );
                filtered.push(comment);
            } else {
                if let Some(reason) = &comment.acceptance_reason {
                    info!(pr_number, reason = %reason, "accepting comment");
                }
                prospective.push(comment);
            }
        }

        let (kept, dropped) = self.tiered.filter(prospective, company_id);
        for mut comment in dropped {
            comment.reject(
                "filtered by comment policy: over the per-review limit for its tier",
                "tiered_filter",
            );
            filtered.push(comment);
        }

        for comment in kept {
            match self.vcs.post_review_comment(repo, pr_number, &comment).await {
                Ok(response) => {
                    let record = PostedCommentRecord {
                        company_id,
                        repo: repo.clone(),
                        pr_number,
                        comment_id: response.id,
                        author: response.author,
                        body: comment.body.clone(),
                        category: comment.category.clone(),
                        created_at: Utc::now(),
                    };
                    if let Err(e) = self.store.record_posted(&record) {
                        // Best-effort persistence; never blocks the next post.
                        error!(error = format!("{e:#}"), "failed to record posted comment");
                    }
                    posted.push(comment);
                }
                Err(e) => {
                    error!(error = format!("{e:#}"), "failed to post comment");
                    let mut comment = comment;
                    comment.rejection_reason =
                        Some(format!("failed to post comment, error: {e:#}"));
                    filtered.push(comment);
                }
            }
        }

        debug_assert_eq!(posted.len() + filtered.len(), total);

        let approval = if self.automatic_approval && posted.is_empty() {
            self.decide_approval(repo, pr_number, &filtered).await
        } else {
            ApprovalOutcome::NotEvaluated
        };

        PostOutcome {
            posted,
            filtered,
            approval,
        }
    }

    async fn decide_approval(
        &self,
        repo: &RepoRef,
        pr_number: u64,
        comments: &[ReviewComment],
    ) -> ApprovalOutcome {
        let verdict = match self.should_approve(comments).await {
            Ok(verdict) => verdict,
            Err(e) => {
                info!(
                    pr_number,
                    error = format!("{e:#}"),
                    "failed to determine whether to approve"
                );
                return ApprovalOutcome::Failed {
                    error: format!("{e:#}"),
                };
            }
        };

        if !verdict.approved {
            if !verdict.reason.is_empty() {
                info!(pr_number, reason = %verdict.reason, "PR not approved");
            }
            return ApprovalOutcome::Declined {
                reason: verdict.reason,
            };
        }

        let message = approval_message(&verdict.reason);
        if let Err(e) = self
            .vcs
            .approve_pull_request(repo, pr_number, &message)
            .await
        {
            warn!(pr_number, error = format!("{e:#}"), "failed to approve PR");
            return ApprovalOutcome::Failed {
                error: format!("failed to approve PR: {e:#}"),
            };
        }

        self.notifier
            .notify(&format!("✅ PR {pr_number} approved"))
            .await;
        info!(pr_number, reason = %verdict.reason, "PR approved");
        ApprovalOutcome::Approved {
            reason: verdict.reason,
        }
    }

    /// Ask the decision backend whether the PR should be approved given the
    /// full (pre-filtering) comment set. An empty set approves outright.
    async fn should_approve(&self, comments: &[ReviewComment]) -> Result<ApprovalVerdict> {
        if comments.is_empty() {
            return Ok(ApprovalVerdict {
                approved: true,
                reason: GENERIC_APPROVAL_REASON.to_string(),
            });
        }

        let (system, user) = build_decision_request(comments);
        let response = self
            .decision_backend
            .call(&system, &user)
            .await
            .context("approval decision call failed")?;
        Ok(parse_verdict(&response)?)
    }
}
