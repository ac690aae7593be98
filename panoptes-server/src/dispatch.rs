//! Concurrent fan-out to every enabled model backend and the fan-in merge.
//!
//! One task per enabled backend runs the retrying caller; the fan-in loop
//! is a hard barrier that consumes exactly as many results as tasks were
//! launched. The primary backend is authoritative for any contested region
//! of the diff: secondary comments only survive the merge when they target
//! lines nobody has claimed yet.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use panoptes_core::{
    build_full_patch, comments_overlap, normalize_category_prefix, PromptBundle, PromptInputs,
    PullRequestFile, ReviewComment, TokenBudget, CATEGORIES,
};

use crate::backends::ModelBackend;
use crate::caller::call_with_token_retry;
use crate::flags::{FeatureFlag, FeatureFlags};
use crate::notify::Notifier;

/// Labeled outcome of one backend's review task. An empty comment list with
/// no error is a valid "no issues found".
pub struct ModelResult {
    pub backend: String,
    pub outcome: Result<Vec<ReviewComment>>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Every enabled backend failed; the message enumerates each failure.
    #[error("all model backends failed: {summary}")]
    AllBackendsFailed { summary: String },
}

/// Assigns a category label to a merged comment.
#[async_trait]
pub trait CommentClassifier: Send + Sync {
    async fn classify(&self, body: &str, full_patch: &str) -> Result<String>;
}

/// Model-backed classifier: asks a backend for exactly one category name.
pub struct ModelClassifier {
    backend: Arc<dyn ModelBackend>,
}

impl ModelClassifier {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }
}

/// Map a raw classifier response onto a known category.
pub fn parse_category(raw: &str) -> Result<String> {
    let lower = raw.trim().to_lowercase();
    if CATEGORIES.contains(&lower.as_str()) {
        return Ok(lower);
    }
    CATEGORIES
        .iter()
        .find(|c| lower.contains(**c))
        .map(|c| c.to_string())
        .ok_or_else(|| anyhow!("unrecognized category in classifier response: {raw:?}"))
}

#[async_trait]
impl CommentClassifier for ModelClassifier {
    async fn classify(&self, body: &str, full_patch: &str) -> Result<String> {
        let system = format!(
            "You label code review comments with exactly one category. \
Respond with only the category name, one of: {}.",
            CATEGORIES.join(", ")
        );
        let user = format!("Patch under review:\n{full_patch}\n\nComment:\n{body}\n\nCategory:");
        let response = self.backend.call(&system, &user).await?;
        parse_category(&response)
    }
}

/// The primary backend plus flag-gated secondaries, in merge priority order.
pub struct BackendPool {
    pub primary: Arc<dyn ModelBackend>,
    pub secondaries: Vec<(FeatureFlag, Arc<dyn ModelBackend>)>,
}

impl BackendPool {
    fn enabled(
        &self,
        flags: &dyn FeatureFlags,
        company_id: u64,
    ) -> Vec<Arc<dyn ModelBackend>> {
        let mut backends = vec![self.primary.clone()];
        for (flag, backend) in &self.secondaries {
            if flags.is_enabled(*flag, company_id) {
                backends.push(backend.clone());
            }
        }
        backends
    }
}

pub struct Dispatcher {
    pool: BackendPool,
    classifier: Arc<dyn CommentClassifier>,
    notifier: Arc<dyn Notifier>,
}

impl Dispatcher {
    pub fn new(
        pool: BackendPool,
        classifier: Arc<dyn CommentClassifier>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            pool,
            classifier,
            notifier,
        }
    }

    /// Run the prepared message pair through every enabled backend and
    /// return the merged, classified comment list.
    pub async fn dispatch(
        &self,
        inputs: Arc<PromptInputs>,
        bundle: Arc<PromptBundle>,
        budget: TokenBudget,
        commit: &str,
        files: &[PullRequestFile],
        flags: &dyn FeatureFlags,
        company_id: u64,
    ) -> Result<Vec<ReviewComment>, DispatchError> {
        let enabled = self.pool.enabled(flags, company_id);
        let expected = enabled.len();
        info!(backends = expected, "dispatching review to enabled backends");

        let mut tasks: JoinSet<ModelResult> = JoinSet::new();
        for backend in &enabled {
            let backend = backend.clone();
            let inputs = inputs.clone();
            let bundle = bundle.clone();
            let notifier = self.notifier.clone();
            let commit = commit.to_string();
            tasks.spawn(async move {
                let outcome = call_with_token_retry(
                    backend.as_ref(),
                    &inputs,
                    &bundle,
                    &budget,
                    notifier.as_ref(),
                    &commit,
                )
                .await;
                ModelResult {
                    backend: backend.provider().to_string(),
                    outcome,
                }
            });
        }

        // Fan-in barrier: block until every launched task has reported.
        let mut results = Vec::with_capacity(expected);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(join_err) => results.push(ModelResult {
                    backend: "<lost task>".to_string(),
                    outcome: Err(anyhow!("backend task failed to complete: {join_err}")),
                }),
            }
        }
        debug_assert_eq!(results.len(), expected);

        for result in &results {
            if let Err(e) = &result.outcome {
                error!(backend = %result.backend, error = format!("{e:#}"), "backend review failed");
            }
        }

        if results.iter().all(|r| r.outcome.is_err()) {
            let summary = results
                .iter()
                .map(|r| match &r.outcome {
                    Err(e) => format!("{}: {e:#}", r.backend),
                    Ok(_) => format!("{}: ok", r.backend),
                })
                .collect::<Vec<_>>()
                .join("; ");
            return Err(DispatchError::AllBackendsFailed { summary });
        }

        // Restore priority order: results arrive in completion order, but
        // the merge must consider the primary first.
        let mut ordered = Vec::with_capacity(results.len());
        for backend in &enabled {
            if let Some(pos) = results
                .iter()
                .position(|r| r.backend == backend.provider())
            {
                ordered.push(results.remove(pos));
            }
        }
        ordered.append(&mut results);

        let mut merged = merge_results(ordered);
        self.classify_comments(&mut merged, files).await;

        Ok(merged)
    }

    async fn classify_comments(&self, comments: &mut [ReviewComment], files: &[PullRequestFile]) {
        let full_patch = build_full_patch(files);
        for comment in comments.iter_mut() {
            match self.classifier.classify(&comment.body, &full_patch).await {
                Ok(category) => {
                    comment.category = category;
                    comment.body = normalize_category_prefix(&comment.body, &comment.category);
                }
                Err(e) => {
                    warn!(comment = %comment.id, error = %e, "failed to classify comment; keeping it unlabeled");
                }
            }
        }
    }
}

/// Merge per-backend results in priority order. The first result's comments
/// are taken wholesale; later comments survive only with a non-empty body
/// and no target overlap against the merged set.
fn merge_results(ordered: Vec<ModelResult>) -> Vec<ReviewComment> {
    let mut merged: Vec<ReviewComment> = Vec::new();
    let mut counts: Vec<(String, usize)> = Vec::new();

    for (rank, result) in ordered.into_iter().enumerate() {
        let Ok(comments) = result.outcome else {
            counts.push((result.backend, 0));
            continue;
        };
        let before = merged.len();
        if rank == 0 {
            merged.extend(comments);
        } else {
            for comment in comments {
                if comment.body.is_empty() {
                    continue;
                }
                if merged.iter().any(|m| comments_overlap(m, &comment)) {
                    continue;
                }
                merged.push(comment);
            }
        }
        counts.push((result.backend, merged.len() - before));
    }

    info!(?counts, merged = merged.len(), "merged backend results");
    merged
}
