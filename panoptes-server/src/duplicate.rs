//! Post-generation duplicate detection against comments already on the PR.
//!
//! Only used when the separate-duplicate-detection flag is on; otherwise the
//! existing comments are folded into the main review context instead.
//! Duplicates are annotated with a rejection reason, never removed.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use panoptes_core::{parse_validation_replies, ExistingComment, ReviewComment};

use crate::backends::ModelBackend;

const DUPLICATE_SYSTEM_PROMPT: &str = "You detect duplicated code review feedback. You are \
given candidate comments that are about to be posted, and comments that already exist on the \
pull request. A candidate is a duplicate when an existing comment already raises substantially \
the same issue about the same code, even if it is worded differently. Respond with a JSON \
array containing one entry per candidate: {\"id\": \"...\", \"valid\": true|false, \
\"explanation\": \"...\"}, where valid=false means the candidate duplicates existing feedback. \
Include every candidate id exactly once.";

pub struct DuplicateDetector {
    backend: Arc<dyn ModelBackend>,
}

impl DuplicateDetector {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }

    /// Annotate candidates that duplicate existing comments. Candidates with
    /// no existing feedback to compare against pass through untouched.
    pub async fn annotate_duplicates(
        &self,
        comments: Vec<ReviewComment>,
        existing: &[ExistingComment],
    ) -> Result<Vec<ReviewComment>> {
        if comments.is_empty() || existing.is_empty() {
            return Ok(comments);
        }

        let user = serde_json::to_string_pretty(&json!({
            "candidates": comments
                .iter()
                .filter(|c| !c.is_rejected())
                .map(|c| json!({ "id": c.id, "path": c.path, "line": c.line, "body": c.body }))
                .collect::<Vec<_>>(),
            "existing_comments": existing
                .iter()
                .map(|c| json!({ "author": c.author, "path": c.path, "line": c.line, "body": c.body }))
                .collect::<Vec<_>>(),
        }))
        .context("failed to render duplicate detection request")?;

        let response = self
            .backend
            .call(DUPLICATE_SYSTEM_PROMPT, &user)
            .await
            .context("duplicate detection call failed")?;
        let replies = parse_validation_replies(&response)
            .context("failed to parse duplicate detection response")?;

        let mut updated = comments;
        let mut duplicates = 0usize;
        for comment in updated.iter_mut() {
            if comment.is_rejected() {
                continue;
            }
            let Some(reply) = replies.iter().find(|r| r.id == comment.id) else {
                continue;
            };
            if !reply.valid.is_truthy() {
                let reason = if reply.explanation.is_empty() {
                    "duplicates an existing comment".to_string()
                } else {
                    format!("duplicates an existing comment: {}", reply.explanation)
                };
                comment.reject(reason, self.backend.model().to_string());
                duplicates += 1;
            }
        }

        info!(
            candidates = updated.len(),
            duplicates, "duplicate detection complete"
        );
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_comment, ScriptedBackend};

    fn existing(body: &str) -> ExistingComment {
        ExistingComment {
            id: 1,
            path: Some("a.rs".to_string()),
            line: Some(1),
            author: "bob".to_string(),
            body: body.to_string(),
        }
    }

    #[tokio::test]
    async fn duplicates_are_annotated_not_removed() {
        let backend = ScriptedBackend::new("anthropic", "m1").responds(
            r#"[
                {"id": "a.rs-1", "valid": false, "explanation": "same as bob's note"},
                {"id": "b.rs-2", "valid": true, "explanation": ""}
            ]"#,
        );
        let detector = DuplicateDetector::new(Arc::new(backend));
        let comments = vec![make_comment("a.rs", 1, "first"), make_comment("b.rs", 2, "second")];

        let result = detector
            .annotate_duplicates(comments, &[existing("handle the error here")])
            .await
            .unwrap();

        assert_eq!(result.len(), 2);
        assert!(result[0].is_rejected());
        assert!(result[0]
            .rejection_reason
            .as_deref()
            .unwrap()
            .contains("same as bob's note"));
        assert!(!result[1].is_rejected());
    }

    #[tokio::test]
    async fn no_existing_comments_skips_the_model_call() {
        let backend = ScriptedBackend::new("anthropic", "m1");
        let shared = Arc::new(backend);
        let detector = DuplicateDetector::new(shared.clone());
        let comments = vec![make_comment("a.rs", 1, "first")];

        let result = detector.annotate_duplicates(comments, &[]).await.unwrap();

        assert_eq!(result.len(), 1);
        assert_eq!(shared.calls(), 0);
    }

    #[tokio::test]
    async fn detector_failure_surfaces_as_error() {
        let backend = ScriptedBackend::new("anthropic", "m1").fails("model down");
        let detector = DuplicateDetector::new(Arc::new(backend));
        let comments = vec![make_comment("a.rs", 1, "first")];

        let result = detector
            .annotate_duplicates(comments, &[existing("x")])
            .await;
        assert!(result.is_err());
    }
}
