//! Multi-pass validation of merged review comments.
//!
//! Each model-backed pass re-reviews the working comment list and annotates
//! entries with acceptance or rejection reasons; comments are never removed,
//! so the poster still sees the full audit trail. Passes are best-effort: a
//! failed pass leaves the working set untouched. The deterministic no-op
//! check and the model-backed inappropriateness check run once afterwards.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use panoptes_core::{
    build_user_message, extract_json_object, parse_validation_replies, suggestion_is_noop,
    ExistingComment, PullRequestFile, ReviewComment, NOOP_DETECTION_MODEL, NOOP_REJECTION_REASON,
};

use crate::backends::ModelBackend;
use crate::context::AuthorContext;
use crate::flags::{FeatureFlag, FeatureFlags};

const VALIDATION_SYSTEM_PROMPT: &str = "You audit code review comments before they are posted. \
For each candidate comment, decide whether it is a valid, actionable observation about the \
patch. Mark a comment invalid when it is factually wrong about the code, not actionable, \
already addressed, or outside the changed lines. Respond with a JSON array containing one \
entry per candidate: {\"id\": \"...\", \"valid\": true|false, \"explanation\": \"...\"}. \
Include every candidate id exactly once.";

const APPROPRIATENESS_SYSTEM_PROMPT: &str = "You decide whether a single code review comment \
is appropriate to post. A comment is inappropriate when it repeats feedback already present \
in the earlier comments, targets lines that the patch does not change, or is too vague to \
act on. Respond with a JSON object: {\"appropriate\": true|false, \"reason\": \"...\"}.";

#[derive(Debug, Deserialize)]
struct AppropriatenessReply {
    appropriate: bool,
    #[serde(default)]
    reason: String,
}

fn parse_appropriateness(raw: &str) -> Result<(bool, String)> {
    let payload =
        extract_json_object(raw).ok_or_else(|| anyhow!("response contains no JSON object"))?;
    let reply: AppropriatenessReply =
        serde_json::from_str(payload).context("failed to parse appropriateness reply")?;
    Ok((reply.appropriate, reply.reason))
}

struct Pass<'a> {
    flag: FeatureFlag,
    backend: &'a dyn ModelBackend,
    model_override: Option<&'a str>,
    label: &'static str,
}

/// The sequential validation passes plus the per-comment checks.
pub struct ValidationPipeline {
    pub primary: Arc<dyn ModelBackend>,
    pub secondary: Option<Arc<dyn ModelBackend>>,
    /// Model variant the strict pass pins the primary provider to.
    pub strict_model: String,
}

impl ValidationPipeline {
    pub async fn run(
        &self,
        comments: Vec<ReviewComment>,
        files: &[PullRequestFile],
        author: &AuthorContext,
        previous: &[ExistingComment],
        flags: &dyn FeatureFlags,
        company_id: u64,
    ) -> Vec<ReviewComment> {
        let mut working = comments;

        let mut passes: Vec<Pass<'_>> = vec![Pass {
            flag: FeatureFlag::ValidateReviews,
            backend: self.primary.as_ref(),
            model_override: None,
            label: "primary",
        }];
        if let Some(secondary) = &self.secondary {
            passes.push(Pass {
                flag: FeatureFlag::ValidateReviewsSecondary,
                backend: secondary.as_ref(),
                model_override: None,
                label: "secondary",
            });
        }
        passes.push(Pass {
            flag: FeatureFlag::ValidateReviewsStrict,
            backend: self.primary.as_ref(),
            model_override: Some(&self.strict_model),
            label: "strict",
        });

        for pass in passes {
            if !flags.is_enabled(pass.flag, company_id) {
                continue;
            }
            match run_validation_pass(&working, files, author, &pass).await {
                Ok(updated) => working = updated,
                Err(e) => {
                    warn!(
                        pass = pass.label,
                        error = format!("{e:#}"),
                        "validation pass failed; keeping working set"
                    );
                }
            }
        }

        let noop_enabled = flags.is_enabled(FeatureFlag::NoOpSuggestionValidation, company_id);
        self.apply_comment_checks(&mut working, files, previous, noop_enabled)
            .await;

        working
    }

    /// Per-comment checks, skipping anything already rejected. No-op
    /// detection is deterministic and always wins over the model-backed
    /// inappropriateness check.
    async fn apply_comment_checks(
        &self,
        comments: &mut [ReviewComment],
        files: &[PullRequestFile],
        previous: &[ExistingComment],
        noop_enabled: bool,
    ) {
        for comment in comments.iter_mut() {
            if comment.is_rejected() {
                continue;
            }

            if noop_enabled && suggestion_is_noop(comment, files) {
                comment.reject(NOOP_REJECTION_REASON, NOOP_DETECTION_MODEL);
                info!(
                    path = %comment.path,
                    line = comment.line,
                    "skipping no-op suggestion comment"
                );
                continue;
            }

            match self.check_appropriateness(comment, previous, files).await {
                Ok((true, _)) => {}
                Ok((false, reason)) => {
                    comment.reject(reason, self.primary.model().to_string());
                }
                Err(e) => {
                    // Fail open: a broken validator must not suppress review
                    // output.
                    warn!(
                        comment = %comment.id,
                        error = format!("{e:#}"),
                        "appropriateness check failed; leaving comment unannotated"
                    );
                }
            }
        }
    }

    async fn check_appropriateness(
        &self,
        comment: &ReviewComment,
        previous: &[ExistingComment],
        files: &[PullRequestFile],
    ) -> Result<(bool, String)> {
        let user = serde_json::to_string_pretty(&json!({
            "candidate": {
                "path": comment.path,
                "line": comment.line,
                "body": comment.body,
            },
            "previously_posted_comments": previous
                .iter()
                .map(|c| json!({ "author": c.author, "path": c.path, "line": c.line, "body": c.body }))
                .collect::<Vec<_>>(),
            "patch_structure": build_user_message(files, 0),
        }))
        .context("failed to render appropriateness request")?;

        let response = self
            .primary
            .call(APPROPRIATENESS_SYSTEM_PROMPT, &user)
            .await?;
        parse_appropriateness(&response)
    }
}

async fn run_validation_pass(
    working: &[ReviewComment],
    files: &[PullRequestFile],
    author: &AuthorContext,
    pass: &Pass<'_>,
) -> Result<Vec<ReviewComment>> {
    let candidates: Vec<&ReviewComment> = working.iter().filter(|c| !c.is_rejected()).collect();
    if candidates.is_empty() {
        return Ok(working.to_vec());
    }

    let mut request = json!({
        "candidates": candidates
            .iter()
            .map(|c| json!({ "id": c.id, "path": c.path, "line": c.line, "body": c.body }))
            .collect::<Vec<_>>(),
        "patch_structure": build_user_message(files, 0),
    });
    if author.has_content {
        request["author_context"] = author.to_value();
    }
    let user =
        serde_json::to_string_pretty(&request).context("failed to render validation request")?;

    let response = match pass.model_override {
        Some(model) => {
            pass.backend
                .call_with_model(VALIDATION_SYSTEM_PROMPT, &user, model)
                .await?
        }
        None => pass.backend.call(VALIDATION_SYSTEM_PROMPT, &user).await?,
    };
    let replies = parse_validation_replies(&response)
        .context("failed to parse validation pass response")?;
    let model_used = pass
        .model_override
        .unwrap_or_else(|| pass.backend.model())
        .to_string();

    let mut updated = working.to_vec();
    for comment in updated.iter_mut() {
        if comment.is_rejected() {
            continue;
        }
        let Some(reply) = replies.iter().find(|r| r.id == comment.id) else {
            continue;
        };
        if reply.valid.is_truthy() {
            if comment.acceptance_reason.is_none() {
                let reason = if reply.explanation.is_empty() {
                    "validated".to_string()
                } else {
                    reply.explanation.clone()
                };
                comment.accept(reason);
            }
        } else {
            let reason = if reply.explanation.is_empty() {
                "rejected by validation pass".to_string()
            } else {
                reply.explanation.clone()
            };
            comment.reject(reason, model_used.clone());
        }
    }

    info!(
        pass = pass.label,
        candidates = candidates.len(),
        rejected = updated.iter().filter(|c| c.is_rejected()).count(),
        "validation pass complete"
    );
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{make_comment, make_file, ScriptedBackend, StaticFlags};

    const APPROPRIATE: &str = r#"{"appropriate": true, "reason": ""}"#;

    fn pipeline(primary: ScriptedBackend) -> ValidationPipeline {
        ValidationPipeline {
            primary: Arc::new(primary),
            secondary: None,
            strict_model: "strict-model-v1".to_string(),
        }
    }

    fn author() -> AuthorContext {
        AuthorContext::content_free("alice")
    }

    #[tokio::test]
    async fn pass_annotates_accept_and_reject_by_id() {
        let primary = ScriptedBackend::new("anthropic", "m1")
            .responds(
                r#"[
                    {"id": "a.rs-1", "valid": true, "explanation": "correct observation"},
                    {"id": "b.rs-2", "valid": false, "explanation": "not in the diff"}
                ]"#,
            )
            .responds(APPROPRIATE);
        let flags = StaticFlags::new([FeatureFlag::ValidateReviews]);
        let comments = vec![make_comment("a.rs", 1, "first"), make_comment("b.rs", 2, "second")];

        let result = pipeline(primary)
            .run(comments, &[], &author(), &[], &flags, 1)
            .await;

        assert_eq!(
            result[0].acceptance_reason.as_deref(),
            Some("correct observation")
        );
        assert!(!result[0].is_rejected());
        assert!(result[1].is_rejected());
        assert_eq!(result[1].rejection_reason.as_deref(), Some("not in the diff"));
        assert_eq!(result[1].rejection_model.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn failed_pass_leaves_working_set_unchanged() {
        let primary = ScriptedBackend::new("anthropic", "m1")
            .fails("validator down")
            .responds(APPROPRIATE);
        let flags = StaticFlags::new([FeatureFlag::ValidateReviews]);
        let comments = vec![make_comment("a.rs", 1, "first")];

        let result = pipeline(primary)
            .run(comments.clone(), &[], &author(), &[], &flags, 1)
            .await;

        assert_eq!(result[0].body, comments[0].body);
        assert!(!result[0].is_rejected());
        assert!(result[0].acceptance_reason.is_none());
    }

    #[tokio::test]
    async fn disabled_passes_do_not_call_the_backend() {
        let primary = ScriptedBackend::new("anthropic", "m1").responds(APPROPRIATE);
        let shared = Arc::new(primary);
        let pipeline = ValidationPipeline {
            primary: shared.clone(),
            secondary: None,
            strict_model: "strict-model-v1".to_string(),
        };
        let flags = StaticFlags::default();
        let comments = vec![make_comment("a.rs", 1, "first")];

        let _ = pipeline
            .run(comments, &[], &author(), &[], &flags, 1)
            .await;

        // Only the appropriateness check ran.
        assert_eq!(shared.calls(), 1);
    }

    #[tokio::test]
    async fn strict_pass_pins_the_model_variant() {
        let primary = ScriptedBackend::new("anthropic", "m1")
            .responds(r#"[{"id": "a.rs-1", "valid": true, "explanation": "fine"}]"#)
            .responds(APPROPRIATE);
        let shared = Arc::new(primary);
        let pipeline = ValidationPipeline {
            primary: shared.clone(),
            secondary: None,
            strict_model: "strict-model-v1".to_string(),
        };
        let flags = StaticFlags::new([FeatureFlag::ValidateReviewsStrict]);
        let comments = vec![make_comment("a.rs", 1, "first")];

        let _ = pipeline
            .run(comments, &[], &author(), &[], &flags, 1)
            .await;

        assert_eq!(shared.model_overrides(), vec!["strict-model-v1".to_string()]);
    }

    #[tokio::test]
    async fn strict_rejection_carries_the_pinned_model_tag() {
        let primary = ScriptedBackend::new("anthropic", "m1")
            .responds(r#"[{"id": "a.rs-1", "valid": "no", "explanation": "wrong"}]"#);
        let flags = StaticFlags::new([FeatureFlag::ValidateReviewsStrict]);
        let comments = vec![make_comment("a.rs", 1, "first")];

        let result = pipeline(primary)
            .run(comments, &[], &author(), &[], &flags, 1)
            .await;

        assert!(result[0].is_rejected());
        assert_eq!(
            result[0].rejection_model.as_deref(),
            Some("strict-model-v1")
        );
    }

    const NOOP_PATCH: &str = "@@ -1,2 +1,2 @@\n context\n+let x = 1;";

    fn noop_comment() -> ReviewComment {
        let mut c = make_comment("a.rs", 2, "");
        c.body = "Tidy this up:\n```suggestion\nlet x = 1;\n```".to_string();
        c
    }

    #[tokio::test]
    async fn noop_suggestion_is_rejected_without_a_model_call() {
        let primary = ScriptedBackend::new("anthropic", "m1");
        let shared = Arc::new(primary);
        let pipeline = ValidationPipeline {
            primary: shared.clone(),
            secondary: None,
            strict_model: "strict-model-v1".to_string(),
        };
        let flags = StaticFlags::new([FeatureFlag::NoOpSuggestionValidation]);
        let files = vec![make_file("a.rs", NOOP_PATCH)];

        let result = pipeline
            .run(vec![noop_comment()], &files, &author(), &[], &flags, 1)
            .await;

        assert!(result[0].is_rejected());
        assert_eq!(
            result[0].rejection_reason.as_deref(),
            Some(NOOP_REJECTION_REASON)
        );
        assert_eq!(
            result[0].rejection_model.as_deref(),
            Some(NOOP_DETECTION_MODEL)
        );
        // The appropriateness check never ran for the rejected comment.
        assert_eq!(shared.calls(), 0);
    }

    #[tokio::test]
    async fn noop_rejection_wins_over_earlier_acceptance() {
        let primary = ScriptedBackend::new("anthropic", "m1");
        let flags = StaticFlags::new([FeatureFlag::NoOpSuggestionValidation]);
        let files = vec![make_file("a.rs", NOOP_PATCH)];
        let mut comment = noop_comment();
        comment.accept("looked good to an earlier pass");

        let result = pipeline(primary)
            .run(vec![comment], &files, &author(), &[], &flags, 1)
            .await;

        assert!(result[0].is_rejected());
        assert_eq!(
            result[0].rejection_reason.as_deref(),
            Some(NOOP_REJECTION_REASON)
        );
    }

    #[tokio::test]
    async fn noop_check_is_skipped_when_flag_is_off() {
        let primary = ScriptedBackend::new("anthropic", "m1").responds(APPROPRIATE);
        let flags = StaticFlags::default();
        let files = vec![make_file("a.rs", NOOP_PATCH)];

        let result = pipeline(primary)
            .run(vec![noop_comment()], &files, &author(), &[], &flags, 1)
            .await;

        assert!(!result[0].is_rejected());
    }

    #[tokio::test]
    async fn inappropriate_comment_gets_the_primary_model_tag() {
        let primary = ScriptedBackend::new("anthropic", "m1")
            .responds(r#"{"appropriate": false, "reason": "duplicates earlier feedback"}"#);
        let flags = StaticFlags::default();

        let result = pipeline(primary)
            .run(vec![make_comment("a.rs", 1, "first")], &[], &author(), &[], &flags, 1)
            .await;

        assert!(result[0].is_rejected());
        assert_eq!(
            result[0].rejection_reason.as_deref(),
            Some("duplicates earlier feedback")
        );
        assert_eq!(result[0].rejection_model.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn appropriateness_failure_fails_open() {
        let primary = ScriptedBackend::new("anthropic", "m1").fails("validator down");
        let flags = StaticFlags::default();

        let result = pipeline(primary)
            .run(vec![make_comment("a.rs", 1, "first")], &[], &author(), &[], &flags, 1)
            .await;

        assert!(!result[0].is_rejected());
        assert!(result[0].acceptance_reason.is_none());
    }

    #[tokio::test]
    async fn rejected_comments_are_not_sent_to_passes() {
        let primary = ScriptedBackend::new("anthropic", "m1");
        let shared = Arc::new(primary);
        let pipeline = ValidationPipeline {
            primary: shared.clone(),
            secondary: None,
            strict_model: "strict-model-v1".to_string(),
        };
        let flags = StaticFlags::new([FeatureFlag::ValidateReviews]);
        let mut comment = make_comment("a.rs", 1, "first");
        comment.reject("already rejected upstream", "m0");

        let result = pipeline
            .run(vec![comment], &[], &author(), &[], &flags, 1)
            .await;

        // No candidates, so neither the pass nor the appropriateness check
        // called the backend.
        assert_eq!(shared.calls(), 0);
        assert_eq!(
            result[0].rejection_reason.as_deref(),
            Some("already rejected upstream")
        );
    }
}
