//! The review workflow: fetch, contextualize, dispatch, validate, return.
//!
//! Every collaborator is an explicit field rather than ambient state, so
//! each step can be exercised against scripted seams. Failure handling
//! follows a fixed taxonomy: PR and file fetches are fatal, context
//! gathering degrades with a logged warning, and a dispatch failure is
//! reported together with the files that were already retrieved.

use std::sync::Arc;

use serde_json::{json, Map};
use thiserror::Error;
use tracing::{error, info, warn};

use panoptes_core::{
    filter_external_bot_comments, has_suggestion, strip_failed_sections, PromptInputs,
    PullRequestFile, RepoRef, ReviewComment, TokenBudget, MAX_ALLOWED_TOKENS,
    SUGGESTION_DISCLAIMER,
};

use crate::context::{AuthorContext, AuthorContextBuilder, ContextAssembler};
use crate::dispatch::Dispatcher;
use crate::duplicate::DuplicateDetector;
use crate::flags::{FeatureFlag, FeatureFlags};
use crate::github::VcsHost;
use crate::validation::ValidationPipeline;

/// Per-company workflow settings that flavor a review.
#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub company_id: u64,
    /// Login of our own bot account, so its prior comments are not treated
    /// as external bot noise.
    pub bot_login: String,
    pub active_personas: Vec<String>,
    pub committable_suggestions: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReviewOptions {
    /// Return early with an empty comment set when the PR already has an
    /// approving review.
    pub skip_if_approved: bool,
    /// Fetch existing comments and deduplicate against them (best-effort).
    pub dedupe_existing: bool,
}

#[derive(Debug)]
pub struct ReviewOutcome {
    pub comments: Vec<ReviewComment>,
    pub files: Vec<PullRequestFile>,
}

/// A failed review still hands back whatever files were fetched before the
/// failure, since callers often want them regardless.
#[derive(Debug, Error)]
#[error("{error:#}")]
pub struct ReviewFailure {
    pub error: anyhow::Error,
    pub files: Vec<PullRequestFile>,
}

pub struct ReviewOrchestrator {
    vcs: Arc<dyn VcsHost>,
    dispatcher: Dispatcher,
    validation: ValidationPipeline,
    duplicates: DuplicateDetector,
    flags: Arc<dyn FeatureFlags>,
    settings: WorkflowSettings,
}

impl ReviewOrchestrator {
    pub fn new(
        vcs: Arc<dyn VcsHost>,
        dispatcher: Dispatcher,
        validation: ValidationPipeline,
        duplicates: DuplicateDetector,
        flags: Arc<dyn FeatureFlags>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            vcs,
            dispatcher,
            validation,
            duplicates,
            flags,
            settings,
        }
    }

    /// Review one pull request and return the final comment set plus the
    /// changed file list.
    pub async fn review_pull_request(
        &self,
        repo: &RepoRef,
        pr_number: u64,
        assembler: Option<&dyn ContextAssembler>,
        opts: ReviewOptions,
    ) -> Result<ReviewOutcome, ReviewFailure> {
        let company_id = self.settings.company_id;

        let request = match self.vcs.get_pull_request(repo, pr_number).await {
            Ok(request) => request,
            Err(e) => {
                return Err(ReviewFailure {
                    error: e.context("failed to get PR details"),
                    files: Vec::new(),
                })
            }
        };
        info!(pr_number, title = %request.title, commit = %request.head_sha, "reviewing pull request");

        if opts.skip_if_approved && self.is_already_approved(repo, pr_number).await {
            info!(pr_number, "PR has already been approved; skipping review");
            return Ok(ReviewOutcome {
                comments: Vec::new(),
                files: Vec::new(),
            });
        }

        let files = match self.vcs.list_files(repo, pr_number).await {
            Ok(files) => files,
            Err(e) => {
                return Err(ReviewFailure {
                    error: e.context("failed to get PR files"),
                    files: Vec::new(),
                })
            }
        };
        info!(count = files.len(), "found changed files");

        let mut existing = Vec::new();
        if opts.dedupe_existing {
            match self.vcs.list_review_comments(repo, pr_number).await {
                Ok(comments) => {
                    existing = filter_external_bot_comments(comments, &self.settings.bot_login);
                    info!(count = existing.len(), "found existing comments");
                }
                Err(e) => {
                    // Deduplication is best-effort; the review proceeds.
                    warn!(
                        pr_number,
                        error = format!("{e:#}"),
                        "failed to fetch existing comments; continuing without them"
                    );
                }
            }
        }

        let author_builder = AuthorContextBuilder::new(self.vcs.as_ref());
        let author_context = match author_builder
            .build(repo, pr_number, request.body.as_deref(), &request.author)
            .await
        {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(
                    pr_number,
                    author = %request.author,
                    error = format!("{e:#}"),
                    "failed to build author context; continuing without it"
                );
                AuthorContext::content_free(&request.author)
            }
        };

        let mut context = match assembler {
            Some(assembler) => match assembler.assemble(&files, company_id).await {
                Ok(map) => map,
                Err(e) => {
                    warn!(
                        pr_number,
                        error = format!("{e:#}"),
                        "failed to assemble additional context; continuing with none"
                    );
                    Map::new()
                }
            },
            None => Map::new(),
        };
        let removed = strip_failed_sections(&mut context);
        if !removed.is_empty() {
            warn!(?removed, "removed context sections with error indicators");
        }

        let separate_dedup = self
            .flags
            .is_enabled(FeatureFlag::SeparateDuplicateDetection, company_id);
        if !separate_dedup && !existing.is_empty() {
            if let Ok(value) = serde_json::to_value(&existing) {
                context.insert("existing_comments".to_string(), value);
                context.insert("duplicate_detection".to_string(), json!(true));
            }
            info!(
                existing = existing.len(),
                "including existing comments in the main review context"
            );
        } else if separate_dedup {
            info!(
                existing = existing.len(),
                "existing comments reserved for separate duplicate detection"
            );
        }

        if author_context.has_content {
            context.insert("author_context".to_string(), author_context.to_value());
        }
        context.insert(
            "committable_suggestions_enabled".to_string(),
            json!(self.settings.committable_suggestions),
        );

        let personas = if self
            .flags
            .is_enabled(FeatureFlag::ReviewPersonas, company_id)
        {
            self.settings.active_personas.clone()
        } else {
            Vec::new()
        };
        if !personas.is_empty() {
            info!(count = personas.len(), "using persona-flavored review");
        }

        let inputs = Arc::new(
            PromptInputs::new(context, request.head_sha.clone(), files.clone())
                .with_personas(personas),
        );
        let bundle = Arc::new(inputs.build());
        let budget = TokenBudget::new(bundle.estimated_tokens(), MAX_ALLOWED_TOKENS);
        info!(estimated_tokens = budget.estimated, "prepared review prompt");

        let mut comments = match self
            .dispatcher
            .dispatch(
                inputs,
                bundle,
                budget,
                &request.head_sha,
                &files,
                self.flags.as_ref(),
                company_id,
            )
            .await
        {
            Ok(comments) => comments,
            Err(e) => {
                warn!(pr_number, error = %e, "failed to generate review");
                return Err(ReviewFailure {
                    error: anyhow::Error::new(e).context("failed to generate review"),
                    files,
                });
            }
        };

        if separate_dedup {
            match self
                .duplicates
                .annotate_duplicates(comments.clone(), &existing)
                .await
            {
                Ok(updated) => comments = updated,
                Err(e) => {
                    warn!(
                        pr_number,
                        error = format!("{e:#}"),
                        "failed to apply duplicate detection; continuing with original comments"
                    );
                }
            }
        }

        // Previously posted comments feed the inappropriateness check;
        // losing them degrades the check, not the review.
        let previous = match self.vcs.list_review_comments(repo, pr_number).await {
            Ok(comments) => filter_external_bot_comments(comments, &self.settings.bot_login),
            Err(e) => {
                error!(pr_number, error = format!("{e:#}"), "failed to get PR comments");
                Vec::new()
            }
        };

        let mut comments = self
            .validation
            .run(
                comments,
                &files,
                &author_context,
                &previous,
                self.flags.as_ref(),
                company_id,
            )
            .await;

        for comment in comments.iter_mut() {
            if !comment.is_rejected() && has_suggestion(&comment.body) {
                comment.body.push_str(SUGGESTION_DISCLAIMER);
            }
        }

        Ok(ReviewOutcome { comments, files })
    }

    async fn is_already_approved(&self, repo: &RepoRef, pr_number: u64) -> bool {
        match self.vcs.list_reviews(repo, pr_number).await {
            Ok(reviews) => reviews.iter().any(|r| r.state == "APPROVED"),
            Err(e) => {
                // Treat unknown approval state as "not approved" and review.
                error!(pr_number, error = format!("{e:#}"), "failed to get PR reviews");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::ModelBackend;
    use crate::dispatch::BackendPool;
    use crate::testing::{
        make_comment_json, make_file, FixedClassifier, MockVcs, RecordingNotifier,
        ScriptedBackend, StaticFlags,
    };

    const APPROPRIATE: &str = r#"{"appropriate": true, "reason": ""}"#;

    struct World {
        review_backend: Arc<ScriptedBackend>,
        dedup_backend: Arc<ScriptedBackend>,
        orchestrator: ReviewOrchestrator,
    }

    fn world(
        vcs: MockVcs,
        review_backend: ScriptedBackend,
        validator_backend: ScriptedBackend,
        dedup_backend: ScriptedBackend,
        flags: StaticFlags,
    ) -> World {
        let vcs = Arc::new(vcs);
        let review_backend = Arc::new(review_backend);
        let validator_backend = Arc::new(validator_backend);
        let dedup_backend = Arc::new(dedup_backend);
        let dispatcher = Dispatcher::new(
            BackendPool {
                primary: review_backend.clone() as Arc<dyn ModelBackend>,
                secondaries: vec![],
            },
            Arc::new(FixedClassifier::category("bug_risk")),
            Arc::new(RecordingNotifier::default()),
        );
        let validation = ValidationPipeline {
            primary: validator_backend.clone() as Arc<dyn ModelBackend>,
            secondary: None,
            strict_model: "strict-model-v1".to_string(),
        };
        let duplicates = DuplicateDetector::new(dedup_backend.clone() as Arc<dyn ModelBackend>);
        let orchestrator = ReviewOrchestrator::new(
            vcs.clone(),
            dispatcher,
            validation,
            duplicates,
            Arc::new(flags),
            WorkflowSettings {
                company_id: 1,
                bot_login: "panoptes[bot]".to_string(),
                active_personas: vec![],
                committable_suggestions: true,
            },
        );
        World {
            review_backend,
            dedup_backend,
            orchestrator,
        }
    }

    fn repo() -> RepoRef {
        RepoRef::new("acme", "widgets")
    }

    fn basic_vcs() -> MockVcs {
        MockVcs::default()
            .with_pr(&repo(), 42, "abc123")
            .with_files(vec![make_file("src/a.rs", "@@ -1,2 +1,3 @@\n ctx\n+new line")])
    }

    fn validator() -> ScriptedBackend {
        ScriptedBackend::new("anthropic", "validator").otherwise(APPROPRIATE)
    }

    fn dedup() -> ScriptedBackend {
        ScriptedBackend::new("anthropic", "dedup")
    }

    #[tokio::test]
    async fn pr_fetch_failure_is_fatal_with_no_files() {
        let vcs = MockVcs {
            fail_pr: true,
            ..MockVcs::default()
        };
        let w = world(
            vcs,
            ScriptedBackend::new("anthropic", "m1"),
            validator(),
            dedup(),
            StaticFlags::default(),
        );

        let err = w
            .orchestrator
            .review_pull_request(&repo(), 42, None, ReviewOptions::default())
            .await
            .unwrap_err();

        assert!(err.files.is_empty());
        assert!(err.to_string().contains("failed to get PR details"));
        assert_eq!(w.review_backend.calls(), 0);
    }

    #[tokio::test]
    async fn file_fetch_failure_is_fatal() {
        let vcs = MockVcs {
            fail_files: true,
            ..basic_vcs()
        };
        let w = world(
            vcs,
            ScriptedBackend::new("anthropic", "m1"),
            validator(),
            dedup(),
            StaticFlags::default(),
        );

        let err = w
            .orchestrator
            .review_pull_request(&repo(), 42, None, ReviewOptions::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("failed to get PR files"));
        assert_eq!(w.review_backend.calls(), 0);
    }

    #[tokio::test]
    async fn already_approved_pr_is_a_successful_no_op() {
        let vcs = basic_vcs().with_reviews(&["COMMENTED", "APPROVED"]);
        let w = world(
            vcs,
            ScriptedBackend::new("anthropic", "m1"),
            validator(),
            dedup(),
            StaticFlags::default(),
        );

        let outcome = w
            .orchestrator
            .review_pull_request(
                &repo(),
                42,
                None,
                ReviewOptions {
                    skip_if_approved: true,
                    dedupe_existing: false,
                },
            )
            .await
            .unwrap();

        assert!(outcome.comments.is_empty());
        assert!(outcome.files.is_empty());
        assert_eq!(w.review_backend.calls(), 0);
    }

    #[tokio::test]
    async fn review_state_fetch_failure_degrades_to_reviewing() {
        let vcs = MockVcs {
            fail_reviews: true,
            ..basic_vcs()
        };
        let w = world(
            vcs,
            ScriptedBackend::new("anthropic", "m1")
                .responds(&make_comment_json(&[("src/a.rs", 3, "finding")])),
            validator(),
            dedup(),
            StaticFlags::default(),
        );

        let outcome = w
            .orchestrator
            .review_pull_request(
                &repo(),
                42,
                None,
                ReviewOptions {
                    skip_if_approved: true,
                    dedupe_existing: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.comments.len(), 1);
    }

    #[tokio::test]
    async fn happy_path_returns_stamped_classified_comments() {
        let w = world(
            basic_vcs(),
            ScriptedBackend::new("anthropic", "m1")
                .responds(&make_comment_json(&[("src/a.rs", 3, "Unchecked error.")])),
            validator(),
            dedup(),
            StaticFlags::default(),
        );

        let outcome = w
            .orchestrator
            .review_pull_request(&repo(), 42, None, ReviewOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.files.len(), 1);
        let comment = &outcome.comments[0];
        assert_eq!(comment.provider, "anthropic");
        assert_eq!(comment.commit_sha, "abc123");
        assert_eq!(comment.category, "bug_risk");
        assert!(comment.body.starts_with("[**BugRisk**]"));
    }

    #[tokio::test]
    async fn dispatch_failure_still_returns_files() {
        let w = world(
            basic_vcs(),
            ScriptedBackend::new("anthropic", "m1").fails("model unavailable"),
            validator(),
            dedup(),
            StaticFlags::default(),
        );

        let err = w
            .orchestrator
            .review_pull_request(&repo(), 42, None, ReviewOptions::default())
            .await
            .unwrap_err();

        assert_eq!(err.files.len(), 1);
        assert!(err.to_string().contains("failed to generate review"));
    }

    #[tokio::test]
    async fn existing_comment_fetch_failure_degrades() {
        let vcs = MockVcs {
            fail_review_comments: true,
            ..basic_vcs()
        };
        let w = world(
            vcs,
            ScriptedBackend::new("anthropic", "m1")
                .responds(&make_comment_json(&[("src/a.rs", 3, "finding")])),
            validator(),
            dedup(),
            StaticFlags::default(),
        );

        let outcome = w
            .orchestrator
            .review_pull_request(
                &repo(),
                42,
                None,
                ReviewOptions {
                    skip_if_approved: false,
                    dedupe_existing: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.comments.len(), 1);
    }

    #[tokio::test]
    async fn author_context_failure_degrades() {
        let vcs = MockVcs {
            fail_issue_comments: true,
            ..basic_vcs()
        };
        let w = world(
            vcs,
            ScriptedBackend::new("anthropic", "m1")
                .responds(&make_comment_json(&[("src/a.rs", 3, "finding")])),
            validator(),
            dedup(),
            StaticFlags::default(),
        );

        let outcome = w
            .orchestrator
            .review_pull_request(&repo(), 42, None, ReviewOptions::default())
            .await
            .unwrap();

        assert_eq!(outcome.comments.len(), 1);
    }

    #[tokio::test]
    async fn legacy_path_folds_existing_comments_into_the_prompt() {
        let vcs = basic_vcs().with_review_comments(vec![("bob", "watch the allocation here")]);
        let w = world(
            vcs,
            ScriptedBackend::new("anthropic", "m1")
                .responds(&make_comment_json(&[("src/a.rs", 3, "finding")])),
            validator(),
            dedup(),
            StaticFlags::default(),
        );

        let _ = w
            .orchestrator
            .review_pull_request(
                &repo(),
                42,
                None,
                ReviewOptions {
                    skip_if_approved: false,
                    dedupe_existing: true,
                },
            )
            .await
            .unwrap();

        let (system, _user) = &w.review_backend.prompts()[0];
        assert!(system.contains("existing_comments"));
        assert!(system.contains("watch the allocation here"));
        assert_eq!(w.dedup_backend.calls(), 0);
    }

    #[tokio::test]
    async fn separate_dedup_path_runs_the_detector_instead() {
        let vcs = basic_vcs().with_review_comments(vec![("bob", "watch the allocation here")]);
        let w = world(
            vcs,
            ScriptedBackend::new("anthropic", "m1")
                .responds(&make_comment_json(&[("src/a.rs", 3, "finding")])),
            validator(),
            dedup().responds(r#"[{"id": "anthropic-1", "valid": true, "explanation": ""}]"#),
            StaticFlags::new([FeatureFlag::SeparateDuplicateDetection]),
        );

        let outcome = w
            .orchestrator
            .review_pull_request(
                &repo(),
                42,
                None,
                ReviewOptions {
                    skip_if_approved: false,
                    dedupe_existing: true,
                },
            )
            .await
            .unwrap();

        let (system, _user) = &w.review_backend.prompts()[0];
        assert!(!system.contains("watch the allocation here"));
        assert_eq!(w.dedup_backend.calls(), 1);
        assert_eq!(outcome.comments.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_detection_failure_keeps_original_comments() {
        let vcs = basic_vcs().with_review_comments(vec![("bob", "prior note")]);
        let w = world(
            vcs,
            ScriptedBackend::new("anthropic", "m1")
                .responds(&make_comment_json(&[("src/a.rs", 3, "finding")])),
            validator(),
            dedup().fails("detector down"),
            StaticFlags::new([FeatureFlag::SeparateDuplicateDetection]),
        );

        let outcome = w
            .orchestrator
            .review_pull_request(
                &repo(),
                42,
                None,
                ReviewOptions {
                    skip_if_approved: false,
                    dedupe_existing: true,
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.comments.len(), 1);
        assert!(!outcome.comments[0].is_rejected());
    }

    #[tokio::test]
    async fn surviving_suggestions_get_the_disclaimer() {
        let body = "Simplify:\\n```suggestion\\nlet x = 2;\\n```";
        let raw = format!(
            r#"[{{"path": "src/a.rs", "line": 3, "body": "{body}"}}]"#
        );
        let w = world(
            basic_vcs(),
            ScriptedBackend::new("anthropic", "m1").responds(&raw),
            validator(),
            dedup(),
            StaticFlags::default(),
        );

        let outcome = w
            .orchestrator
            .review_pull_request(&repo(), 42, None, ReviewOptions::default())
            .await
            .unwrap();

        assert!(outcome.comments[0].body.contains("Committable suggestion"));
    }

    #[tokio::test]
    async fn rejected_comments_do_not_get_the_disclaimer() {
        let body = "Simplify:\\n```suggestion\\nlet x = 2;\\n```";
        let raw = format!(
            r#"[{{"path": "src/a.rs", "line": 3, "body": "{body}"}}]"#
        );
        let validator_backend = ScriptedBackend::new("anthropic", "validator")
            .responds(r#"[{"id": "anthropic-1", "valid": false, "explanation": "wrong"}]"#)
            .otherwise(APPROPRIATE);
        let w = world(
            basic_vcs(),
            ScriptedBackend::new("anthropic", "m1").responds(&raw),
            validator_backend,
            dedup(),
            StaticFlags::new([FeatureFlag::ValidateReviews]),
        );

        let outcome = w
            .orchestrator
            .review_pull_request(&repo(), 42, None, ReviewOptions::default())
            .await
            .unwrap();

        assert!(outcome.comments[0].is_rejected());
        assert!(!outcome.comments[0].body.contains("Committable suggestion"));
    }
}
