//! One backend call with the token-mismatch recovery protocol.
//!
//! Providers count tokens with their own tokenizers; when our estimate is
//! low the call is rejected with the actual count embedded in the error.
//! That specific failure earns exactly one retry against a reduced ceiling.
//! Every other failure is returned as-is.

use anyhow::{Context, Result};
use tracing::{info, warn};

use panoptes_core::{
    adjusted_token_ceiling, extract_actual_token_count, parse_comments, PromptBundle,
    PromptInputs, ReviewComment, TokenBudget, TOKEN_SAFETY_MARGIN_PERCENT,
};

use crate::backends::ModelBackend;
use crate::notify::Notifier;

/// Call one backend, retrying at most once on a parseable token mismatch,
/// and parse the response into typed comments stamped with provider, model
/// and commit SHA.
pub async fn call_with_token_retry(
    backend: &dyn ModelBackend,
    inputs: &PromptInputs,
    bundle: &PromptBundle,
    budget: &TokenBudget,
    notifier: &dyn Notifier,
    commit: &str,
) -> Result<Vec<ReviewComment>> {
    let mut response = backend.call(&bundle.system, &bundle.user).await;

    if let Err(err) = &response {
        let error_text = format!("{err:#}");
        match extract_actual_token_count(&error_text) {
            Some(actual) => {
                let budget = budget.with_adjusted(adjusted_token_ceiling(
                    budget.ceiling,
                    budget.estimated,
                    actual,
                    TOKEN_SAFETY_MARGIN_PERCENT,
                ));
                let adjusted = budget.adjusted.unwrap_or(budget.ceiling);
                warn!(
                    provider = backend.provider(),
                    estimated = budget.estimated,
                    actual,
                    adjusted,
                    "token mismatch reported by provider; retrying with reduced ceiling"
                );
                notifier
                    .notify(&format!(
                        "🤖 {} token mismatch detected.\n• Count we estimated: {}\n• Provider actual: {}\n• Adjusted max limit: {}",
                        backend.provider(),
                        budget.estimated,
                        actual,
                        adjusted,
                    ))
                    .await;

                let pruned = inputs.build_to_ceiling(adjusted);
                response = backend.call(&pruned.system, &pruned.user).await;

                match &response {
                    Ok(_) => {
                        info!(provider = backend.provider(), "retry after prompt adjustment succeeded");
                        notifier
                            .notify("✅ Retried after prompt adjustment and succeeded.")
                            .await;
                    }
                    Err(retry_err) => {
                        notifier
                            .notify(&format!(
                                "❌ Retried after prompt adjustment but still failed: {retry_err:#}"
                            ))
                            .await;
                    }
                }
            }
            None => {
                notifier
                    .notify(&format!(
                        "⚠️ Could not extract a token count from {} failure: {error_text}",
                        backend.provider()
                    ))
                    .await;
            }
        }
    }

    let raw = response?;
    let mut comments = parse_comments(&raw).with_context(|| {
        format!(
            "failed to parse review comments from {} response",
            backend.provider()
        )
    })?;

    for (i, comment) in comments.iter_mut().enumerate() {
        comment.id = format!("{}-{}", backend.provider(), i + 1);
        comment.provider = backend.provider().to_string();
        comment.model = backend.model().to_string();
        comment.commit_sha = commit.to_string();
    }

    Ok(comments)
}
