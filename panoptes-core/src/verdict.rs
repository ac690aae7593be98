//! Approval verdict grammar and the decision request sent to a backend.
//!
//! The decision model must answer in exactly one of two forms:
//! `approve[: reason]` or `reject: reason` (case-insensitive prefix, reason
//! trimmed). Anything else is a parse failure and no approval action is
//! taken.

use serde_json::Value;
use thiserror::Error;

use crate::comment::ReviewComment;

/// Reason used when a review produced no comments at all.
pub const GENERIC_APPROVAL_REASON: &str =
    "AI analysis completed with no actionable comments or suggestions.";

/// Outcome of the approval decision grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalVerdict {
    pub approved: bool,
    pub reason: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VerdictParseError {
    #[error("empty verdict response")]
    Empty,
    #[error("rejection verdict is missing a reason")]
    MissingReason,
    #[error("unrecognized verdict response: {0:?}")]
    Unrecognized(String),
}

/// Parse a model's approval decision.
pub fn parse_verdict(response: &str) -> Result<ApprovalVerdict, VerdictParseError> {
    let trimmed = response.trim();
    if trimmed.is_empty() {
        return Err(VerdictParseError::Empty);
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower == "approve" {
        return Ok(ApprovalVerdict {
            approved: true,
            reason: String::new(),
        });
    }
    if lower.starts_with("approve:") {
        return Ok(ApprovalVerdict {
            approved: true,
            reason: trimmed["approve:".len()..].trim().to_string(),
        });
    }
    if lower == "reject" || lower == "reject:" {
        return Err(VerdictParseError::MissingReason);
    }
    if lower.starts_with("reject:") {
        let reason = trimmed["reject:".len()..].trim().to_string();
        if reason.is_empty() {
            return Err(VerdictParseError::MissingReason);
        }
        return Ok(ApprovalVerdict {
            approved: false,
            reason,
        });
    }

    let mut shown = trimmed.to_string();
    if shown.len() > 200 {
        shown.truncate(200);
    }
    Err(VerdictParseError::Unrecognized(shown))
}

/// Best-effort category label for a comment whose body may be JSON-shaped.
pub fn comment_category_label(body: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(body) {
        if let Some(Value::String(t)) = map.get("type") {
            return t.clone();
        }
    }
    "general".to_string()
}

const DECISION_SYSTEM_PROMPT: &str = r#"You are a code review approval decision maker. Your task is to determine if a pull request should be approved based on the code review comments.

You should consider:
1. The severity of the issues identified in the comments
2. Whether the issues are blockers or just suggestions
3. The overall quality of the code based on the comments

You should approve if the overall quality is good and there are no major issues.
You should reject if there are major issues that need to be addressed before the PR should be approved.

Respond with ONLY one of these formats:
- "approve: [reason]" if the PR should be approved
- "reject: [reason]" if the PR should not be approved

Reasoning guidelines:
- Your reason must be specific, concise, and grounded in the actual review comments.
- Do not hallucinate or infer anything beyond what is explicitly stated.
- If the review comments contain only vague approvals like "LGTM" or "No issues", you may omit the reason entirely by responding with just: "approve" (no colon, no explanation).
- Avoid repeating "LGTM", "Looks good", or similar phrases in the reason unless you're quoting a reviewer directly for traceability.

Only provide a reason when it adds clarity about **why** the PR is safe to approve based on actual reviewer feedback."#;

/// Build the system/user message pair for the approval decision, enumerating
/// every comment with its best-effort category label.
pub fn build_decision_request(comments: &[ReviewComment]) -> (String, String) {
    let mut user = String::from(
        "Please evaluate if this pull request should be approved based on the following code review comments:\n\n",
    );
    for (i, comment) in comments.iter().enumerate() {
        let label = comment_category_label(&comment.body);
        user.push_str(&format!(
            "Comment {} (type: {}):\n{}\n\n",
            i + 1,
            label,
            comment.body
        ));
    }
    (DECISION_SYSTEM_PROMPT.to_string(), user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_approve_with_reason() {
        let verdict = parse_verdict("Approve: tests cover the change").unwrap();
        assert!(verdict.approved);
        assert_eq!(verdict.reason, "tests cover the change");
    }

    #[test]
    fn parses_bare_approve() {
        let verdict = parse_verdict("  approve  ").unwrap();
        assert!(verdict.approved);
        assert!(verdict.reason.is_empty());
    }

    #[test]
    fn parses_reject_with_reason() {
        let verdict = parse_verdict("REJECT: unchecked error on the write path").unwrap();
        assert!(!verdict.approved);
        assert_eq!(verdict.reason, "unchecked error on the write path");
    }

    #[test]
    fn bare_reject_is_missing_reason() {
        assert_eq!(parse_verdict("reject"), Err(VerdictParseError::MissingReason));
        assert_eq!(parse_verdict("reject:  "), Err(VerdictParseError::MissingReason));
    }

    #[test]
    fn empty_response_is_an_error() {
        assert_eq!(parse_verdict("   "), Err(VerdictParseError::Empty));
    }

    #[test]
    fn freeform_prose_is_unrecognized() {
        assert!(matches!(
            parse_verdict("This PR looks reasonable to me overall."),
            Err(VerdictParseError::Unrecognized(_))
        ));
    }

    #[test]
    fn category_label_from_json_body() {
        assert_eq!(
            comment_category_label(r#"{"type": "security", "body": "x"}"#),
            "security"
        );
        assert_eq!(comment_category_label("plain markdown comment"), "general");
        assert_eq!(comment_category_label(r#"{"body": "no type"}"#), "general");
    }

    fn comment(id: &str, body: &str) -> ReviewComment {
        ReviewComment {
            id: id.to_string(),
            path: "a.rs".to_string(),
            line: 1,
            start_line: None,
            body: body.to_string(),
            category: String::new(),
            provider: "anthropic".to_string(),
            model: "m".to_string(),
            commit_sha: "s".to_string(),
            rejection_reason: None,
            rejection_model: None,
            acceptance_reason: None,
        }
    }

    #[test]
    fn decision_request_enumerates_comments() {
        let comments = vec![
            comment("a-1", "First issue"),
            comment("a-2", r#"{"type": "style", "note": "second"}"#),
        ];
        let (_system, user) = build_decision_request(&comments);
        assert!(user.contains("Comment 1 (type: general)"));
        assert!(user.contains("Comment 2 (type: style)"));
    }

    proptest! {
        #[test]
        fn approve_reason_roundtrips(reason in "[ -~]{1,60}") {
            // Any printable reason after "approve:" parses as an approval
            // with that reason trimmed.
            let parsed = parse_verdict(&format!("approve: {reason}"));
            prop_assert!(parsed.is_ok());
            let verdict = parsed.unwrap();
            prop_assert!(verdict.approved);
            prop_assert_eq!(verdict.reason, reason.trim().to_string());
        }

        #[test]
        fn arbitrary_prose_never_panics(text in "\\PC{0,200}") {
            let _ = parse_verdict(&text);
        }
    }
}
