//! Prompt construction and token-budget pruning.
//!
//! The system message is a JSON document describing the reviewer role plus
//! whatever additional context survived assembly; the user message carries
//! the file changes. Both are rebuilt, not sliced, when a smaller ceiling is
//! requested, so pruning stays deterministic.

use serde_json::{json, Map, Value};

use crate::comment::PullRequestFile;
use crate::tokens::{estimate_tokens, MAX_ALLOWED_TOKENS};

/// Appended to every surviving comment that carries a committable
/// suggestion block.
pub const SUGGESTION_DISCLAIMER: &str = "\n\n⚡ **Committable suggestion**\n\n\
Carefully review the code before committing. Ensure that it accurately replaces the highlighted code, \
contains no missing lines, and has no issues with indentation.";

/// Substrings that mark an assembled context sub-section as broken analysis
/// output rather than usable signal.
pub const CONTEXT_ERROR_KEYWORDS: &[&str] = &["error", "fail", "timeout", "exceeded", "invalid"];

/// Smallest user-message budget the pruning loop will try before giving up.
const MIN_USER_BUDGET_TOKENS: usize = 256;

/// Remove object-valued context sub-sections whose keys or string values
/// contain an error-indicating keyword, so broken analysis never reaches the
/// model. Returns the removed keys.
pub fn strip_failed_sections(context: &mut Map<String, Value>) -> Vec<String> {
    let mut removed = Vec::new();
    let keys: Vec<String> = context.keys().cloned().collect();
    for key in keys {
        let Some(Value::Object(section)) = context.get(&key) else {
            continue;
        };
        let has_error = section.iter().any(|(k, v)| {
            let key_hit = CONTEXT_ERROR_KEYWORDS
                .iter()
                .any(|kw| k.to_lowercase().contains(kw));
            let value_hit = matches!(v, Value::String(s) if CONTEXT_ERROR_KEYWORDS
                .iter()
                .any(|kw| s.to_lowercase().contains(kw)));
            key_hit || value_hit
        });
        if has_error {
            context.remove(&key);
            removed.push(key);
        }
    }
    removed
}

/// The reviewer framing for the system message.
#[derive(Debug, Clone)]
pub struct SystemMessageConfig {
    pub role: String,
    pub objective: String,
    pub guidelines: String,
    pub thought_process: String,
    pub brevity: String,
}

impl Default for SystemMessageConfig {
    fn default() -> Self {
        Self {
            role: "You are a world class software engineer and an expert in code review."
                .to_string(),
            objective: "You are conducting a code review for another member of your team. \
Provide ONLY specific, actionable, and concise feedback that directly improves code quality."
                .to_string(),
            guidelines: "Focus exclusively on substantive issues. If you have any feedback, \
provide code snippets or specific suggestions with examples in Markdown format."
                .to_string(),
            thought_process: "Think deeply and reason about how a world-class engineer would \
approach this code review. Think through all possibilities and trade-offs, critique them, \
refine your thinking, and then focus on only feedback that is actionable and relevant. \
IMPORTANT: Do not comment just to acknowledge that code is already correct or follows best \
practices. Only provide comments when there is a concrete improvement or correction to suggest."
                .to_string(),
            brevity: "Be concise and focused in your review, do not include any reviews that \
might be subjective or are not actionable. Having extra comments that are not actionable will \
not improve code quality, it will go against the best practices of code review."
                .to_string(),
        }
    }
}

const RESPONSE_FORMAT: &str = "Respond with a JSON array of review comments. Each element must \
have \"path\" (file path), \"line\" (line number in the new file), optional \"start_line\" for \
multi-line comments, and \"body\" (Markdown) fields. Respond with [] when there is nothing \
worth raising.";

/// A rendered system/user message pair.
#[derive(Debug, Clone)]
pub struct PromptBundle {
    pub system: String,
    pub user: String,
}

impl PromptBundle {
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.system) + estimate_tokens(&self.user)
    }
}

/// Everything needed to (re)build the message pair at any token ceiling.
/// Carried alongside the rendered bundle so the retry protocol can re-prune
/// without reaching back into the orchestrator.
#[derive(Debug, Clone)]
pub struct PromptInputs {
    pub config: SystemMessageConfig,
    pub context: Map<String, Value>,
    pub commit: String,
    pub files: Vec<PullRequestFile>,
    pub personas: Vec<String>,
}

impl PromptInputs {
    pub fn new(context: Map<String, Value>, commit: String, files: Vec<PullRequestFile>) -> Self {
        Self {
            config: SystemMessageConfig::default(),
            context,
            commit,
            files,
            personas: Vec::new(),
        }
    }

    pub fn with_personas(mut self, personas: Vec<String>) -> Self {
        self.personas = personas;
        self
    }

    fn system_message(&self) -> String {
        let role = if self.personas.is_empty() {
            self.config.role.clone()
        } else {
            format!(
                "{} For this review you combine the perspectives of: {}.",
                self.config.role,
                self.personas.join(", ")
            )
        };

        let mut message = Map::new();
        message.insert("role".to_string(), json!(role));
        message.insert("objective".to_string(), json!(self.config.objective));
        message.insert("guidelines".to_string(), json!(self.config.guidelines));
        message.insert(
            "thought_process".to_string(),
            json!(self.config.thought_process),
        );
        message.insert("brevity".to_string(), json!(self.config.brevity));
        message.insert("commit_sha".to_string(), json!(self.commit));
        message.insert("response_format".to_string(), json!(RESPONSE_FORMAT));

        if self
            .context
            .get("committable_suggestions_enabled")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            message.insert(
                "committable_suggestions".to_string(),
                json!(
                    "When a fix is mechanical, include a committable ```suggestion block \
containing the exact replacement for the commented lines."
                ),
            );
        }

        if self
            .context
            .get("duplicate_detection")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            message.insert(
                "duplicate_detection".to_string(),
                json!(
                    "The additional context lists comments already posted on this pull \
request under existing_comments. Do not raise an issue that is already covered by one of them."
                ),
            );
        }

        if !self.context.is_empty() {
            message.insert(
                "additional_context".to_string(),
                Value::Object(self.context.clone()),
            );
        }

        serde_json::to_string_pretty(&Value::Object(message))
            .unwrap_or_else(|_| "{}".to_string())
    }

    /// Build the message pair against the default ceiling, reserving 75% of
    /// the space left after the system message for file content.
    pub fn build(&self) -> PromptBundle {
        self.build_to_ceiling(MAX_ALLOWED_TOKENS)
    }

    /// Build the message pair so its estimated size fits under `ceiling`.
    pub fn build_to_ceiling(&self, ceiling: usize) -> PromptBundle {
        let system = self.system_message();
        let system_tokens = estimate_tokens(&system);
        let mut budget = ceiling.saturating_sub(system_tokens) * 75 / 100;
        let mut user = build_user_message(&self.files, budget);

        while system_tokens + estimate_tokens(&user) > ceiling && budget > MIN_USER_BUDGET_TOKENS {
            budget = budget * 3 / 4;
            user = build_user_message(&self.files, budget);
        }

        PromptBundle { system, user }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

/// Only the hunk headers of a patch: enough for a validator to see which
/// regions changed without paying for the content.
fn patch_structure(patch: &str) -> String {
    patch
        .lines()
        .filter(|l| l.starts_with("@@"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Render the user message: a JSON document of file changes. A zero budget
/// keeps only the patch structure (hunk headers); otherwise each file gets
/// an even share of the character budget for its patch text.
pub fn build_user_message(files: &[PullRequestFile], token_budget: usize) -> String {
    let per_file_chars = if files.is_empty() {
        0
    } else {
        token_budget * 4 / files.len()
    };

    let changes: Vec<Value> = files
        .iter()
        .map(|file| {
            let patch = if token_budget == 0 {
                patch_structure(&file.patch)
            } else {
                truncate_chars(&file.patch, per_file_chars)
            };
            json!({
                "path": file.filename,
                "additions": file.additions,
                "deletions": file.deletions,
                "changes": file.changes,
                "status": file.status,
                "patch": patch,
            })
        })
        .collect();

    serde_json::to_string(&json!({ "file_changes": changes }))
        .unwrap_or_else(|_| r#"{"file_changes": []}"#.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, patch: &str) -> PullRequestFile {
        PullRequestFile {
            filename: name.to_string(),
            status: "modified".to_string(),
            additions: 1,
            deletions: 1,
            changes: 2,
            patch: patch.to_string(),
        }
    }

    fn context_with(key: &str, value: Value) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(key.to_string(), value);
        map
    }

    #[test]
    fn strips_sections_with_error_values() {
        let mut context = Map::new();
        context.insert(
            "code_index".to_string(),
            json!({"analysis": "request Timeout exceeded while indexing"}),
        );
        context.insert(
            "dependencies".to_string(),
            json!({"graph": "a -> b -> c"}),
        );
        let removed = strip_failed_sections(&mut context);
        assert_eq!(removed, vec!["code_index".to_string()]);
        assert!(context.contains_key("dependencies"));
    }

    #[test]
    fn strips_sections_with_error_keys() {
        let mut context = context_with("language_signals", json!({"parse_errors": 3}));
        let removed = strip_failed_sections(&mut context);
        assert_eq!(removed.len(), 1);
        assert!(context.is_empty());
    }

    #[test]
    fn keyword_match_is_case_insensitive() {
        let mut context = context_with("scan", json!({"status": "INVALID state"}));
        assert_eq!(strip_failed_sections(&mut context).len(), 1);
    }

    #[test]
    fn non_object_sections_are_untouched() {
        let mut context = context_with("note", json!("an error happened"));
        assert!(strip_failed_sections(&mut context).is_empty());
        assert!(context.contains_key("note"));
    }

    #[test]
    fn zero_budget_keeps_only_patch_structure() {
        let files = vec![file(
            "a.rs",
            "@@ -1,3 +1,4 @@\n context\n+added line\n@@ -10,2 +11,2 @@\n more",
        )];
        let message = build_user_message(&files, 0);
        assert!(message.contains("@@ -1,3 +1,4 @@"));
        assert!(!message.contains("added line"));
    }

    #[test]
    fn budget_truncates_long_patches() {
        let long_patch = "x".repeat(10_000);
        let files = vec![file("a.rs", &long_patch)];
        let message = build_user_message(&files, 100);
        // 100 tokens ~ 400 chars of patch for the single file.
        assert!(message.len() < 1_000);
    }

    #[test]
    fn build_fits_requested_ceiling() {
        let big = "+".to_string() + &"line of code\n".repeat(4_000);
        let files = vec![file("a.rs", &big), file("b.rs", &big)];
        let inputs = PromptInputs::new(Map::new(), "abc123".to_string(), files);
        let ceiling = 2_000;
        let bundle = inputs.build_to_ceiling(ceiling);
        assert!(bundle.estimated_tokens() <= ceiling + MIN_USER_BUDGET_TOKENS);
    }

    #[test]
    fn personas_flavor_the_role() {
        let inputs = PromptInputs::new(Map::new(), "abc".to_string(), vec![])
            .with_personas(vec!["security auditor".to_string()]);
        let bundle = inputs.build();
        assert!(bundle.system.contains("security auditor"));
    }

    #[test]
    fn duplicate_detection_marker_adds_guidance() {
        let mut context = Map::new();
        context.insert("duplicate_detection".to_string(), json!(true));
        context.insert("existing_comments".to_string(), json!([{"body": "old"}]));
        let inputs = PromptInputs::new(context, "abc".to_string(), vec![]);
        let bundle = inputs.build();
        assert!(bundle.system.contains("existing_comments"));
        assert!(bundle.system.contains("already posted"));
    }
}
