//! Category label formatting for merged review comments.
//!
//! After classification each comment body carries a single canonical
//! `[**Category**]` prefix followed by a blank line. Normalization strips any
//! prefix a model may have emitted itself so re-running the step is a no-op.

/// Category labels the classifier is allowed to assign.
pub const CATEGORIES: &[&str] = &[
    "bug_risk",
    "security",
    "performance",
    "maintainability",
    "style",
    "testing",
    "documentation",
    "general",
];

/// Convert a snake_case category into the concatenated title-case form used
/// in comment prefixes: `"bug_risk"` becomes `"BugRisk"`.
pub fn format_category(category: &str) -> String {
    category
        .split(['_', ' '])
        .filter(|s| !s.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Re-apply the canonical category prefix to a comment body.
///
/// Strips an existing `[**Category**]` or `[Category]` prefix matching the
/// assigned category, trims leading blank content, and prepends the bold
/// bracket form followed by a blank line. Idempotent by construction.
pub fn normalize_category_prefix(body: &str, category: &str) -> String {
    if category.is_empty() {
        return body.to_string();
    }

    let title = format_category(category);
    let formatted = format!("[**{title}**]");
    let plain = format!("[{title}]");

    let mut rest = body;
    if let Some(stripped) = rest.strip_prefix(&formatted) {
        rest = stripped;
    } else if let Some(stripped) = rest.strip_prefix(&plain) {
        rest = stripped;
    }
    let rest = rest.trim_start_matches([' ', '\n']);

    format!("{formatted}\n\n{rest}")
}
