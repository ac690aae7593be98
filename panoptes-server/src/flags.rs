//! Company-scoped feature flag evaluation.

use std::collections::HashSet;

/// Flags that gate optional behavior per company.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeatureFlag {
    /// Include the OpenAI backend in review dispatch.
    AddOpenAiResults,
    /// Include the Gemini backend in review dispatch.
    AddGeminiResults,
    /// Run duplicate detection as a separate pass instead of folding
    /// existing comments into the main review context.
    SeparateDuplicateDetection,
    /// Primary-backend validation pass over generated comments.
    ValidateReviews,
    /// Secondary-backend validation pass.
    ValidateReviewsSecondary,
    /// Primary-provider validation pass pinned to the strict model variant.
    ValidateReviewsStrict,
    /// Deterministic rejection of suggestions identical to the code they
    /// replace.
    NoOpSuggestionValidation,
    /// Persona-flavored system messages.
    ReviewPersonas,
}

impl FeatureFlag {
    pub fn key(&self) -> &'static str {
        match self {
            FeatureFlag::AddOpenAiResults => "add_openai_results",
            FeatureFlag::AddGeminiResults => "add_gemini_results",
            FeatureFlag::SeparateDuplicateDetection => "separate_duplicate_detection",
            FeatureFlag::ValidateReviews => "validate_reviews",
            FeatureFlag::ValidateReviewsSecondary => "validate_reviews_secondary",
            FeatureFlag::ValidateReviewsStrict => "validate_reviews_strict",
            FeatureFlag::NoOpSuggestionValidation => "no_op_suggestion_validation",
            FeatureFlag::ReviewPersonas => "review_personas",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        match key {
            "add_openai_results" => Some(FeatureFlag::AddOpenAiResults),
            "add_gemini_results" => Some(FeatureFlag::AddGeminiResults),
            "separate_duplicate_detection" => Some(FeatureFlag::SeparateDuplicateDetection),
            "validate_reviews" => Some(FeatureFlag::ValidateReviews),
            "validate_reviews_secondary" => Some(FeatureFlag::ValidateReviewsSecondary),
            "validate_reviews_strict" => Some(FeatureFlag::ValidateReviewsStrict),
            "no_op_suggestion_validation" => Some(FeatureFlag::NoOpSuggestionValidation),
            "review_personas" => Some(FeatureFlag::ReviewPersonas),
            _ => None,
        }
    }
}

/// Flag oracle: `(flag, company) -> bool`. Absence means disabled.
pub trait FeatureFlags: Send + Sync {
    fn is_enabled(&self, flag: FeatureFlag, company_id: u64) -> bool;
}

/// In-memory flag set, enabled for every company. Used by the CLI and by
/// tests; the server evaluates flags from SQLite instead.
#[derive(Debug, Default, Clone)]
pub struct StaticFlags {
    enabled: HashSet<FeatureFlag>,
}

impl StaticFlags {
    pub fn new(flags: impl IntoIterator<Item = FeatureFlag>) -> Self {
        Self {
            enabled: flags.into_iter().collect(),
        }
    }

    /// Build from snake_case keys, ignoring unknown names with a warning.
    pub fn from_keys<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        let mut enabled = HashSet::new();
        for key in keys {
            match FeatureFlag::from_key(key.trim()) {
                Some(flag) => {
                    enabled.insert(flag);
                }
                None => tracing::warn!(key, "ignoring unknown feature flag"),
            }
        }
        Self { enabled }
    }
}

impl FeatureFlags for StaticFlags {
    fn is_enabled(&self, flag: FeatureFlag, _company_id: u64) -> bool {
        self.enabled.contains(&flag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_round_trip() {
        for flag in [
            FeatureFlag::AddOpenAiResults,
            FeatureFlag::AddGeminiResults,
            FeatureFlag::SeparateDuplicateDetection,
            FeatureFlag::ValidateReviews,
            FeatureFlag::ValidateReviewsSecondary,
            FeatureFlag::ValidateReviewsStrict,
            FeatureFlag::NoOpSuggestionValidation,
            FeatureFlag::ReviewPersonas,
        ] {
            assert_eq!(FeatureFlag::from_key(flag.key()), Some(flag));
        }
    }

    #[test]
    fn static_flags_default_to_disabled() {
        let flags = StaticFlags::default();
        assert!(!flags.is_enabled(FeatureFlag::AddOpenAiResults, 1));
    }

    #[test]
    fn from_keys_ignores_unknown_names() {
        let flags = StaticFlags::from_keys(["validate_reviews", "not_a_flag"]);
        assert!(flags.is_enabled(FeatureFlag::ValidateReviews, 1));
        assert!(!flags.is_enabled(FeatureFlag::AddGeminiResults, 1));
    }
}
