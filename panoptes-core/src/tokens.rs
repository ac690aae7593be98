//! Token estimation and budget arithmetic.
//!
//! The estimator is a deliberately cheap heuristic (roughly four characters
//! per token for code-heavy English text); providers count with their own
//! tokenizers, which is why the retry protocol in the caller exists at all.

/// Hard ceiling on the prompt size we send to any backend, in model tokens.
pub const MAX_ALLOWED_TOKENS: usize = 200_000;

/// Safety margin, in percent, subtracted when deriving an adjusted ceiling
/// from a provider-reported actual token count.
pub const TOKEN_SAFETY_MARGIN_PERCENT: f64 = 3.0;

/// Estimate the token count of a piece of text.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Outbound token accounting for one backend call.
#[derive(Debug, Clone, Copy)]
pub struct TokenBudget {
    /// Our estimate of the prompt we sent.
    pub estimated: usize,
    /// Ceiling the prompt was pruned to before the call.
    pub ceiling: usize,
    /// Ceiling derived from a provider-reported actual count; only set on
    /// the retry path.
    pub adjusted: Option<usize>,
}

impl TokenBudget {
    pub fn new(estimated: usize, ceiling: usize) -> Self {
        Self {
            estimated,
            ceiling,
            adjusted: None,
        }
    }

    pub fn with_adjusted(self, adjusted: usize) -> Self {
        Self {
            adjusted: Some(adjusted),
            ..self
        }
    }
}

/// Derive a reduced ceiling after the provider counted more tokens than we
/// estimated. The provider counted `actual` for a prompt we estimated at
/// `estimated`, so the ceiling is scaled by that ratio and then shrunk by
/// `safety_percent` to absorb further estimator drift.
pub fn adjusted_token_ceiling(
    ceiling: usize,
    estimated: usize,
    actual: usize,
    safety_percent: f64,
) -> usize {
    if actual == 0 || estimated == 0 {
        return ceiling;
    }
    let ratio = estimated as f64 / actual as f64;
    let scaled = ceiling as f64 * ratio * (1.0 - safety_percent / 100.0);
    (scaled as usize).min(ceiling.saturating_sub(1)).max(1)
}

/// Best-effort extraction of a provider-reported token count from an error
/// message. Providers phrase the failure as e.g. `prompt is too long: 214637
/// tokens > 200000 maximum`; the count we want is the number immediately
/// preceding the word `tokens`.
pub fn extract_actual_token_count(error_text: &str) -> Option<usize> {
    let mut last_number: Option<usize> = None;
    for word in error_text.split(|c: char| !c.is_ascii_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        if let Ok(n) = word.parse::<usize>() {
            last_number = Some(n);
        } else if word.eq_ignore_ascii_case("tokens") {
            if let Some(n) = last_number {
                return Some(n);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimates_scale_with_length() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }

    #[test]
    fn extracts_count_from_provider_error() {
        let err = "API error 400: prompt is too long: 214637 tokens > 200000 maximum";
        assert_eq!(extract_actual_token_count(err), Some(214_637));
    }

    #[test]
    fn extraction_fails_without_token_phrase() {
        assert_eq!(extract_actual_token_count("connection reset by peer"), None);
        assert_eq!(extract_actual_token_count("tokens missing a count"), None);
    }

    #[test]
    fn adjusted_ceiling_shrinks_when_provider_counts_higher() {
        // Provider counted 20% above our estimate.
        let adjusted = adjusted_token_ceiling(200_000, 100_000, 120_000, 3.0);
        assert!(adjusted < 200_000);
        // Scaled by 100/120 and a 3% margin: ~161k.
        assert!(adjusted > 150_000 && adjusted < 170_000);
    }

    #[test]
    fn adjusted_ceiling_never_exceeds_original() {
        // Degenerate input where the provider somehow counted fewer tokens.
        let adjusted = adjusted_token_ceiling(200_000, 120_000, 100_000, 3.0);
        assert!(adjusted < 200_000);
    }

    #[test]
    fn adjusted_ceiling_guards_zero_counts() {
        assert_eq!(adjusted_token_ceiling(200_000, 0, 120_000, 3.0), 200_000);
        assert_eq!(adjusted_token_ceiling(200_000, 100_000, 0, 3.0), 200_000);
    }
}
