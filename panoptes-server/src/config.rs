use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

#[derive(Clone)]
pub struct Config {
    pub github_token: String,
    pub anthropic_api_key: String,
    /// Secondary backends are only constructed when their key is present;
    /// dispatch to them is additionally feature-flag gated.
    pub openai_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub anthropic_model: String,
    pub openai_model: String,
    pub gemini_model: String,
    /// Model variant the strict validation pass pins the primary provider to.
    pub strict_validation_model: String,
    pub slack_webhook_url: Option<String>,
    pub company_id: u64,
    pub bot_login: String,
    pub automatic_approval: bool,
    pub committable_suggestions: bool,
    pub active_personas: Vec<String>,
    pub max_posted_comments: usize,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Optional bearer token for the review trigger endpoint.
    /// If not set, the endpoint is disabled (returns 403 Forbidden).
    pub review_auth_token: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_token =
            env::var("GITHUB_TOKEN").context("GITHUB_TOKEN environment variable is required")?;

        let anthropic_api_key = env::var("ANTHROPIC_API_KEY")
            .context("ANTHROPIC_API_KEY environment variable is required")?;

        let openai_api_key = env::var("OPENAI_API_KEY").ok().filter(|s| !s.is_empty());
        let gemini_api_key = env::var("GEMINI_API_KEY").ok().filter(|s| !s.is_empty());

        let anthropic_model = env::var("ANTHROPIC_MODEL")
            .unwrap_or_else(|_| "claude-sonnet-4-20250514".to_string());
        let openai_model = env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4.1".to_string());
        let gemini_model =
            env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.5-flash".to_string());
        let strict_validation_model = env::var("STRICT_VALIDATION_MODEL")
            .unwrap_or_else(|_| "claude-opus-4-20250514".to_string());

        let slack_webhook_url = env::var("SLACK_WEBHOOK_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        let company_id = env::var("COMPANY_ID")
            .unwrap_or_else(|_| "1".to_string())
            .parse::<u64>()
            .context("COMPANY_ID must be a valid number")?;

        let bot_login = env::var("BOT_LOGIN").unwrap_or_else(|_| "panoptes[bot]".to_string());

        let automatic_approval = env::var("AUTOMATIC_APPROVAL")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let committable_suggestions = env::var("COMMITTABLE_SUGGESTIONS")
            .unwrap_or_else(|_| "true".to_string())
            .parse::<bool>()
            .unwrap_or(true);

        let active_personas = parse_personas(env::var("ACTIVE_PERSONAS").ok());

        let max_posted_comments = env::var("MAX_POSTED_COMMENTS")
            .unwrap_or_else(|_| "10".to_string())
            .parse::<usize>()
            .context("MAX_POSTED_COMMENTS must be a valid number")?;

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let review_auth_token = parse_auth_token(env::var("REVIEW_AUTH_TOKEN").ok());

        Ok(Config {
            github_token,
            anthropic_api_key,
            openai_api_key,
            gemini_api_key,
            anthropic_model,
            openai_model,
            gemini_model,
            strict_validation_model,
            slack_webhook_url,
            company_id,
            bot_login,
            automatic_approval,
            committable_suggestions,
            active_personas,
            max_posted_comments,
            port,
            state_dir,
            review_auth_token,
        })
    }
}

/// Parse a comma-separated persona list, dropping empty entries.
pub fn parse_personas(value: Option<String>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse REVIEW_AUTH_TOKEN from an optional string value.
///
/// Returns None if the value is missing, empty, or contains only
/// whitespace, so an empty token can never allow unauthenticated access.
pub fn parse_auth_token(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn personas_parse_and_trim() {
        assert_eq!(
            parse_personas(Some("security auditor, performance engineer".to_string())),
            vec![
                "security auditor".to_string(),
                "performance engineer".to_string()
            ]
        );
    }

    #[test]
    fn personas_drop_empty_entries() {
        assert_eq!(parse_personas(Some(" , ,".to_string())), Vec::<String>::new());
        assert_eq!(parse_personas(None), Vec::<String>::new());
    }

    #[test]
    fn auth_token_empty_is_unset() {
        assert_eq!(parse_auth_token(None), None);
        assert_eq!(parse_auth_token(Some("".to_string())), None);
        assert_eq!(parse_auth_token(Some("   ".to_string())), None);
    }

    #[test]
    fn auth_token_valid_is_preserved() {
        assert_eq!(
            parse_auth_token(Some("secret-token".to_string())),
            Some("secret-token".to_string())
        );
    }
}
