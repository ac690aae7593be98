//! Best-effort extraction of typed data from raw model output.
//!
//! Models wrap JSON in markdown fences, preamble text and trailing prose;
//! these helpers locate the payload before handing it to serde. A response
//! with no parseable payload voids that backend's contribution.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use thiserror::Error;

use crate::comment::ReviewComment;

#[derive(Debug, Error)]
pub enum SanitizeError {
    #[error("response contains no JSON payload")]
    NoPayload,
    #[error("failed to parse response JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

fn strip_fences(raw: &str) -> &str {
    // Bare JSON first: fences inside string values (committable suggestions)
    // must not be mistaken for wrapping.
    let trimmed = raw.trim();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        return trimmed;
    }
    if let Some(start) = raw.find("```json") {
        let content = &raw[start + "```json".len()..];
        if let Some(end) = content.find("```") {
            return content[..end].trim();
        }
    }
    if let Some(start) = raw.find("```") {
        let content = &raw[start + 3..];
        if let Some(end) = content.find("```") {
            // Skip a language tag on the fence line if present.
            let content = &content[..end];
            return content.trim_start_matches(|c: char| c.is_ascii_alphanumeric()).trim();
        }
    }
    raw
}

/// Locate the outermost JSON array in a raw response.
pub fn extract_json_array(raw: &str) -> Option<&str> {
    let cleaned = strip_fences(raw);
    let start = cleaned.find('[')?;
    let end = cleaned.rfind(']')?;
    (end >= start).then(|| &cleaned[start..=end])
}

/// Locate the outermost JSON object in a raw response.
pub fn extract_json_object(raw: &str) -> Option<&str> {
    let cleaned = strip_fences(raw);
    let start = cleaned.find('{')?;
    let end = cleaned.rfind('}')?;
    (end >= start).then(|| &cleaned[start..=end])
}

fn parse_array<T: DeserializeOwned>(raw: &str) -> Result<Vec<T>, SanitizeError> {
    if let Some(payload) = extract_json_array(raw) {
        return Ok(serde_json::from_str(payload)?);
    }
    // Some models answer with an object wrapping the array under "comments".
    if let Some(payload) = extract_json_object(raw) {
        let value: Value = serde_json::from_str(payload)?;
        if let Some(inner) = value.get("comments") {
            return Ok(serde_json::from_value(inner.clone())?);
        }
    }
    Err(SanitizeError::NoPayload)
}

/// Parse a model's review output into typed comments.
pub fn parse_comments(raw: &str) -> Result<Vec<ReviewComment>, SanitizeError> {
    parse_array(raw)
}

/// A value that models emit either as a JSON bool or as a string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringOrBool(String);

impl StringOrBool {
    pub fn is_truthy(&self) -> bool {
        matches!(
            self.0.trim().to_ascii_lowercase().as_str(),
            "true" | "yes"
        )
    }
}

impl From<&str> for StringOrBool {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl<'de> Deserialize<'de> for StringOrBool {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Bool(b) => Ok(Self(b.to_string())),
            Value::String(s) => Ok(Self(s)),
            other => Err(serde::de::Error::custom(format!(
                "expected bool or string, got {other}"
            ))),
        }
    }
}

/// One entry of a validation pass response.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationReply {
    pub id: String,
    pub valid: StringOrBool,
    #[serde(default)]
    pub explanation: String,
}

/// Parse a validator's output into per-comment verdicts.
pub fn parse_validation_replies(raw: &str) -> Result<Vec<ValidationReply>, SanitizeError> {
    parse_array(raw)
}
