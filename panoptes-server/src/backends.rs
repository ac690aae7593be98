//! Model backend callers: one HTTP client per AI provider, all exposing the
//! same `(system, user) -> raw text` surface. Per-request timeouts live
//! here; the dispatch layer above imposes none of its own.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::info;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// One external AI provider able to generate or validate review comments.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Stable provider label stamped onto comments ("anthropic", "openai",
    /// "google").
    fn provider(&self) -> &str;

    /// Identifier of the model this backend currently calls.
    fn model(&self) -> &str;

    /// Send a system/user message pair, returning the raw response text.
    async fn call(&self, system: &str, user: &str) -> Result<String>;

    /// Same call pinned to a specific model variant. Backends that cannot
    /// switch models fall back to the default model.
    async fn call_with_model(&self, system: &str, user: &str, _model: &str) -> Result<String> {
        self.call(system, user).await
    }
}

fn shared_client() -> Client {
    Client::builder()
        .user_agent(concat!("panoptes/", env!("CARGO_PKG_VERSION")))
        .build()
        .expect("failed to create HTTP client")
}

/// Anthropic Messages API caller. The primary review backend.
pub struct AnthropicBackend {
    client: Client,
    api_key: String,
    model: String,
}

impl AnthropicBackend {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: shared_client(),
            api_key,
            model,
        }
    }

    async fn call_model(&self, system: &str, user: &str, model: &str) -> Result<String> {
        let payload = json!({
            "model": model,
            "max_tokens": 8192,
            "system": system,
            "messages": [{ "role": "user", "content": user }],
        });

        let response = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("failed to send Anthropic request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Anthropic API error {status}: {error_text}"));
        }

        let body: Value = response
            .json()
            .await
            .context("failed to parse Anthropic response")?;
        let text = body["content"][0]["text"]
            .as_str()
            .ok_or_else(|| anyhow!("Anthropic response missing content text"))?;

        info!(model, response_chars = text.len(), "Anthropic call complete");
        Ok(text.to_string())
    }
}

#[async_trait]
impl ModelBackend for AnthropicBackend {
    fn provider(&self) -> &str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, system: &str, user: &str) -> Result<String> {
        self.call_model(system, user, &self.model).await
    }

    async fn call_with_model(&self, system: &str, user: &str, model: &str) -> Result<String> {
        self.call_model(system, user, model).await
    }
}

/// OpenAI chat completions caller.
pub struct OpenAiBackend {
    client: Client,
    api_key: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: shared_client(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn provider(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, system: &str, user: &str) -> Result<String> {
        let payload = json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });

        let response = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("failed to send OpenAI request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("OpenAI API error {status}: {error_text}"));
        }

        let body: Value = response
            .json()
            .await
            .context("failed to parse OpenAI response")?;
        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("OpenAI response missing message content"))?;

        info!(
            model = self.model,
            response_chars = text.len(),
            "OpenAI call complete"
        );
        Ok(text.to_string())
    }
}

/// Google Gemini caller.
pub struct GeminiBackend {
    client: Client,
    api_key: String,
    model: String,
}

impl GeminiBackend {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: shared_client(),
            api_key,
            model,
        }
    }
}

#[async_trait]
impl ModelBackend for GeminiBackend {
    fn provider(&self) -> &str {
        "google"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn call(&self, system: &str, user: &str) -> Result<String> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent?key={}",
            self.model, self.api_key
        );
        let payload = json!({
            "systemInstruction": { "parts": [{ "text": system }] },
            "contents": [{ "parts": [{ "text": user }] }],
            "generationConfig": { "temperature": 0.2 },
        });

        let response = self
            .client
            .post(&url)
            .json(&payload)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .context("failed to send Gemini request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("Gemini API error {status}: {error_text}"));
        }

        let body: Value = response
            .json()
            .await
            .context("failed to parse Gemini response")?;
        let text = body["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .ok_or_else(|| anyhow!("Gemini response missing candidate text"))?;

        info!(
            model = self.model,
            response_chars = text.len(),
            "Gemini call complete"
        );
        Ok(text.to_string())
    }
}
