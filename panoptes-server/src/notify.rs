//! Fire-and-forget operational notifications (token mismatches, retry
//! outcomes, approval events). Delivery failures are logged, never
//! propagated: a broken webhook must not break a review.

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::warn;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Posts messages to a Slack incoming webhook.
pub struct SlackNotifier {
    client: Client,
    webhook_url: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: String) -> Self {
        Self {
            client: Client::new(),
            webhook_url,
        }
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, message: &str) {
        let result = self
            .client
            .post(&self.webhook_url)
            .json(&json!({ "text": message }))
            .send()
            .await;
        match result {
            Ok(response) if !response.status().is_success() => {
                warn!(status = %response.status(), "Slack notification rejected");
            }
            Err(e) => warn!(error = %e, "failed to deliver Slack notification"),
            Ok(_) => {}
        }
    }
}

/// Discards notifications. Used when no webhook is configured.
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn notify(&self, _message: &str) {}
}
