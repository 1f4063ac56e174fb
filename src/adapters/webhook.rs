//! Webhook notifier.
//!
//! Posts notification payloads to a configured HTTP endpoint. The receiving
//! side (chat bridge, pager, mail relay) is whatever the deployment wires up.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Notifier;

/// Configuration for the webhook notifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Endpoint receiving notification POSTs
    pub url: String,

    /// Optional bearer token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// HTTP notifier posting JSON payloads to a webhook endpoint
pub struct WebhookNotifier {
    config: WebhookConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct WebhookResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

impl WebhookNotifier {
    /// Create a notifier from config
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, approver: &str, summary: &str) -> Result<()> {
        let mut request = self.client.post(&self.config.url).json(&serde_json::json!({
            "approver": approver,
            "summary": summary,
        }));

        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .context("Failed to send notification webhook")?
            .error_for_status()
            .context("Notification webhook rejected the request")?;

        let body: WebhookResponse = response
            .json()
            .await
            .context("Failed to parse webhook response")?;

        if !body.ok {
            anyhow::bail!(
                "Webhook error: {}",
                body.error.unwrap_or_else(|| "unknown".to_string())
            );
        }

        Ok(())
    }
}
