//! HTTP client for the automated decision generator.
//!
//! The generator is an external service: it receives the subject content and
//! answers with a verdict, a rationale, and a confidence score. How it
//! computes the answer is its own business; the engine only invokes it as a
//! fallback when every tier's timeout has expired.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{DecisionGenerator, FallbackDecision};

/// Configuration for the generator client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Endpoint of the decision service
    pub url: String,

    /// Per-call timeout in seconds
    #[serde(default = "default_call_timeout")]
    pub timeout_secs: u64,
}

fn default_call_timeout() -> u64 {
    60
}

/// HTTP-backed decision generator
pub struct HttpDecisionGenerator {
    config: GeneratorConfig,
    client: reqwest::Client,
}

impl HttpDecisionGenerator {
    /// Create a generator client from config
    pub fn new(config: GeneratorConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl DecisionGenerator for HttpDecisionGenerator {
    async fn decide(&self, subject: &str) -> Result<FallbackDecision> {
        let response = self
            .client
            .post(&self.config.url)
            .timeout(std::time::Duration::from_secs(self.config.timeout_secs))
            .json(&serde_json::json!({ "subject": subject }))
            .send()
            .await
            .context("Failed to call decision generator")?
            .error_for_status()
            .context("Decision generator rejected the request")?;

        let decision: FallbackDecision = response
            .json()
            .await
            .context("Failed to parse generator response")?;

        if !(0.0..=1.0).contains(&decision.confidence) {
            anyhow::bail!(
                "Generator returned confidence {} outside [0, 1]",
                decision.confidence
            );
        }

        Ok(decision)
    }
}
