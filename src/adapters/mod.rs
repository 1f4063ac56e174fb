//! Collaborator interfaces consumed by the engine.
//!
//! The engine treats notification delivery and automated decision generation
//! as external systems behind traits, so worker lanes can retry them and
//! tests can substitute recorders.

pub mod generator;
pub mod webhook;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use generator::HttpDecisionGenerator;
pub use webhook::WebhookNotifier;

/// A decision produced by the automated generator when no human responds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FallbackDecision {
    /// The verdict
    pub approved: bool,

    /// Generator's justification
    pub rationale: String,

    /// Generator's confidence in [0, 1]
    pub confidence: f64,
}

/// Delivers a response request to an approver
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Ask the approver to respond to the request described by `summary`
    async fn notify(&self, approver: &str, summary: &str) -> Result<()>;
}

/// Produces an automated decision for a subject
#[async_trait]
pub trait DecisionGenerator: Send + Sync {
    /// Decide on the subject content; may fail and be retried by the router
    async fn decide(&self, subject: &str) -> Result<FallbackDecision>;
}
