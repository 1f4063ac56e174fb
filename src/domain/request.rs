//! Decision requests and escalation tiers.
//!
//! A DecisionRequest is the immutable input to the engine: an opaque
//! subject plus an ordered list of approver tiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Reserved approver identity used to model external cancellation.
///
/// A signal from this identity resolves the request as a human rejection
/// and short-circuits any pending tier timer.
pub const SYSTEM_CANCEL: &str = "SYSTEM-CANCEL";

/// Approver identity recorded when the automated generator resolves a request.
pub const AI_FALLBACK: &str = "AI-FALLBACK";

/// One escalation step: an approver and how long they get to respond.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tier {
    /// Who is asked at this step
    pub approver: String,

    /// Response window in milliseconds, measured from tier entry
    pub timeout_ms: u64,
}

impl Tier {
    /// Create a tier from an approver identity and timeout
    pub fn new(approver: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self {
            approver: approver.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// The tier's response window as a Duration
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }
}

/// Immutable input to the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRequest {
    /// Unique identifier for this request
    pub id: Uuid,

    /// Opaque subject content the decision is about
    pub subject: String,

    /// Ordered escalation tiers; tier 0 is the first addressee
    pub tiers: Vec<Tier>,

    /// When the request was created
    pub created_at: DateTime<Utc>,
}

impl DecisionRequest {
    /// Create a new request with a fresh id
    pub fn new(subject: impl Into<String>, tiers: Vec<Tier>) -> Self {
        Self {
            id: Uuid::new_v4(),
            subject: subject.into(),
            tiers,
            created_at: Utc::now(),
        }
    }

    /// Create a request with a caller-supplied id
    pub fn with_id(id: Uuid, subject: impl Into<String>, tiers: Vec<Tier>) -> Self {
        Self {
            id,
            subject: subject.into(),
            tiers,
            created_at: Utc::now(),
        }
    }

    /// Index of the last tier
    pub fn last_tier_index(&self) -> usize {
        self.tiers.len().saturating_sub(1)
    }
}

/// A human response to a pending decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Who responded
    pub approver: String,

    /// The verdict
    pub approved: bool,

    /// Free-form justification
    pub rationale: String,

    /// When the responder sent this (part of the dedup key)
    pub sent_at: DateTime<Utc>,
}

impl Signal {
    /// Create a signal timestamped now
    pub fn new(approver: impl Into<String>, approved: bool, rationale: impl Into<String>) -> Self {
        Self {
            approver: approver.into(),
            approved,
            rationale: rationale.into(),
            sent_at: Utc::now(),
        }
    }

    /// True for the reserved cancellation identity
    pub fn is_cancellation(&self) -> bool {
        self.approver == SYSTEM_CANCEL
    }
}
