//! Audit entries for the append-only decision trail.
//!
//! Every state transition of a decision request is recorded as an immutable
//! entry. Entries are the source of truth: the current state of any request
//! can be reconstructed by folding its entries in sequence order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single entry in a request's append-only audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// The request this entry belongs to
    pub request_id: Uuid,

    /// Monotonic, gap-free position within the request's trail (starts at 0)
    pub sequence: u64,

    /// Type of transition recorded
    pub event_type: AuditEventType,

    /// Structured event data (shape depends on event_type)
    pub payload: serde_json::Value,

    /// When this entry was recorded
    pub timestamp: DateTime<Utc>,
}

impl AuditEntry {
    /// Create an entry timestamped now
    pub fn new(
        request_id: Uuid,
        sequence: u64,
        event_type: AuditEventType,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            request_id,
            sequence,
            event_type,
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Types of transitions recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// The request was created
    Created,

    /// A tier's timeout clock started (written once, for tier 0)
    TierEntered,

    /// A tier's timeout expired without a response
    TierTimeout,

    /// A human signal was received (accepted or ignored)
    SignalReceived,

    /// The request escalated to the next tier
    Escalated,

    /// No tier responded; the automated generator was invoked
    FallbackInvoked,

    /// The request reached a resolution (human or fallback)
    Resolved,

    /// The fallback generator failed past its retry budget
    Failed,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::TierEntered => "tier_entered",
            Self::TierTimeout => "tier_timeout",
            Self::SignalReceived => "signal_received",
            Self::Escalated => "escalated",
            Self::FallbackInvoked => "fallback_invoked",
            Self::Resolved => "resolved",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}
