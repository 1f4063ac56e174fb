//! Decision state and reconstruction from audit entries.
//!
//! DecisionState is owned exclusively by one orchestrator task while the
//! request is live. Everyone else sees snapshots, or rebuilds the state by
//! folding the audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::audit::{AuditEntry, AuditEventType};
use super::request::{DecisionRequest, Tier, AI_FALLBACK};

/// Which escalation step currently owns the timeout clock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "at", content = "tier")]
pub enum TierCursor {
    /// Waiting on the approver of the given tier index
    Tier(usize),

    /// All tiers exhausted; waiting on the automated generator
    Fallback,
}

/// Lifecycle status of a decision request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionStatus {
    /// Waiting on tier 0
    Pending,

    /// Escalated past tier 0 (or into fallback), still unresolved
    Escalating,

    /// A human (or cancellation) resolved the request
    ResolvedHuman,

    /// The automated generator resolved the request
    ResolvedFallback,

    /// The generator failed past its retry budget; manual intervention needed
    Failed,
}

impl DecisionStatus {
    /// True once no further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ResolvedHuman | Self::ResolvedFallback | Self::Failed
        )
    }
}

/// The outcome of a resolved request. Immutable once set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    /// Approver identity, or "AI-FALLBACK"
    pub resolved_by: String,

    /// The verdict
    pub approved: bool,

    /// Justification from the resolver
    pub rationale: String,

    /// Generator confidence (fallback resolutions only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,

    /// When the resolution was recorded
    pub resolved_at: DateTime<Utc>,
}

impl Resolution {
    /// True when the automated generator produced this resolution
    pub fn is_fallback(&self) -> bool {
        self.resolved_by == AI_FALLBACK
    }
}

/// Mutable per-request state, derived from (and checkpointed as) audit entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionState {
    /// The request this state belongs to
    pub request_id: Uuid,

    /// Opaque subject content (carried for fallback invocation)
    pub subject: String,

    /// Ordered escalation tiers from the original request
    pub tiers: Vec<Tier>,

    /// Current escalation position
    pub cursor: TierCursor,

    /// Lifecycle status
    pub status: DecisionStatus,

    /// Terminal outcome; None while unresolved
    pub resolution: Option<Resolution>,

    /// When the current tier's timeout clock started
    pub tier_entered_at: DateTime<Utc>,

    /// When the request was created
    pub created_at: DateTime<Utc>,

    /// Next audit sequence number to assign (orchestrator is sole writer)
    pub next_sequence: u64,
}

impl DecisionState {
    /// Fresh state for a new request
    pub fn new(request: &DecisionRequest) -> Self {
        Self {
            request_id: request.id,
            subject: request.subject.clone(),
            tiers: request.tiers.clone(),
            cursor: TierCursor::Tier(0),
            status: DecisionStatus::Pending,
            resolution: None,
            tier_entered_at: request.created_at,
            created_at: request.created_at,
            next_sequence: 0,
        }
    }

    /// Reconstruct state by folding an ordered audit trail
    pub fn from_entries(entries: &[AuditEntry]) -> Option<Self> {
        let first = entries.first()?;

        if first.event_type != AuditEventType::Created {
            return None;
        }

        let request: DecisionRequest = serde_json::from_value(first.payload.clone()).ok()?;
        let mut state = Self::new(&request);

        for entry in entries {
            state.apply_entry(entry);
        }

        Some(state)
    }

    /// Apply a single audit entry to this state
    pub fn apply_entry(&mut self, entry: &AuditEntry) {
        match entry.event_type {
            AuditEventType::Created => {
                self.status = DecisionStatus::Pending;
                self.created_at = entry.timestamp;
                self.tier_entered_at = entry.timestamp;
            }
            AuditEventType::TierEntered => {
                if let Some(tier) = entry.payload["tier"].as_u64() {
                    self.cursor = TierCursor::Tier(tier as usize);
                }
                self.tier_entered_at = entry.timestamp;
            }
            AuditEventType::Escalated => {
                if let Some(tier) = entry.payload["tier"].as_u64() {
                    self.cursor = TierCursor::Tier(tier as usize);
                }
                self.tier_entered_at = entry.timestamp;
                self.status = DecisionStatus::Escalating;
            }
            AuditEventType::FallbackInvoked => {
                self.cursor = TierCursor::Fallback;
                self.status = DecisionStatus::Escalating;
            }
            AuditEventType::Resolved => {
                if let Ok(resolution) =
                    serde_json::from_value::<Resolution>(entry.payload.clone())
                {
                    self.status = if resolution.is_fallback() {
                        DecisionStatus::ResolvedFallback
                    } else {
                        DecisionStatus::ResolvedHuman
                    };
                    self.resolution = Some(resolution);
                }
            }
            AuditEventType::Failed => {
                self.status = DecisionStatus::Failed;
            }
            // Timeouts and signal receipts carry no state beyond what the
            // follow-up Escalated/FallbackInvoked/Resolved entry records.
            AuditEventType::TierTimeout | AuditEventType::SignalReceived => {}
        }

        self.next_sequence = entry.sequence + 1;
    }

    /// True once no further transition is possible
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// The tier definition under the cursor, if not in fallback
    pub fn current_tier(&self) -> Option<&Tier> {
        match self.cursor {
            TierCursor::Tier(i) => self.tiers.get(i),
            TierCursor::Fallback => None,
        }
    }

    /// Hard deadline for the current tier, if not in fallback
    pub fn current_deadline(&self) -> Option<DateTime<Utc>> {
        let tier = self.current_tier()?;
        Some(self.tier_entered_at + chrono::Duration::milliseconds(tier.timeout_ms as i64))
    }
}
