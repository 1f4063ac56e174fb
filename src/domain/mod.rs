//! Domain types for the verdict engine.
//!
//! This module contains the core data structures:
//! - Request: immutable decision requests and escalation tiers
//! - Audit: immutable records of state transitions
//! - State: per-request lifecycle state, folded from audit entries

pub mod audit;
pub mod request;
pub mod state;

// Re-export commonly used types
pub use audit::{AuditEntry, AuditEventType};
pub use request::{DecisionRequest, Signal, Tier, AI_FALLBACK, SYSTEM_CANCEL};
pub use state::{DecisionState, DecisionStatus, Resolution, TierCursor};
