//! verdict - Event-sourced human/AI decision escalation engine
//!
//! A decision request carries an ordered list of approver tiers. Each tier
//! gets a bounded window to respond; on timeout the request escalates to the
//! next tier, and when every tier stays silent an automated decision
//! generator produces the fallback resolution.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - Every state transition is recorded as an immutable audit entry
//! - Current state is derived by folding a request's trail
//! - After a crash, non-terminal requests are rehydrated from the trail and
//!   resume with their remaining timeout
//!
//! Side effects (notifications, fallback generation, audit writes) never run
//! inline: the orchestrator emits work items tagged with a resource class,
//! and the task router dispatches them to isolated, bounded worker lanes.
//!
//! # Modules
//!
//! - `domain`: Data structures (DecisionRequest, AuditEntry, DecisionState)
//! - `core`: Escalation logic (AuditLog, Policy, Orchestrator, Supervisor)
//! - `router`: Resource-class work item routing
//! - `adapters`: External system integrations (notifier, decision generator)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Drive a decision with two escalation tiers
//! verdict run --subject "deploy build 1142" --tier alice:30s --tier oncall:5m
//!
//! # Inspect a decision
//! verdict status <request-id>
//! verdict audit <request-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod router;

// Re-export main types at crate root for convenience
pub use self::core::{AuditLog, EngineError, Supervisor};
pub use domain::{
    AuditEntry, AuditEventType, DecisionRequest, DecisionState, DecisionStatus, Resolution,
    Signal, Tier, TierCursor, AI_FALLBACK, SYSTEM_CANCEL,
};
pub use router::{ResourceClass, RetryPolicy, RouterConfig, RouterError, TaskRouter, WorkItem};

// Collaborator interfaces
pub use adapters::{DecisionGenerator, FallbackDecision, Notifier};
