//! Core escalation logic.
//!
//! This module contains:
//! - AuditLog: append-only, per-request JSONL persistence
//! - Policy: the pure tier escalation state machine
//! - Orchestrator: the single-writer driver loop per request
//! - Supervisor: ownership table and crash recovery

pub mod audit_log;
pub mod orchestrator;
pub mod policy;
pub mod supervisor;

use thiserror::Error;
use uuid::Uuid;

use crate::router::RouterError;

// Re-export commonly used types
pub use audit_log::{AuditLog, AuditLogError};
pub use orchestrator::{audit_idempotency_key, InboxEvent, Orchestrator, OrchestratorHandle};
pub use policy::{Effect, PolicyEvent};
pub use supervisor::Supervisor;

/// Errors surfaced to external callers of the engine.
///
/// Internal races (sequence conflicts, duplicate signal deliveries) are
/// resolved locally and never appear here.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Caller attempted to re-create an active or already-recorded request
    #[error("decision request {0} already exists")]
    DuplicateRequest(Uuid),

    /// No trace of this request id, live or on disk
    #[error("unknown decision request {0}")]
    UnknownRequest(Uuid),

    /// Trail exists and is non-terminal, but no orchestrator owns it;
    /// recovery has not run since the last restart
    #[error("decision request {0} has no live orchestrator; run recovery")]
    RequestInactive(Uuid),

    /// Retryable resource exhaustion or terminal routing failure
    #[error(transparent)]
    Router(#[from] RouterError),

    /// Audit log I/O failure
    #[error("audit log error: {0}")]
    Audit(#[from] AuditLogError),
}
