//! Orchestrator supervisor: ownership table and crash recovery.
//!
//! The supervisor enforces at-most-one live orchestrator per request id,
//! wires the worker lanes to the real collaborators, and rehydrates state
//! from the audit log after a restart (state = fold of the trail).

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{DecisionGenerator, Notifier};
use crate::domain::{
    AuditEntry, AuditEventType, DecisionRequest, DecisionState, Signal, SYSTEM_CANCEL,
};
use crate::router::{RouterConfig, TaskRouter, WorkExecutor, WorkOutcome, WorkPayload};

use super::audit_log::{AuditLog, AuditLogError};
use super::orchestrator::{InboxEvent, Orchestrator, OrchestratorHandle};
use super::EngineError;

struct ActiveEntry {
    handle: OrchestratorHandle,
    task: JoinHandle<()>,
}

/// Manages the population of live decision orchestrators
pub struct Supervisor {
    router: Arc<TaskRouter>,
    audit: Arc<AuditLog>,
    active: Arc<Mutex<HashMap<Uuid, ActiveEntry>>>,
}

impl Supervisor {
    /// Build a supervisor wiring the router lanes to the given collaborators
    pub fn new(
        audit: Arc<AuditLog>,
        notifier: Arc<dyn Notifier>,
        generator: Arc<dyn DecisionGenerator>,
        router_config: RouterConfig,
    ) -> Self {
        let executor = Arc::new(EngineExecutor {
            notifier,
            generator,
            audit: audit.clone(),
        });
        let router = Arc::new(TaskRouter::new(router_config, executor));

        Self {
            router,
            audit,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Create a decision and spawn its orchestrator.
    ///
    /// Fails with DuplicateRequest if an orchestrator for this id is live or
    /// a trail for it already exists on disk.
    #[instrument(skip(self, request), fields(request_id = %request.id))]
    pub async fn create(&self, request: DecisionRequest) -> Result<Uuid, EngineError> {
        let id = request.id;
        let mut active = self.active.lock().await;

        if let Some(entry) = active.get(&id) {
            if !entry.task.is_finished() {
                return Err(EngineError::DuplicateRequest(id));
            }
        }

        if self.audit.exists(id).await {
            return Err(EngineError::DuplicateRequest(id));
        }

        info!(tiers = request.tiers.len(), "creating decision request");

        let (orchestrator, handle) = Orchestrator::create(&request, self.router.clone());
        let task = self.spawn_driver(id, orchestrator);
        active.insert(id, ActiveEntry { handle, task });

        Ok(id)
    }

    /// Deliver a human response to the owning orchestrator.
    ///
    /// Safe to call more than once for the same logical signal; the
    /// orchestrator deduplicates. A response to an already-retired request is
    /// appended to the trail as an ignored signal so the attempt stays on the
    /// record.
    pub async fn respond(
        &self,
        request_id: Uuid,
        approver: impl Into<String>,
        approved: bool,
        rationale: impl Into<String>,
    ) -> Result<(), EngineError> {
        let signal = Signal::new(approver, approved, rationale);

        let handle = {
            let active = self.active.lock().await;
            active.get(&request_id).map(|entry| entry.handle.clone())
        };

        if let Some(handle) = handle {
            if handle.deliver(InboxEvent::Signal(signal.clone())).await {
                return Ok(());
            }
            // Inbox closed under us: the orchestrator retired between the
            // lookup and the send. Fall through to the trail path.
        }

        let state = self
            .fold_state(request_id)
            .await?
            .ok_or(EngineError::UnknownRequest(request_id))?;

        if !state.is_terminal() {
            return Err(EngineError::RequestInactive(request_id));
        }

        self.append_late_signal(&state, &signal).await?;
        Ok(())
    }

    /// Cancel a pending request (reserved SYSTEM-CANCEL identity)
    pub async fn cancel(&self, request_id: Uuid) -> Result<(), EngineError> {
        self.respond(request_id, SYSTEM_CANCEL, false, "cancelled by operator")
            .await
    }

    /// Current state snapshot; never blocks on pending work
    pub async fn status(&self, request_id: Uuid) -> Result<DecisionState, EngineError> {
        {
            let active = self.active.lock().await;
            if let Some(entry) = active.get(&request_id) {
                return Ok(entry.handle.snapshot());
            }
        }

        self.fold_state(request_id)
            .await?
            .ok_or(EngineError::UnknownRequest(request_id))
    }

    /// Ordered audit trail, optionally resuming from a sequence number
    pub async fn audit_trail(
        &self,
        request_id: Uuid,
        from_sequence: u64,
    ) -> Result<Vec<AuditEntry>, EngineError> {
        if !self.audit.exists(request_id).await {
            return Err(EngineError::UnknownRequest(request_id));
        }
        Ok(self.audit.read_from(request_id, from_sequence).await?)
    }

    /// Rehydrate every non-terminal request from the audit log and re-enter
    /// its driver loop. The remaining tier timeout falls out of the fold:
    /// the driver recomputes it from the persisted `tier_entered_at`, firing
    /// immediately if the deadline already passed.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let mut recovered = 0;
        let mut active = self.active.lock().await;

        for request_id in self.audit.list_requests().await? {
            if let Some(entry) = active.get(&request_id) {
                if !entry.task.is_finished() {
                    continue;
                }
            }

            let entries = self.audit.read(request_id).await?;
            let Some(state) = DecisionState::from_entries(&entries) else {
                warn!(%request_id, "skipping unreadable trail during recovery");
                continue;
            };

            if state.is_terminal() {
                continue;
            }

            info!(%request_id, status = ?state.status, "recovering decision request");

            let (orchestrator, handle) = Orchestrator::resume(state, self.router.clone());
            let task = self.spawn_driver(request_id, orchestrator);
            active.insert(request_id, ActiveEntry { handle, task });
            recovered += 1;
        }

        Ok(recovered)
    }

    /// Number of live orchestrators
    pub async fn active_count(&self) -> usize {
        let active = self.active.lock().await;
        active
            .values()
            .filter(|entry| !entry.task.is_finished())
            .count()
    }

    /// Abort every live orchestrator (simulates a process crash in tests;
    /// the audit trail is the only state that survives)
    pub async fn shutdown(&self) {
        let mut active = self.active.lock().await;
        for (request_id, entry) in active.drain() {
            debug!(%request_id, "aborting orchestrator");
            entry.task.abort();
        }
    }

    fn spawn_driver(&self, request_id: Uuid, orchestrator: Orchestrator) -> JoinHandle<()> {
        let active = self.active.clone();

        tokio::spawn(async move {
            if let Err(e) = orchestrator.run().await {
                error!(%request_id, error = %e, "orchestrator driver failed");
            }
            active.lock().await.remove(&request_id);
        })
    }

    async fn fold_state(&self, request_id: Uuid) -> Result<Option<DecisionState>, EngineError> {
        let entries = self.audit.read(request_id).await?;
        Ok(DecisionState::from_entries(&entries))
    }

    /// Append an ignored SIGNAL_RECEIVED entry for a response that arrived
    /// after the orchestrator retired. Sequence conflicts (two late signals
    /// racing) are retried with the next sequence number.
    async fn append_late_signal(
        &self,
        state: &DecisionState,
        signal: &Signal,
    ) -> Result<(), EngineError> {
        let mut sequence = state.next_sequence;

        loop {
            let entry = AuditEntry::new(
                state.request_id,
                sequence,
                AuditEventType::SignalReceived,
                serde_json::json!({
                    "approver": signal.approver,
                    "approved": signal.approved,
                    "rationale": signal.rationale,
                    "sent_at": signal.sent_at,
                    "accepted": false,
                    "note": "ignored: already resolved",
                }),
            );

            match self.audit.append(&entry).await {
                Ok(()) => return Ok(()),
                Err(AuditLogError::SequenceConflict { current_max, .. }) => {
                    sequence = current_max + 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Performs work item side effects against the real collaborators
struct EngineExecutor {
    notifier: Arc<dyn Notifier>,
    generator: Arc<dyn DecisionGenerator>,
    audit: Arc<AuditLog>,
}

#[async_trait]
impl WorkExecutor for EngineExecutor {
    async fn execute(&self, payload: &WorkPayload) -> Result<WorkOutcome> {
        match payload {
            WorkPayload::Notify { approver, summary } => {
                self.notifier.notify(approver, summary).await?;
                Ok(WorkOutcome::Completed)
            }

            WorkPayload::Fallback { subject, .. } => {
                let decision = self.generator.decide(subject).await?;
                Ok(WorkOutcome::Fallback(decision))
            }

            WorkPayload::AuditWrite { entry } => match self.audit.append(entry).await {
                Ok(()) => Ok(WorkOutcome::Completed),
                // The orchestrator is the sole sequence assigner, so a
                // conflict here can only mean the substrate redelivered an
                // entry that is already on disk.
                Err(AuditLogError::SequenceConflict { .. }) => {
                    debug!(
                        request_id = %entry.request_id,
                        sequence = entry.sequence,
                        "duplicate audit delivery already persisted"
                    );
                    Ok(WorkOutcome::Completed)
                }
                Err(e) => Err(e.into()),
            },
        }
    }
}
