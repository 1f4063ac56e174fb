//! Command-line interface for the verdict engine.
//!
//! `status`, `audit` and `list` operate directly on the on-disk audit trails
//! (state is a fold of the trail, no engine needed). `run` drives a full
//! decision lifecycle in-process using the configured adapters.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing::info;
use uuid::Uuid;

use crate::adapters::{
    DecisionGenerator, FallbackDecision, HttpDecisionGenerator, Notifier, WebhookNotifier,
};
use crate::config;
use crate::core::{AuditLog, Supervisor};
use crate::domain::{DecisionRequest, DecisionState, Tier};

/// Event-sourced human/AI decision escalation engine
#[derive(Parser)]
#[command(name = "verdict", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a decision and drive it to resolution in-process
    Run {
        /// Subject content the decision is about
        #[arg(long)]
        subject: String,

        /// Escalation tier as approver:timeout (e.g. alice:30s); repeatable,
        /// in escalation order
        #[arg(long = "tier", required = true)]
        tiers: Vec<String>,
    },

    /// Show the current state of a decision
    Status {
        /// Request id
        request_id: Uuid,
    },

    /// Print a decision's audit trail
    Audit {
        /// Request id
        request_id: Uuid,

        /// Resume from this sequence number
        #[arg(long, default_value_t = 0)]
        from: u64,
    },

    /// List recorded decisions
    List,
}

impl Cli {
    /// Execute the parsed command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Command::Run { subject, tiers } => run_decision(subject, tiers).await,
            Command::Status { request_id } => show_status(request_id).await,
            Command::Audit { request_id, from } => show_audit(request_id, from).await,
            Command::List => list_decisions().await,
        }
    }
}

async fn run_decision(subject: String, tier_specs: Vec<String>) -> Result<()> {
    let config = config::get()?;

    let tiers = tier_specs
        .iter()
        .map(|spec| parse_tier(spec))
        .collect::<Result<Vec<_>>>()?;

    let notifier: Arc<dyn Notifier> = match &config.notifier {
        Some(webhook) => Arc::new(WebhookNotifier::new(webhook.clone())),
        None => Arc::new(LogNotifier),
    };

    let generator: Arc<dyn DecisionGenerator> = match &config.generator {
        Some(generator) => Arc::new(HttpDecisionGenerator::new(generator.clone())),
        None => Arc::new(UnconfiguredGenerator),
    };

    let audit = Arc::new(AuditLog::new(&config.decisions_dir));
    let supervisor = Supervisor::new(audit, notifier, generator, config.router.clone());

    let request = DecisionRequest::new(subject, tiers);
    let request_id = supervisor.create(request).await?;
    println!("created decision {}", request_id);

    // Poll until the orchestrator reaches a terminal state
    loop {
        let state = supervisor.status(request_id).await?;
        if state.is_terminal() {
            print_state(&state)?;
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

async fn show_status(request_id: Uuid) -> Result<()> {
    let config = config::get()?;
    let audit = AuditLog::new(&config.decisions_dir);

    let entries = audit.read(request_id).await?;
    let state = DecisionState::from_entries(&entries)
        .with_context(|| format!("No audit trail for request {}", request_id))?;

    print_state(&state)
}

async fn show_audit(request_id: Uuid, from: u64) -> Result<()> {
    let config = config::get()?;
    let audit = AuditLog::new(&config.decisions_dir);

    let entries = audit.read_from(request_id, from).await?;
    if entries.is_empty() {
        anyhow::bail!("No audit entries for request {} from sequence {}", request_id, from);
    }

    for entry in entries {
        println!(
            "{:>4}  {}  {:<16}  {}",
            entry.sequence,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            entry.event_type.to_string(),
            entry.payload
        );
    }

    Ok(())
}

async fn list_decisions() -> Result<()> {
    let config = config::get()?;
    let audit = AuditLog::new(&config.decisions_dir);

    let mut rows = Vec::new();
    for request_id in audit.list_requests().await? {
        let entries = audit.read(request_id).await?;
        if let Some(state) = DecisionState::from_entries(&entries) {
            rows.push((state.created_at, request_id, state.status));
        }
    }

    // Most recent first
    rows.sort_by(|a, b| b.0.cmp(&a.0));

    for (created_at, request_id, status) in rows {
        println!("{}  {}  {:?}", created_at.format("%Y-%m-%d %H:%M:%S"), request_id, status);
    }

    Ok(())
}

fn print_state(state: &DecisionState) -> Result<()> {
    let json = serde_json::to_string_pretty(state).context("Failed to render state")?;
    println!("{}", json);
    Ok(())
}

/// Parse an approver:timeout tier spec like "alice:30s" or "oncall:5m"
fn parse_tier(spec: &str) -> Result<Tier> {
    let (approver, timeout) = spec
        .rsplit_once(':')
        .with_context(|| format!("Invalid tier spec '{}', expected approver:timeout", spec))?;

    if approver.is_empty() {
        anyhow::bail!("Invalid tier spec '{}': empty approver", spec);
    }

    Ok(Tier::new(approver, parse_duration(timeout)?))
}

/// Parse a human duration: 500ms, 30s, 5m, 2h
fn parse_duration(s: &str) -> Result<Duration> {
    let (value, unit) = s.split_at(s.find(|c: char| c.is_ascii_alphabetic()).unwrap_or(s.len()));

    let value: u64 = value
        .parse()
        .with_context(|| format!("Invalid duration '{}'", s))?;

    let duration = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        _ => anyhow::bail!("Invalid duration '{}': use ms, s, m or h", s),
    };

    Ok(duration)
}

/// Notifier used when no webhook is configured: the request shows up in the
/// process log instead of a delivery channel.
struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, approver: &str, summary: &str) -> Result<()> {
        info!(%approver, %summary, "notification (no webhook configured)");
        Ok(())
    }
}

/// Generator used when no endpoint is configured. Always fails, so an
/// unanswered request ends FAILED instead of fabricating a decision.
struct UnconfiguredGenerator;

#[async_trait]
impl DecisionGenerator for UnconfiguredGenerator {
    async fn decide(&self, _subject: &str) -> Result<FallbackDecision> {
        anyhow::bail!("no decision generator configured")
    }
}
