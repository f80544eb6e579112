//! Unified error types for foreman

use crate::types::{ReservationInfo, TicketId, TicketStatus};
use thiserror::Error;

/// Unified error type for all foreman operations
#[derive(Error, Debug)]
pub enum ForemanError {
    // State machine errors
    #[error("invalid transition {from} -> {to} for {ticket} (allowed next: {})",
        format_statuses(.from.allowed_next()))]
    InvalidTransition {
        ticket: TicketId,
        from: TicketStatus,
        to: TicketStatus,
    },

    #[error("ticket not found: {0}")]
    TicketNotFound(TicketId),

    // Dependency graph errors
    #[error("dependency cycle detected: {}", format_cycle(.path))]
    CycleDetected { path: Vec<TicketId> },

    #[error("unknown dependency {dependency} declared by {ticket}")]
    UnknownDependency {
        ticket: TicketId,
        dependency: TicketId,
    },

    // Reservation errors
    #[error("reservation conflict on {}", format_conflicts(.conflicts))]
    ReservationConflict { conflicts: Vec<ReservationInfo> },

    // Worker boundary errors
    #[error("worker timed out after {seconds}s on {ticket}")]
    WorkerTimeout { ticket: TicketId, seconds: u64 },

    #[error("worker returned malformed result for {ticket}: {detail}")]
    WorkerMalformedResult { ticket: TicketId, detail: String },

    #[error("worker returned empty result for {ticket}")]
    WorkerEmptyResult { ticket: TicketId },

    // Checkpoint/rollback errors
    #[error("rollback conflict on {ticket}{}: files {}",
        .other.map(|o| format!(" vs {}", o)).unwrap_or_default(),
        .files.join(", "))]
    RollbackConflict {
        ticket: TicketId,
        other: Option<TicketId>,
        files: Vec<String>,
    },

    #[error("workspace has uncommitted changes: {}", .dirty.join(", "))]
    DirtyWorkspace { dirty: Vec<String> },

    #[error("checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("vcs command failed: {0}")]
    Vcs(String),

    // Remediation errors
    #[error("remediation budget exhausted after {cycles} cycles; escalation required")]
    RemediationBudgetExhausted { cycles: u32 },

    // Store errors
    #[error("corrupt record at {path}: {detail}")]
    CorruptRecord { path: String, detail: String },

    #[error("configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(String),
}

fn format_cycle(path: &[TicketId]) -> String {
    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn format_statuses(statuses: &[TicketStatus]) -> String {
    if statuses.is_empty() {
        return "none, terminal".to_string();
    }
    statuses
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_conflicts(conflicts: &[ReservationInfo]) -> String {
    conflicts
        .iter()
        .map(|c| format!("{} (held by {} / {})", c.path, c.ticket, c.worker))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias using ForemanError
pub type Result<T> = std::result::Result<T, ForemanError>;
