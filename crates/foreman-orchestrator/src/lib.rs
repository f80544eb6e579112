//! # foreman-orchestrator
//!
//! The orchestration brain: partitions ready tickets into conflict-free
//! waves, dispatches workers under deadlines, validates their results
//! against the reservation table, reviews completed work through quality
//! gates, and drives the bounded remediation loop. Worker and gate
//! execution stay behind traits; this crate never reasons about content.

pub mod waves;

mod dispatch;
mod gates;
mod import;
mod remediation;
mod worker;

pub use dispatch::{Dispatcher, StatusSnapshot, StepOutcome};
pub use gates::{GateLedger, GateResult, GateRunner, GateScope, MockGateRunner};
pub use import::{import_graph, TaskGraph, TaskSpec};
pub use remediation::{
    CycleRecord, EscalationReport, RemediationController, RemediationDecision,
};
pub use worker::{MockWorker, WorkerExecutor, WorkerResult, WorkerStatus};
