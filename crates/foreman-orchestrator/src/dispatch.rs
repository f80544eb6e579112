//! Dispatch loop and operator control surface
//!
//! One scheduler iteration (`step`):
//!
//! 1. Reclaim stale reservations
//! 2. Unblock tickets whose dependencies completed; re-queue retryable
//!    failures
//! 3. Partition the ready set into a wave (no file overlap, size cap)
//! 4. Reserve each member's files all-or-nothing; conflicts defer the
//!    ticket, the rest of the wave proceeds
//! 5. Execute the wave concurrently under the per-ticket deadline
//! 6. Validate every result against the contract and the reserved set
//! 7. Review passing tickets through their gates, checkpoint completions
//! 8. When nothing is ready, run session gates and hand failures to the
//!    remediation controller
//!
//! Pause and skip take effect at wave boundaries; in-flight results are
//! still validated and recorded.

use crate::gates::{GateLedger, GateRunner, GateScope};
use crate::remediation::{EscalationReport, RemediationController, RemediationDecision};
use crate::waves;
use crate::worker::{WorkerExecutor, WorkerResult, WorkerStatus};
use foreman_core::{
    Finding, ForemanConfig, ForemanError, ReservationInfo, Result, SessionPhase, Ticket,
    TicketId, TicketStatus,
};
use foreman_store::{graph, EventLog, ReservationLedger, SessionStore, TicketStore};
use foreman_vcs::{Checkpoint, CheckpointManager, TicketRollback, VcsExecutor};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What one scheduler iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// A wave was dispatched with this many tickets
    Dispatched(usize),
    /// No ready tickets; session gates ran and remediation was scheduled
    Gated,
    /// Every ticket terminal and every session gate passed
    Complete,
    /// Remediation budget exhausted or unfinished tickets cannot proceed
    Escalated,
}

/// Point-in-time view of the session for operators
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatusSnapshot {
    pub phase: SessionPhase,
    pub remediation_cycle: u32,
    pub paused: bool,
    pub counts: BTreeMap<String, usize>,
    pub reservations: Vec<ReservationInfo>,
    pub checkpoints: Vec<Checkpoint>,
}

/// The orchestration dispatch loop
pub struct Dispatcher<E: VcsExecutor, W: WorkerExecutor, G: GateRunner> {
    config: ForemanConfig,
    store: TicketStore,
    reservations: ReservationLedger,
    session: SessionStore,
    events: EventLog,
    checkpoints: CheckpointManager<E>,
    workers: W,
    gates: G,
    gate_ledger: GateLedger,
    remediation: RemediationController,
    escalation: Option<EscalationReport>,
    paused: bool,
}

impl<E: VcsExecutor, W: WorkerExecutor, G: GateRunner> Dispatcher<E, W, G> {
    /// Open every state table and assemble the loop
    pub fn open(
        repo_root: &Path,
        config: ForemanConfig,
        vcs: E,
        workers: W,
        gates: G,
    ) -> Result<Self> {
        let store = TicketStore::open(repo_root)?;
        let reservations = ReservationLedger::open(repo_root)?;
        let session = SessionStore::open(repo_root)?;
        let events = EventLog::open(repo_root)?;
        let checkpoints = CheckpointManager::open(vcs)?;
        let gate_ledger = GateLedger::open(repo_root)?;
        let remediation = RemediationController::new(config.max_remediation_cycles);

        Ok(Self {
            config,
            store,
            reservations,
            session,
            events,
            checkpoints,
            workers,
            gates,
            gate_ledger,
            remediation,
            escalation: None,
            paused: false,
        })
    }

    /// Run scheduler iterations until the session finishes or pauses
    pub async fn run(&mut self) -> Result<SessionPhase> {
        self.session.set_phase(SessionPhase::Executing)?;
        loop {
            if self.paused {
                info!("paused at wave boundary");
                return Ok(self.session.state.phase);
            }
            match self.step().await? {
                StepOutcome::Dispatched(_) | StepOutcome::Gated => continue,
                StepOutcome::Complete => {
                    self.session.set_phase(SessionPhase::Complete)?;
                    info!("session complete");
                    return Ok(SessionPhase::Complete);
                }
                StepOutcome::Escalated => return Ok(SessionPhase::Escalated),
            }
        }
    }

    /// One scheduler iteration
    pub async fn step(&mut self) -> Result<StepOutcome> {
        self.sweep_reservations()?;
        self.reconcile_statuses()?;

        let ready: Vec<Ticket> = graph::ready_set(self.store.tickets())
            .into_iter()
            .cloned()
            .collect();
        if ready.is_empty() {
            return self.gate_session().await;
        }

        let refs: Vec<&Ticket> = ready.iter().collect();
        let wave: Vec<TicketId> = waves::next_wave(&refs, self.config.max_wave_size)
            .iter()
            .map(|t| t.id)
            .collect();
        let dispatched = self.run_wave(&wave).await?;
        Ok(StepOutcome::Dispatched(dispatched))
    }

    /// Reclaim reservations past the staleness cutoff
    fn sweep_reservations(&mut self) -> Result<()> {
        let max_age = chrono::Duration::minutes(self.config.stale_reservation_minutes);
        let statuses: BTreeMap<TicketId, TicketStatus> = self
            .store
            .tickets()
            .iter()
            .map(|(id, t)| (*id, t.status))
            .collect();
        let reclaimed = self
            .reservations
            .sweep_stale(max_age, |id| statuses.get(&id).copied())?;
        for r in reclaimed {
            self.events.post(
                "reservations",
                "reservation_reclaimed",
                json!({"path": r.path, "ticket": r.ticket.to_string(), "worker": r.worker}),
            )?;
        }
        Ok(())
    }

    /// Unblock satisfied tickets and re-queue retryable failures
    fn reconcile_statuses(&mut self) -> Result<()> {
        let unblockable: Vec<TicketId> = self
            .store
            .with_status(TicketStatus::Blocked)
            .iter()
            .filter(|t| graph::blocked_by(t, self.store.tickets()).is_empty())
            .filter(|t| !t.files.iter().any(|f| self.config.is_protected(f)))
            .map(|t| t.id)
            .collect();
        for id in unblockable {
            debug!("{} unblocked", id);
            self.store.transition(id, TicketStatus::Pending)?;
        }

        let retryable: Vec<TicketId> = self
            .store
            .with_status(TicketStatus::Failed)
            .iter()
            .filter(|t| t.attempt < self.config.max_ticket_attempts)
            .map(|t| t.id)
            .collect();
        for id in retryable {
            self.store.requeue(id, "automatic retry")?;
            self.events.post(
                "dispatch",
                "ticket_requeued",
                json!({"ticket": id.to_string()}),
            )?;
        }
        Ok(())
    }

    /// Reserve, execute and reconcile one wave
    async fn run_wave(&mut self, wave: &[TicketId]) -> Result<usize> {
        let mut executing: Vec<(Ticket, Vec<String>)> = Vec::new();
        for id in wave {
            let ticket = self.store.get(*id)?.clone();

            if let Some(path) = ticket.files.iter().find(|f| self.config.is_protected(f)) {
                let note = format!("declares protected path {}", path);
                self.store.add_note(*id, note.as_str())?;
                self.store.transition(*id, TicketStatus::Blocked)?;
                self.events.post(
                    "dispatch",
                    "ticket_blocked",
                    json!({"ticket": id.to_string(), "path": path}),
                )?;
                continue;
            }

            let worker_name = ticket
                .worker
                .clone()
                .unwrap_or_else(|| format!("worker-{}", short_run_id()));
            match self.reservations.reserve(*id, &worker_name, &ticket.files) {
                Ok(_) => {
                    let reserved = ticket.files.clone();
                    let in_progress = self.store.transition(*id, TicketStatus::InProgress)?;
                    executing.push((in_progress, reserved));
                }
                Err(ForemanError::ReservationConflict { conflicts }) => {
                    debug!("{} deferred: {} path(s) held elsewhere", id, conflicts.len());
                    self.events.post(
                        "dispatch",
                        "ticket_deferred",
                        json!({
                            "ticket": id.to_string(),
                            "paths": conflicts.iter().map(|c| c.path.clone()).collect::<Vec<_>>(),
                        }),
                    )?;
                }
                Err(e) => return Err(e),
            }
        }

        if executing.is_empty() {
            return Ok(0);
        }
        info!("dispatching wave of {}", executing.len());
        self.events.post(
            "dispatch",
            "wave_started",
            json!({"tickets": executing.iter().map(|(t, _)| t.id.to_string()).collect::<Vec<_>>()}),
        )?;

        let seconds = self.config.worker_timeout_secs;
        let deadline = Duration::from_secs(seconds);
        let workers = &self.workers;
        let results: Vec<(TicketId, Result<String>)> =
            futures::future::join_all(executing.iter().map(|(ticket, files)| async move {
                let run_id = short_run_id();
                debug!("run {} executing {}", run_id, ticket.id);
                let outcome = match tokio::time::timeout(deadline, workers.execute(ticket, files))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ForemanError::WorkerTimeout {
                        ticket: ticket.id,
                        seconds,
                    }),
                };
                (ticket.id, outcome)
            }))
            .await;

        let dispatched = results.len();
        for (id, outcome) in results {
            self.reconcile_result(id, outcome).await?;
        }
        Ok(dispatched)
    }

    /// Validate one worker outcome and advance the ticket accordingly
    async fn reconcile_result(&mut self, id: TicketId, outcome: Result<String>) -> Result<()> {
        let raw = match outcome {
            Ok(raw) => raw,
            Err(e) => return self.fail_ticket(id, &e.to_string(), "worker_error"),
        };
        let result = match WorkerResult::parse(id, &raw) {
            Ok(result) => result,
            Err(e) => return self.fail_ticket(id, &e.to_string(), "worker_result_rejected"),
        };

        let reserved = self.reservations.held_by(id);
        let extra: Vec<String> = result
            .touched()
            .into_iter()
            .filter(|p| !reserved.contains(p))
            .collect();
        if !extra.is_empty() {
            self.events.post(
                "dispatch",
                "manual_review",
                json!({"ticket": id.to_string(), "paths": extra}),
            )?;
            let note = format!(
                "touched unreserved paths: {}; flagged for manual review, changes not committed",
                extra.join(", ")
            );
            return self.fail_ticket(id, &note, "unreserved_write");
        }

        match result.status {
            WorkerStatus::Completed => {
                self.store.transition(id, TicketStatus::Review)?;
                self.review_ticket(id).await
            }
            WorkerStatus::Failed => {
                self.fail_ticket(id, &format!("worker failed: {}", result.report), "worker_failed")
            }
            WorkerStatus::Blocked => self.fail_ticket(
                id,
                &format!("worker blocked: {}", result.report),
                "worker_blocked",
            ),
        }
    }

    /// Run a reviewed ticket through its gates; complete and checkpoint on pass
    async fn review_ticket(&mut self, id: TicketId) -> Result<()> {
        let mut findings = Vec::new();
        for gate in self.gates.ticket_gates() {
            let result = self.gates.run(&gate, &GateScope::Ticket(id)).await?;
            self.events.post(
                "gates",
                "gate_result",
                json!({"gate": gate, "scope": id.to_string(), "passed": result.passed}),
            )?;
            if !result.passed {
                findings.extend(result.findings);
            }
        }
        if !findings.is_empty() {
            let summary = findings
                .iter()
                .map(|f| format!("[{}] {}: {}", f.severity, f.gate, f.message))
                .collect::<Vec<_>>()
                .join("; ");
            return self.fail_ticket(id, &format!("review failed: {}", summary), "review_failed");
        }

        let ticket = self.store.transition(id, TicketStatus::Completed)?;
        let message = format!("{}: {}", id, ticket.title);
        match self.checkpoints.checkpoint(&message, Some(id)).await {
            Ok(ckpt) => self.store.set_checkpoint(id, ckpt.tag)?,
            Err(e) => {
                warn!("checkpoint after {} failed: {}", id, e);
                self.store.add_note(id, format!("checkpoint failed: {}", e))?;
            }
        }
        self.reservations.release(id)?;
        self.events.post(
            "dispatch",
            "ticket_completed",
            json!({"ticket": id.to_string()}),
        )?;
        Ok(())
    }

    /// Fail a ticket, attach context, release its reservations
    fn fail_ticket(&mut self, id: TicketId, note: &str, kind: &str) -> Result<()> {
        warn!("{} failed: {}", id, note);
        self.store.transition(id, TicketStatus::Failed)?;
        self.store.add_note(id, note)?;
        self.reservations.release(id)?;
        self.events.post(
            "dispatch",
            kind,
            json!({"ticket": id.to_string(), "detail": note}),
        )?;
        Ok(())
    }

    /// Run session gates and feed failures to the remediation controller
    async fn gate_session(&mut self) -> Result<StepOutcome> {
        self.session.set_phase(SessionPhase::Gating)?;

        let session_gates = self.gates.session_gates();
        let pending: Vec<String> = self
            .gate_ledger
            .pending(&session_gates)
            .into_iter()
            .cloned()
            .collect();
        let mut findings = Vec::new();
        for gate in &pending {
            let result = self.gates.run(gate, &GateScope::Session).await?;
            self.events.post(
                "gates",
                "gate_result",
                json!({"gate": gate, "scope": "session", "passed": result.passed}),
            )?;
            if result.passed {
                self.gate_ledger.record_pass(gate)?;
            } else {
                findings.extend(result.findings);
            }
        }

        if findings.is_empty() {
            let unfinished: Vec<String> = self
                .store
                .all()
                .iter()
                .filter(|t| !t.status.is_terminal())
                .map(|t| t.id.to_string())
                .collect();
            if unfinished.is_empty() {
                self.events.post("dispatch", "session_complete", json!({}))?;
                return Ok(StepOutcome::Complete);
            }
            // Nothing ready, nothing retryable: surface to the operator
            warn!(
                "no dispatchable work but {} unfinished ticket(s): {}",
                unfinished.len(),
                unfinished.join(", ")
            );
            self.session.set_phase(SessionPhase::Escalated)?;
            self.events.post(
                "dispatch",
                "session_stalled",
                json!({"tickets": unfinished}),
            )?;
            return Ok(StepOutcome::Escalated);
        }

        self.session.set_phase(SessionPhase::Remediating)?;
        let cycle = self.session.state.remediation_cycle;
        // A finding implicates the completed ticket that declared its file
        let origin_of = |f: &Finding| -> Option<TicketId> {
            let file = f.file.as_deref()?;
            self.store
                .with_status(TicketStatus::Completed)
                .into_iter()
                .find(|t| t.files.iter().any(|p| p == file))
                .map(|t| t.id)
        };
        match self.remediation.decide(cycle, &findings, origin_of) {
            RemediationDecision::Remediate(drafts) => {
                let mut ids = Vec::new();
                for draft in drafts {
                    ids.push(self.store.create(draft)?.id);
                }
                self.remediation.record_cycle(cycle + 1, findings, ids.clone());
                self.session.set_cycle(cycle + 1)?;
                self.events.post(
                    "remediation",
                    "cycle_started",
                    json!({
                        "cycle": cycle + 1,
                        "tickets": ids.iter().map(|i| i.to_string()).collect::<Vec<_>>(),
                    }),
                )?;
                self.session.set_phase(SessionPhase::Executing)?;
                Ok(StepOutcome::Gated)
            }
            RemediationDecision::Escalate(report) => {
                self.session.set_phase(SessionPhase::Escalated)?;
                self.events.post(
                    "remediation",
                    "escalated",
                    json!({"report": report.render()}),
                )?;
                self.escalation = Some(report);
                Ok(StepOutcome::Escalated)
            }
        }
    }

    // ---- operator control surface ----

    /// Stop dispatching at the next wave boundary
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    /// Skip a ticket (terminal); its reservations are released
    pub fn skip(&mut self, id: TicketId) -> Result<Ticket> {
        let ticket = self.store.transition(id, TicketStatus::Skipped)?;
        self.reservations.release(id)?;
        self.events.post(
            "operator",
            "ticket_skipped",
            json!({"ticket": id.to_string()}),
        )?;
        Ok(ticket)
    }

    /// Re-queue a failed ticket
    pub fn retry(&mut self, id: TicketId) -> Result<Ticket> {
        let ticket = self.store.requeue(id, "operator retry")?;
        self.events.post(
            "operator",
            "ticket_requeued",
            json!({"ticket": id.to_string()}),
        )?;
        Ok(ticket)
    }

    /// Assign a worker to a ticket
    pub fn assign(&mut self, id: TicketId, worker: &str) -> Result<Ticket> {
        let ticket = self.store.assign(id, worker)?;
        self.events.post(
            "operator",
            "ticket_assigned",
            json!({"ticket": id.to_string(), "worker": worker}),
        )?;
        Ok(ticket)
    }

    /// Force a passed session gate to run again
    pub fn override_gate(&mut self, gate: &str) -> Result<bool> {
        let removed = self.gate_ledger.invalidate(gate)?;
        self.events
            .post("operator", "gate_overridden", json!({"gate": gate}))?;
        Ok(removed)
    }

    /// Revert a ticket's checkpoints and reset it to pending
    ///
    /// A revert conflict is mapped to the other ticket whose declared files
    /// overlap the conflicting paths, so the error names both sides.
    pub async fn rollback_ticket(&mut self, id: TicketId) -> Result<TicketRollback> {
        match self.checkpoints.rollback_ticket(id).await {
            Ok(outcome) => {
                if outcome.checkpoint.is_some() {
                    self.store.reset_after_rollback(
                        id,
                        format!(
                            "rolled back: {} checkpoint(s) reverted",
                            outcome.reverted.len()
                        ),
                    )?;
                }
                self.events.post(
                    "operator",
                    "ticket_rolled_back",
                    json!({"ticket": id.to_string(), "reverted": outcome.reverted.len()}),
                )?;
                Ok(outcome)
            }
            Err(ForemanError::RollbackConflict { ticket, files, .. }) => {
                let other = self
                    .store
                    .all()
                    .into_iter()
                    .filter(|t| t.id != ticket)
                    .find(|t| t.files.iter().any(|f| files.contains(f)))
                    .map(|t| t.id);
                Err(ForemanError::RollbackConflict {
                    ticket,
                    other,
                    files,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Restore the workspace to a recorded checkpoint
    pub async fn rollback_to(&mut self, reference: &str) -> Result<Checkpoint> {
        let ckpt = self.checkpoints.rollback_to_checkpoint(reference).await?;
        self.events.post(
            "operator",
            "checkpoint_restored",
            json!({"checkpoint": ckpt.tag}),
        )?;
        Ok(ckpt)
    }

    /// Current session state for operators
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            phase: self.session.state.phase,
            remediation_cycle: self.session.state.remediation_cycle,
            paused: self.paused,
            counts: self.store.counts_by_status(),
            reservations: self.reservations.active(),
            checkpoints: self.checkpoints.history().to_vec(),
        }
    }

    /// The escalation report, once the session escalated through remediation
    pub fn escalation(&self) -> Option<&EscalationReport> {
        self.escalation.as_ref()
    }

    /// Borrow the ticket store (read paths for CLI rendering)
    pub fn store(&self) -> &TicketStore {
        &self.store
    }

    /// Mutable store access for ticket creation and import
    pub fn store_mut(&mut self) -> &mut TicketStore {
        &mut self.store
    }

    /// Borrow the event log
    pub fn events(&self) -> &EventLog {
        &self.events
    }
}

fn short_run_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::{GateResult, MockGateRunner};
    use crate::worker::MockWorker;
    use foreman_core::{Finding, Priority, Severity};
    use foreman_store::NewTicket;
    use foreman_vcs::MockVcsExecutor;

    fn new_ticket(title: &str, files: &[&str]) -> NewTicket {
        NewTicket {
            title: title.to_string(),
            files: files.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn config() -> ForemanConfig {
        ForemanConfig {
            max_ticket_attempts: 0,
            ..Default::default()
        }
    }

    /// Mock VCS responses for checkpointing one completed ticket
    fn checkpoint_responses(
        vcs: MockVcsExecutor,
        message: &str,
        seq: u64,
        ticket: &str,
        sha: &str,
    ) -> MockVcsExecutor {
        vcs.with_ok("status --porcelain", " M src/work.rs\n")
            .with_ok("add -A", "")
            .with_ok(&format!("commit -m {}", message), "")
            .with_ok("rev-parse HEAD", &format!("{}\n", sha))
            .with_ok(&format!("tag ckpt-{} {}", seq, sha), "")
            .with_ok(&format!("tag ticket-{}-{} {}", ticket, seq, sha), "")
    }

    #[tokio::test]
    async fn test_independent_tickets_complete_in_one_session() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TicketStore::init(dir.path()).unwrap();
            store.create(new_ticket("alpha", &["src/a.rs"])).unwrap();
            store.create(new_ticket("beta", &["src/b.rs"])).unwrap();
        }

        let vcs = MockVcsExecutor::new().with_repo_root(dir.path());
        let vcs = checkpoint_responses(vcs, "TICKET-001: alpha", 1, "TICKET-001", "aaa111");
        let vcs = checkpoint_responses(vcs, "TICKET-002: beta", 2, "TICKET-002", "aaa111");

        let workers = MockWorker::new()
            .with_completion(TicketId(1), &["src/a.rs"])
            .with_completion(TicketId(2), &["src/b.rs"]);

        let mut dispatcher =
            Dispatcher::open(dir.path(), config(), vcs, workers, MockGateRunner::new()).unwrap();
        let phase = dispatcher.run().await.unwrap();

        assert_eq!(phase, SessionPhase::Complete);
        let store = dispatcher.store();
        assert_eq!(
            store.get(TicketId(1)).unwrap().status,
            TicketStatus::Completed
        );
        assert_eq!(
            store.get(TicketId(2)).unwrap().status,
            TicketStatus::Completed
        );
        assert!(dispatcher.status().reservations.is_empty());
        assert_eq!(dispatcher.status().checkpoints.len(), 2);
    }

    #[tokio::test]
    async fn test_dependency_dispatches_in_two_waves() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TicketStore::init(dir.path()).unwrap();
            let a = store.create(new_ticket("upstream", &["src/a.rs"])).unwrap();
            let mut b = new_ticket("downstream", &["src/b.rs"]);
            b.dependencies = vec![a.id];
            store.create(b).unwrap();
        }

        let vcs = MockVcsExecutor::new().with_repo_root(dir.path());
        let vcs = checkpoint_responses(vcs, "TICKET-001: upstream", 1, "TICKET-001", "aaa111");
        let vcs = checkpoint_responses(vcs, "TICKET-002: downstream", 2, "TICKET-002", "aaa111");

        let workers = MockWorker::new()
            .with_completion(TicketId(1), &["src/a.rs"])
            .with_completion(TicketId(2), &["src/b.rs"]);

        let mut dispatcher =
            Dispatcher::open(dir.path(), config(), vcs, workers, MockGateRunner::new()).unwrap();

        // Wave 1 carries only the upstream ticket despite disjoint files
        let first = dispatcher.step().await.unwrap();
        assert_eq!(first, StepOutcome::Dispatched(1));
        assert_eq!(
            dispatcher.store().get(TicketId(1)).unwrap().status,
            TicketStatus::Completed
        );
        assert_eq!(
            dispatcher.store().get(TicketId(2)).unwrap().status,
            TicketStatus::Pending
        );

        let second = dispatcher.step().await.unwrap();
        assert_eq!(second, StepOutcome::Dispatched(1));
        assert_eq!(
            dispatcher.store().get(TicketId(2)).unwrap().status,
            TicketStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_empty_worker_result_fails_and_releases() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TicketStore::init(dir.path()).unwrap();
            store.create(new_ticket("silent", &["src/a.rs"])).unwrap();
        }

        let vcs = MockVcsExecutor::new().with_repo_root(dir.path());
        let workers = MockWorker::new().with_response(TicketId(1), "");

        let mut dispatcher =
            Dispatcher::open(dir.path(), config(), vcs, workers, MockGateRunner::new()).unwrap();
        let phase = dispatcher.run().await.unwrap();

        // The failed ticket cannot proceed, so the session escalates
        assert_eq!(phase, SessionPhase::Escalated);
        let ticket = dispatcher.store().get(TicketId(1)).unwrap();
        assert_eq!(ticket.status, TicketStatus::Failed);
        assert!(ticket.notes.iter().any(|n| n.contains("empty")));
        assert!(dispatcher.status().reservations.is_empty());
        assert!(dispatcher.status().checkpoints.is_empty());
    }

    #[tokio::test]
    async fn test_unreserved_write_rejected_for_manual_review() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TicketStore::init(dir.path()).unwrap();
            store.create(new_ticket("greedy", &["src/a.rs"])).unwrap();
        }

        let vcs = MockVcsExecutor::new().with_repo_root(dir.path());
        let raw = r#"{"status": "completed", "files_modified": ["src/a.rs", "src/other.rs"], "report": "done"}"#;
        let workers = MockWorker::new().with_response(TicketId(1), raw);

        let mut dispatcher =
            Dispatcher::open(dir.path(), config(), vcs, workers, MockGateRunner::new()).unwrap();
        dispatcher.step().await.unwrap();

        let ticket = dispatcher.store().get(TicketId(1)).unwrap();
        assert_eq!(ticket.status, TicketStatus::Failed);
        assert!(ticket.notes.iter().any(|n| n.contains("src/other.rs")));
        assert!(dispatcher
            .events()
            .latest("manual_review")
            .unwrap()
            .is_some());
        // Nothing was checkpointed
        assert!(dispatcher.status().checkpoints.is_empty());
    }

    #[tokio::test]
    async fn test_worker_timeout_fails_ticket() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TicketStore::init(dir.path()).unwrap();
            store.create(new_ticket("slow", &["src/a.rs"])).unwrap();
        }

        let vcs = MockVcsExecutor::new().with_repo_root(dir.path());
        let workers = MockWorker::new()
            .with_completion(TicketId(1), &["src/a.rs"])
            .with_delay_ms(1500);
        let mut cfg = config();
        cfg.worker_timeout_secs = 1;

        let mut dispatcher =
            Dispatcher::open(dir.path(), cfg, vcs, workers, MockGateRunner::new()).unwrap();
        dispatcher.step().await.unwrap();

        let ticket = dispatcher.store().get(TicketId(1)).unwrap();
        assert_eq!(ticket.status, TicketStatus::Failed);
        assert!(ticket.notes.iter().any(|n| n.contains("timed out")));
        assert!(dispatcher.status().reservations.is_empty());
    }

    #[tokio::test]
    async fn test_failed_ticket_gate_blocks_completion() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TicketStore::init(dir.path()).unwrap();
            store.create(new_ticket("shaky", &["src/a.rs"])).unwrap();
        }

        let vcs = MockVcsExecutor::new().with_repo_root(dir.path());
        let workers = MockWorker::new().with_completion(TicketId(1), &["src/a.rs"]);
        let gates = MockGateRunner::new().with_ticket_gate("lint").with_result(
            "lint",
            GateResult::fail(
                "lint",
                vec![Finding {
                    gate: "lint".to_string(),
                    severity: Severity::Medium,
                    message: "unused import".to_string(),
                    file: Some("src/a.rs".to_string()),
                    suggestion: None,
                }],
            ),
        );

        let mut dispatcher = Dispatcher::open(dir.path(), config(), vcs, workers, gates).unwrap();
        dispatcher.step().await.unwrap();

        let ticket = dispatcher.store().get(TicketId(1)).unwrap();
        assert_eq!(ticket.status, TicketStatus::Failed);
        assert!(ticket.notes.iter().any(|n| n.contains("unused import")));
        assert!(dispatcher.status().checkpoints.is_empty());
    }

    #[tokio::test]
    async fn test_session_gate_failure_drives_remediation_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TicketStore::init(dir.path()).unwrap();
            store
                .create(new_ticket("feature", &["src/parser.rs"]))
                .unwrap();
        }

        let vcs = MockVcsExecutor::new().with_repo_root(dir.path());
        let vcs = checkpoint_responses(vcs, "TICKET-001: feature", 1, "TICKET-001", "aaa111");
        let vcs = checkpoint_responses(
            vcs,
            "TICKET-002: remediate tests: coverage regression",
            2,
            "TICKET-002",
            "aaa111",
        );

        let workers = MockWorker::new()
            .with_completion(TicketId(1), &["src/parser.rs"])
            .with_completion(TicketId(2), &["src/parser.rs"]);

        // Fails once with a high finding, passes after remediation
        let gates = MockGateRunner::new()
            .with_session_gate("tests")
            .with_result(
                "tests",
                GateResult::fail(
                    "tests",
                    vec![Finding {
                        gate: "tests".to_string(),
                        severity: Severity::High,
                        message: "coverage regression".to_string(),
                        file: Some("src/parser.rs".to_string()),
                        suggestion: None,
                    }],
                ),
            )
            .with_result("tests", GateResult::pass("tests"));

        let mut dispatcher = Dispatcher::open(dir.path(), config(), vcs, workers, gates).unwrap();
        let phase = dispatcher.run().await.unwrap();

        assert_eq!(phase, SessionPhase::Complete);
        let remediation = dispatcher.store().get(TicketId(2)).unwrap();
        assert_eq!(remediation.priority, Priority::High);
        assert_eq!(remediation.status, TicketStatus::Completed);
        // The finding's file points back at the ticket whose work it implicates
        assert_eq!(remediation.remediation_of, Some(TicketId(1)));
        assert_eq!(dispatcher.status().remediation_cycle, 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_escalates_with_full_history() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TicketStore::init(dir.path()).unwrap();
            store.create(new_ticket("feature", &["src/a.rs"])).unwrap();
        }

        let vcs = MockVcsExecutor::new().with_repo_root(dir.path());
        let vcs = checkpoint_responses(vcs, "TICKET-001: feature", 1, "TICKET-001", "aaa111");
        let vcs = checkpoint_responses(
            vcs,
            "TICKET-002: remediate tests: flaky integration test",
            2,
            "TICKET-002",
            "aaa111",
        );

        let workers = MockWorker::new()
            .with_completion(TicketId(1), &["src/a.rs"])
            .with_completion(TicketId(2), &["tests/it.rs"]);

        let failure = || {
            GateResult::fail(
                "tests",
                vec![Finding {
                    gate: "tests".to_string(),
                    severity: Severity::High,
                    message: "flaky integration test".to_string(),
                    file: Some("tests/it.rs".to_string()),
                    suggestion: None,
                }],
            )
        };
        let gates = MockGateRunner::new()
            .with_session_gate("tests")
            .with_result("tests", failure())
            .with_result("tests", failure());

        let mut cfg = config();
        cfg.max_remediation_cycles = 1;

        let mut dispatcher = Dispatcher::open(dir.path(), cfg, vcs, workers, gates).unwrap();
        let phase = dispatcher.run().await.unwrap();

        assert_eq!(phase, SessionPhase::Escalated);
        let report = dispatcher.escalation().unwrap();
        assert_eq!(report.cycles_run, 1);
        assert_eq!(report.history.len(), 1);
        assert_eq!(report.outstanding.len(), 1);
        assert!(report.render().contains("flaky integration test"));
    }

    #[tokio::test]
    async fn test_pause_takes_effect_at_wave_boundary() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TicketStore::init(dir.path()).unwrap();
            store.create(new_ticket("waiting", &["src/a.rs"])).unwrap();
        }

        let vcs = MockVcsExecutor::new().with_repo_root(dir.path());
        let mut dispatcher = Dispatcher::open(
            dir.path(),
            config(),
            vcs,
            MockWorker::new(),
            MockGateRunner::new(),
        )
        .unwrap();

        dispatcher.pause();
        dispatcher.run().await.unwrap();
        // Nothing was dispatched while paused
        assert_eq!(
            dispatcher.store().get(TicketId(1)).unwrap().status,
            TicketStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_protected_path_blocks_ticket() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TicketStore::init(dir.path()).unwrap();
            store
                .create(new_ticket("sneaky", &[".git/config"]))
                .unwrap();
        }

        let vcs = MockVcsExecutor::new().with_repo_root(dir.path());
        let mut dispatcher = Dispatcher::open(
            dir.path(),
            config(),
            vcs,
            MockWorker::new(),
            MockGateRunner::new(),
        )
        .unwrap();
        dispatcher.step().await.unwrap();

        let ticket = dispatcher.store().get(TicketId(1)).unwrap();
        assert_eq!(ticket.status, TicketStatus::Blocked);
        assert!(ticket.notes.iter().any(|n| n.contains(".git/config")));
    }

    #[tokio::test]
    async fn test_rollback_conflict_names_both_tickets() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TicketStore::init(dir.path()).unwrap();
            store.create(new_ticket("first", &["src/shared.rs"])).unwrap();
            store
                .create(new_ticket("second", &["src/shared.rs", "src/b.rs"]))
                .unwrap();
        }

        // Seed a checkpoint for TICKET-001, as a completed wave would have
        {
            let vcs = MockVcsExecutor::new().with_repo_root(dir.path());
            let vcs = checkpoint_responses(vcs, "TICKET-001: first", 1, "TICKET-001", "aaa111");
            let mut manager = foreman_vcs::CheckpointManager::open(vcs).unwrap();
            manager
                .checkpoint("TICKET-001: first", Some(TicketId(1)))
                .await
                .unwrap();
        }

        // Clean tree, but reverting TICKET-001 conflicts on the shared file
        let vcs = MockVcsExecutor::new()
            .with_repo_root(dir.path())
            .with_ok("status --porcelain", "")
            .with_ok("rev-parse HEAD", "bbb222\n")
            .with_err("revert --no-commit aaa111", "error: could not revert")
            .with_ok("diff --name-only --diff-filter=U", "src/shared.rs\n")
            .with_ok("revert --abort", "")
            .with_ok("reset --hard bbb222", "");

        let mut dispatcher = Dispatcher::open(
            dir.path(),
            config(),
            vcs,
            MockWorker::new(),
            MockGateRunner::new(),
        )
        .unwrap();

        let err = dispatcher.rollback_ticket(TicketId(1)).await.unwrap_err();
        match err {
            ForemanError::RollbackConflict {
                ticket,
                other,
                files,
            } => {
                assert_eq!(ticket, TicketId(1));
                assert_eq!(other, Some(TicketId(2)));
                assert_eq!(files, vec!["src/shared.rs".to_string()]);
            }
            other => panic!("unexpected error: {}", other),
        }
        // The ticket was not reset
        assert_eq!(
            dispatcher.store().get(TicketId(1)).unwrap().attempt,
            0
        );
    }

    #[tokio::test]
    async fn test_rollback_resets_ticket_to_pending() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TicketStore::init(dir.path()).unwrap();
            let t = store.create(new_ticket("undo-me", &["src/a.rs"])).unwrap();
            store.transition(t.id, TicketStatus::InProgress).unwrap();
            store.transition(t.id, TicketStatus::Review).unwrap();
            store.transition(t.id, TicketStatus::Completed).unwrap();
        }
        {
            let vcs = MockVcsExecutor::new().with_repo_root(dir.path());
            let vcs = checkpoint_responses(vcs, "TICKET-001: undo-me", 1, "TICKET-001", "aaa111");
            let mut manager = foreman_vcs::CheckpointManager::open(vcs).unwrap();
            manager
                .checkpoint("TICKET-001: undo-me", Some(TicketId(1)))
                .await
                .unwrap();
        }

        let vcs = MockVcsExecutor::new()
            .with_repo_root(dir.path())
            .with_ok("status --porcelain", "")
            .with_ok("rev-parse HEAD", "bbb222\n")
            .with_ok("revert --no-commit aaa111", "")
            .with_ok("commit -m rollback TICKET-001", "")
            .with_ok("tag ckpt-2 bbb222", "");

        let mut dispatcher = Dispatcher::open(
            dir.path(),
            config(),
            vcs,
            MockWorker::new(),
            MockGateRunner::new(),
        )
        .unwrap();

        let outcome = dispatcher.rollback_ticket(TicketId(1)).await.unwrap();
        assert_eq!(outcome.reverted.len(), 1);
        let ticket = dispatcher.store().get(TicketId(1)).unwrap();
        assert_eq!(ticket.status, TicketStatus::Pending);
        assert_eq!(ticket.attempt, 1);
        assert!(ticket.completed_at.is_none());
    }
}
