//! Quality gate boundary and pass records
//!
//! Gates are named checks run either against one ticket's work (at review)
//! or against the whole session (when no ready tickets remain). Gate
//! execution is external; only the verdicts and findings flow through here.
//!
//! Session pass records persist across remediation cycles: a gate that
//! passed once is not re-run unless an operator explicitly invalidates it.

use async_trait::async_trait;
use foreman_core::{Finding, Result, TicketId, FOREMAN_DIR};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

/// What a gate run is scoped to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateScope {
    /// One ticket's work, checked at review
    Ticket(TicketId),
    /// The session as a whole
    Session,
}

impl std::fmt::Display for GateScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ticket(id) => write!(f, "{}", id),
            Self::Session => write!(f, "session"),
        }
    }
}

/// Verdict and findings from one gate run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: String,
    pub passed: bool,
    pub findings: Vec<Finding>,
}

impl GateResult {
    pub fn pass(gate: &str) -> Self {
        Self {
            gate: gate.to_string(),
            passed: true,
            findings: Vec::new(),
        }
    }

    pub fn fail(gate: &str, findings: Vec<Finding>) -> Self {
        Self {
            gate: gate.to_string(),
            passed: false,
            findings,
        }
    }
}

/// Trait for running quality gates (allows mocking in tests)
#[async_trait]
pub trait GateRunner: Send + Sync {
    /// Gates to run against each ticket at review
    fn ticket_gates(&self) -> Vec<String>;

    /// Gates to run against the session when no ready tickets remain
    fn session_gates(&self) -> Vec<String>;

    /// Run one gate against a scope
    async fn run(&self, gate: &str, scope: &GateScope) -> Result<GateResult>;
}

/// Durable session-scoped pass records (`.foreman/gates.json`)
pub struct GateLedger {
    path: PathBuf,
    passed: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct GateFile {
    passed: BTreeSet<String>,
}

impl GateLedger {
    pub fn open(repo_root: &Path) -> Result<Self> {
        let dir = repo_root.join(FOREMAN_DIR);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("gates.json");

        let passed = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: GateFile = serde_json::from_str(&content)?;
            file.passed
        } else {
            BTreeSet::new()
        };

        Ok(Self { path, passed })
    }

    /// Record a session gate pass; it will not re-run this session
    pub fn record_pass(&mut self, gate: &str) -> Result<()> {
        if self.passed.insert(gate.to_string()) {
            debug!("gate {} recorded as passed", gate);
            self.persist()?;
        }
        Ok(())
    }

    /// Operator override: force a passed gate to run again
    pub fn invalidate(&mut self, gate: &str) -> Result<bool> {
        let removed = self.passed.remove(gate);
        if removed {
            info!("gate {} invalidated, will re-run", gate);
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn has_passed(&self, gate: &str) -> bool {
        self.passed.contains(gate)
    }

    /// Of `gates`, those that still need to run
    pub fn pending<'a>(&self, gates: &'a [String]) -> Vec<&'a String> {
        gates.iter().filter(|g| !self.passed.contains(*g)).collect()
    }

    fn persist(&self) -> Result<()> {
        let file = GateFile {
            passed: self.passed.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

/// Mock gate runner for testing
///
/// Per-gate results are consumed front-to-back, so a gate can fail on the
/// first cycle and pass after remediation. A gate with no queued results
/// passes.
#[derive(Default)]
pub struct MockGateRunner {
    ticket_gates: Vec<String>,
    session_gates: Vec<String>,
    results: Mutex<HashMap<String, VecDeque<GateResult>>>,
}

impl MockGateRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ticket_gate(mut self, gate: &str) -> Self {
        self.ticket_gates.push(gate.to_string());
        self
    }

    pub fn with_session_gate(mut self, gate: &str) -> Self {
        self.session_gates.push(gate.to_string());
        self
    }

    pub fn with_result(self, gate: &str, result: GateResult) -> Self {
        if let Ok(mut results) = self.results.lock() {
            results.entry(gate.to_string()).or_default().push_back(result);
        }
        self
    }
}

#[async_trait]
impl GateRunner for MockGateRunner {
    fn ticket_gates(&self) -> Vec<String> {
        self.ticket_gates.clone()
    }

    fn session_gates(&self) -> Vec<String> {
        self.session_gates.clone()
    }

    async fn run(&self, gate: &str, _scope: &GateScope) -> Result<GateResult> {
        let queued = self
            .results
            .lock()
            .ok()
            .and_then(|mut results| results.get_mut(gate).and_then(VecDeque::pop_front));
        Ok(queued.unwrap_or_else(|| GateResult::pass(gate)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::Severity;

    fn finding(gate: &str, severity: Severity) -> Finding {
        Finding {
            gate: gate.to_string(),
            severity,
            message: "issue".to_string(),
            file: None,
            suggestion: None,
        }
    }

    #[test]
    fn test_ledger_pass_records_persist() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = GateLedger::open(dir.path()).unwrap();
            ledger.record_pass("lint").unwrap();
        }
        let ledger = GateLedger::open(dir.path()).unwrap();
        assert!(ledger.has_passed("lint"));
    }

    #[test]
    fn test_only_failed_gates_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = GateLedger::open(dir.path()).unwrap();
        ledger.record_pass("lint").unwrap();

        let gates = vec!["lint".to_string(), "tests".to_string()];
        let pending = ledger.pending(&gates);
        assert_eq!(pending, vec![&"tests".to_string()]);
    }

    #[test]
    fn test_invalidate_forces_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let mut ledger = GateLedger::open(dir.path()).unwrap();
        ledger.record_pass("lint").unwrap();
        assert!(ledger.invalidate("lint").unwrap());
        assert!(!ledger.has_passed("lint"));
        assert!(!ledger.invalidate("lint").unwrap());
    }

    #[tokio::test]
    async fn test_mock_runner_consumes_results_in_order() {
        let runner = MockGateRunner::new()
            .with_session_gate("tests")
            .with_result(
                "tests",
                GateResult::fail("tests", vec![finding("tests", Severity::High)]),
            )
            .with_result("tests", GateResult::pass("tests"));

        let first = runner.run("tests", &GateScope::Session).await.unwrap();
        assert!(!first.passed);
        let second = runner.run("tests", &GateScope::Session).await.unwrap();
        assert!(second.passed);
        // Exhausted queue defaults to pass
        let third = runner.run("tests", &GateScope::Session).await.unwrap();
        assert!(third.passed);
    }
}
