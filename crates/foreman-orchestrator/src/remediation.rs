//! Remediation cycle controller
//!
//! Failed session gates feed structured findings in here. Within the budget
//! (default 3 cycles) each round of findings becomes remediation tickets
//! with priority elevated by severity and a back-reference to the ticket
//! being remediated. A round that would exceed the budget instead produces
//! an escalation report for the operator; automatic work stops there.

use foreman_core::{Finding, Severity, TicketId};
use foreman_store::NewTicket;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What happened in one remediation cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle: u32,
    pub findings: Vec<Finding>,
    /// Remediation tickets created for this cycle
    pub tickets: Vec<TicketId>,
}

/// Handed to the operator when the budget is exhausted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationReport {
    pub cycles_run: u32,
    pub max_cycles: u32,
    /// Findings still outstanding after the final cycle
    pub outstanding: Vec<Finding>,
    pub history: Vec<CycleRecord>,
    pub recommended_action: String,
}

impl EscalationReport {
    /// Human-readable summary: what was tried, how many times, what next
    pub fn render(&self) -> String {
        let mut out = format!(
            "Remediation budget exhausted: {} of {} cycles run.\n",
            self.cycles_run, self.max_cycles
        );
        for record in &self.history {
            out.push_str(&format!(
                "  cycle {}: {} finding(s), {} remediation ticket(s)\n",
                record.cycle,
                record.findings.len(),
                record.tickets.len()
            ));
        }
        out.push_str(&format!("Outstanding findings ({}):\n", self.outstanding.len()));
        for finding in &self.outstanding {
            out.push_str(&format!(
                "  [{}] {}: {}\n",
                finding.severity, finding.gate, finding.message
            ));
        }
        out.push_str(&format!("Recommended action: {}", self.recommended_action));
        out
    }
}

/// Controller decision for a round of gate failures
#[derive(Debug)]
pub enum RemediationDecision {
    /// Create these tickets and run another cycle
    Remediate(Vec<NewTicket>),
    /// Budget exhausted; stop and surface the report
    Escalate(EscalationReport),
}

/// Bounded remediation cycle controller
pub struct RemediationController {
    max_cycles: u32,
    history: Vec<CycleRecord>,
}

impl RemediationController {
    pub fn new(max_cycles: u32) -> Self {
        Self {
            max_cycles,
            history: Vec::new(),
        }
    }

    /// Cycles recorded so far
    pub fn cycles_run(&self) -> u32 {
        self.history.len() as u32
    }

    pub fn history(&self) -> &[CycleRecord] {
        &self.history
    }

    /// Decide what to do with a round of findings
    ///
    /// `completed_cycles` is the session's persisted cycle counter. Exceeding
    /// the budget never starts another automatic cycle. `origin_of` maps each
    /// finding back to the ticket whose work it implicates, recorded on the
    /// remediation ticket as `remediation_of`.
    pub fn decide<F>(
        &self,
        completed_cycles: u32,
        findings: &[Finding],
        origin_of: F,
    ) -> RemediationDecision
    where
        F: Fn(&Finding) -> Option<TicketId>,
    {
        if findings.is_empty() {
            return RemediationDecision::Remediate(Vec::new());
        }

        if completed_cycles >= self.max_cycles {
            warn!(
                "remediation budget exhausted ({} cycles), escalating with {} finding(s)",
                completed_cycles,
                findings.len()
            );
            return RemediationDecision::Escalate(self.escalation_report(findings));
        }

        let tickets = findings
            .iter()
            .map(|f| remediation_ticket(f, origin_of(f)))
            .collect::<Vec<_>>();
        info!(
            "cycle {}: creating {} remediation ticket(s)",
            completed_cycles + 1,
            tickets.len()
        );
        RemediationDecision::Remediate(tickets)
    }

    /// Record a completed cycle after its tickets were created
    pub fn record_cycle(&mut self, cycle: u32, findings: Vec<Finding>, tickets: Vec<TicketId>) {
        self.history.push(CycleRecord {
            cycle,
            findings,
            tickets,
        });
    }

    fn escalation_report(&self, outstanding: &[Finding]) -> EscalationReport {
        let critical = outstanding
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .count();
        let recommended_action = if critical > 0 {
            format!(
                "resolve the {} critical finding(s) manually, then retry or skip the affected tickets",
                critical
            )
        } else {
            "review the outstanding findings, then override the gates or grant a fresh run"
                .to_string()
        };

        EscalationReport {
            cycles_run: self.cycles_run(),
            max_cycles: self.max_cycles,
            outstanding: outstanding.to_vec(),
            history: self.history.clone(),
            recommended_action,
        }
    }
}

/// Build the remediation ticket for one finding
fn remediation_ticket(finding: &Finding, origin: Option<TicketId>) -> NewTicket {
    let mut description = format!("[{}] {}: {}", finding.severity, finding.gate, finding.message);
    if let Some(suggestion) = &finding.suggestion {
        description.push_str(&format!("\nSuggestion: {}", suggestion));
    }

    NewTicket {
        title: format!("remediate {}: {}", finding.gate, finding.message),
        description,
        priority: finding.severity.remediation_priority(),
        worker: None,
        dependencies: Vec::new(),
        files: finding.file.iter().cloned().collect(),
        acceptance_criteria: vec![format!("gate {} passes", finding.gate)],
        remediation_of: origin,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::Priority;

    fn finding(severity: Severity) -> Finding {
        Finding {
            gate: "tests".to_string(),
            severity,
            message: "assertion failed in parser".to_string(),
            file: Some("src/parser.rs".to_string()),
            suggestion: Some("handle empty input".to_string()),
        }
    }

    #[test]
    fn test_no_findings_no_tickets() {
        let controller = RemediationController::new(3);
        match controller.decide(0, &[], |_| None) {
            RemediationDecision::Remediate(tickets) => assert!(tickets.is_empty()),
            RemediationDecision::Escalate(_) => panic!("should not escalate"),
        }
    }

    #[test]
    fn test_critical_finding_elevates_priority() {
        let controller = RemediationController::new(3);
        match controller.decide(0, &[finding(Severity::Critical)], |_| Some(TicketId(4))) {
            RemediationDecision::Remediate(tickets) => {
                assert_eq!(tickets.len(), 1);
                assert_eq!(tickets[0].priority, Priority::Critical);
                assert_eq!(tickets[0].remediation_of, Some(TicketId(4)));
                assert_eq!(tickets[0].files, vec!["src/parser.rs"]);
                assert!(tickets[0].description.contains("handle empty input"));
            }
            RemediationDecision::Escalate(_) => panic!("should not escalate"),
        }
    }

    #[test]
    fn test_low_finding_gets_medium_priority() {
        let controller = RemediationController::new(3);
        match controller.decide(0, &[finding(Severity::Low)], |_| None) {
            RemediationDecision::Remediate(tickets) => {
                assert_eq!(tickets[0].priority, Priority::Medium);
            }
            RemediationDecision::Escalate(_) => panic!("should not escalate"),
        }
    }

    #[test]
    fn test_budget_exhaustion_escalates_with_history() {
        let mut controller = RemediationController::new(3);
        for cycle in 1..=3 {
            controller.record_cycle(cycle, vec![finding(Severity::High)], vec![TicketId(cycle)]);
        }

        match controller.decide(3, &[finding(Severity::Critical)], |_| None) {
            RemediationDecision::Escalate(report) => {
                assert_eq!(report.cycles_run, 3);
                assert_eq!(report.history.len(), 3);
                assert_eq!(report.outstanding.len(), 1);
                assert!(report.recommended_action.contains("critical"));
                let rendered = report.render();
                assert!(rendered.contains("3 of 3 cycles"));
                assert!(rendered.contains("assertion failed"));
            }
            RemediationDecision::Remediate(_) => panic!("should escalate"),
        }
    }

    #[test]
    fn test_last_budgeted_cycle_still_remediates() {
        let mut controller = RemediationController::new(3);
        controller.record_cycle(1, vec![finding(Severity::High)], vec![TicketId(1)]);
        controller.record_cycle(2, vec![finding(Severity::High)], vec![TicketId(2)]);

        match controller.decide(2, &[finding(Severity::High)], |_| None) {
            RemediationDecision::Remediate(tickets) => assert_eq!(tickets.len(), 1),
            RemediationDecision::Escalate(_) => panic!("cycle 3 is within the budget"),
        }
    }
}
