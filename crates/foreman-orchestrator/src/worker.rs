//! Worker execution boundary
//!
//! Workers are opaque: the orchestrator hands over a ticket and its reserved
//! files and gets back a raw result document. The contract is enforced here:
//! the document must deserialize into [`WorkerResult`] with a recognized
//! status, or the ticket fails. Worker reasoning and content never enter
//! this crate.

use async_trait::async_trait;
use foreman_core::{ForemanError, Result, Ticket, TicketId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Status a worker reports for its ticket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Completed,
    Failed,
    Blocked,
}

/// Schema-validated result document from a worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerResult {
    pub status: WorkerStatus,
    #[serde(default)]
    pub files_modified: Vec<String>,
    #[serde(default)]
    pub files_created: Vec<String>,
    pub report: String,
}

impl WorkerResult {
    /// Parse a raw worker response, enforcing the result contract
    ///
    /// Empty responses and documents that do not match the schema are
    /// distinct errors; both mean the ticket fails with nothing committed.
    pub fn parse(ticket: TicketId, raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Err(ForemanError::WorkerEmptyResult { ticket });
        }
        serde_json::from_str(raw).map_err(|e| ForemanError::WorkerMalformedResult {
            ticket,
            detail: e.to_string(),
        })
    }

    /// Every path the worker claims to have touched
    pub fn touched(&self) -> Vec<String> {
        let mut paths = self.files_modified.clone();
        for created in &self.files_created {
            if !paths.contains(created) {
                paths.push(created.clone());
            }
        }
        paths
    }
}

/// Trait for executing workers (allows mocking in tests)
#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    /// Run a worker on a ticket; returns the raw result document
    async fn execute(&self, ticket: &Ticket, reserved_files: &[String]) -> Result<String>;
}

/// Mock worker for testing
#[derive(Default)]
pub struct MockWorker {
    responses: HashMap<TicketId, String>,
    delay_ms: u64,
}

impl MockWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(mut self, ticket: TicketId, raw: &str) -> Self {
        self.responses.insert(ticket, raw.to_string());
        self
    }

    /// Convenience: a well-formed completed result touching `files`
    pub fn with_completion(self, ticket: TicketId, files: &[&str]) -> Self {
        let result = WorkerResult {
            status: WorkerStatus::Completed,
            files_modified: files.iter().map(|s| s.to_string()).collect(),
            files_created: Vec::new(),
            report: format!("{} done", ticket),
        };
        let raw = serde_json::to_string(&result).unwrap_or_default();
        self.with_response(ticket, &raw)
    }

    /// Sleep before answering, to exercise timeout handling
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }
}

#[async_trait]
impl WorkerExecutor for MockWorker {
    async fn execute(&self, ticket: &Ticket, _reserved_files: &[String]) -> Result<String> {
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        self.responses
            .get(&ticket.id)
            .cloned()
            .ok_or_else(|| ForemanError::Other(format!("no mock response for {}", ticket.id)))
    }
}
