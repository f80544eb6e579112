//! Durable ticket store with state machine enforcement
//!
//! Tickets are stored one JSON record per file under `.foreman/tickets/`,
//! with an aggregate index (`index.json`) holding per-status counts. The
//! store is the single writer for both: every mutation goes through
//! `&mut self`, so concurrent completion events must be serialized by the
//! owning coordinator before they reach this type.

use crate::graph;
use chrono::Utc;
use foreman_core::{ForemanError, Priority, Result, Ticket, TicketId, TicketStatus, FOREMAN_DIR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Aggregate index over ticket records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TicketIndex {
    pub next_id: u32,
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub last_updated: Option<chrono::DateTime<Utc>>,
}

/// A record that could not be read during an index rebuild
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordError {
    pub path: String,
    pub detail: String,
}

/// Outcome of rebuilding the aggregate index from individual records
#[derive(Debug, Clone, Default)]
pub struct RebuildReport {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    /// Unreadable or corrupt records, reported rather than dropped
    pub errors: Vec<RecordError>,
}

/// Fields for a new ticket; identity and timestamps are assigned by the store
#[derive(Debug, Clone, Default)]
pub struct NewTicket {
    pub title: String,
    pub description: String,
    pub priority: Priority,
    pub worker: Option<String>,
    pub dependencies: Vec<TicketId>,
    pub files: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    pub remediation_of: Option<TicketId>,
}

/// Durable ticket store
pub struct TicketStore {
    tickets_dir: PathBuf,
    index_path: PathBuf,
    tickets: BTreeMap<TicketId, Ticket>,
    next_id: u32,
}

impl TicketStore {
    /// Initialize store layout under `<repo_root>/.foreman/` and open it
    pub fn init(repo_root: &Path) -> Result<Self> {
        let tickets_dir = repo_root.join(FOREMAN_DIR).join("tickets");
        std::fs::create_dir_all(&tickets_dir)?;
        let mut store = Self {
            index_path: tickets_dir.join("index.json"),
            tickets_dir,
            tickets: BTreeMap::new(),
            next_id: 1,
        };
        store.persist_index()?;
        Ok(store)
    }

    /// Open an existing store, loading every readable ticket record
    ///
    /// A record that cannot be read or parsed is skipped with a warning and
    /// left on disk; `rebuild_index` reports it as a distinct error entry.
    pub fn open(repo_root: &Path) -> Result<Self> {
        let tickets_dir = repo_root.join(FOREMAN_DIR).join("tickets");
        let index_path = tickets_dir.join("index.json");
        if !tickets_dir.is_dir() {
            return Err(ForemanError::Config(format!(
                "{} not found; run init first",
                tickets_dir.display()
            )));
        }

        let index: TicketIndex = match std::fs::read_to_string(&index_path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(_) => TicketIndex {
                next_id: 1,
                ..Default::default()
            },
        };

        let mut tickets = BTreeMap::new();
        let mut max_id = 0;
        for entry in std::fs::read_dir(&tickets_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("TICKET-") || !name.ends_with(".json") {
                continue;
            }
            let parsed = std::fs::read_to_string(entry.path())
                .map_err(|e| e.to_string())
                .and_then(|content| {
                    serde_json::from_str::<Ticket>(&content).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(ticket) => {
                    max_id = max_id.max(ticket.id.0);
                    tickets.insert(ticket.id, ticket);
                }
                Err(detail) => {
                    warn!(
                        "skipping corrupt record {}: {}",
                        entry.path().display(),
                        detail
                    );
                }
            }
        }

        Ok(Self {
            tickets_dir,
            index_path,
            tickets,
            next_id: index.next_id.max(max_id + 1),
        })
    }

    /// Create a ticket, assigning the next monotonic id
    ///
    /// Rejected atomically (nothing persisted) when a declared dependency is
    /// unknown or would close a dependency cycle; the cycle error carries the
    /// full ordered path.
    pub fn create(&mut self, new: NewTicket) -> Result<Ticket> {
        let id = TicketId(self.next_id);

        for dep in &new.dependencies {
            if !self.tickets.contains_key(dep) {
                return Err(ForemanError::UnknownDependency {
                    ticket: id,
                    dependency: *dep,
                });
            }
        }

        if let Some(path) = graph::find_cycle(id, &new.dependencies, &self.tickets) {
            return Err(ForemanError::CycleDetected { path });
        }

        let ticket = Ticket::new(id, new.title, new.description)
            .with_priority(new.priority)
            .with_dependencies(new.dependencies)
            .with_files(new.files)
            .with_criteria(new.acceptance_criteria);
        let mut ticket = ticket;
        ticket.worker = new.worker;
        ticket.remediation_of = new.remediation_of;

        self.next_id += 1;
        self.persist_ticket(&ticket)?;
        self.tickets.insert(id, ticket.clone());
        self.persist_index()?;

        info!("created {} ({})", id, ticket.title);
        Ok(ticket)
    }

    /// Fetch a ticket by id
    pub fn get(&self, id: TicketId) -> Result<&Ticket> {
        self.tickets.get(&id).ok_or(ForemanError::TicketNotFound(id))
    }

    /// All tickets in id order
    pub fn all(&self) -> Vec<&Ticket> {
        self.tickets.values().collect()
    }

    /// Tickets currently in the given status
    pub fn with_status(&self, status: TicketStatus) -> Vec<&Ticket> {
        self.tickets.values().filter(|t| t.status == status).collect()
    }

    /// Whether every ticket is in a terminal status
    pub fn all_terminal(&self) -> bool {
        self.tickets.values().all(|t| t.status.is_terminal())
    }

    /// Transition a ticket, enforcing the state machine table
    pub fn transition(&mut self, id: TicketId, to: TicketStatus) -> Result<Ticket> {
        let ticket = self
            .tickets
            .get_mut(&id)
            .ok_or(ForemanError::TicketNotFound(id))?;

        if !ticket.status.can_transition_to(to) {
            return Err(ForemanError::InvalidTransition {
                ticket: id,
                from: ticket.status,
                to,
            });
        }

        debug!("{}: {} -> {}", id, ticket.status, to);
        ticket.status = to;
        ticket.updated_at = Utc::now();
        match to {
            TicketStatus::InProgress => {
                if ticket.started_at.is_none() {
                    ticket.started_at = Some(Utc::now());
                }
            }
            TicketStatus::Completed => {
                ticket.completed_at = Some(Utc::now());
            }
            _ => {
                // completed_at is set iff the ticket is completed
                ticket.completed_at = None;
            }
        }

        let snapshot = ticket.clone();
        self.persist_ticket(&snapshot)?;
        self.persist_index()?;
        Ok(snapshot)
    }

    /// Re-queue a failed ticket with failure context attached
    pub fn requeue(&mut self, id: TicketId, context: impl Into<String>) -> Result<Ticket> {
        {
            let ticket = self
                .tickets
                .get_mut(&id)
                .ok_or(ForemanError::TicketNotFound(id))?;
            if ticket.status != TicketStatus::Failed {
                return Err(ForemanError::InvalidTransition {
                    ticket: id,
                    from: ticket.status,
                    to: TicketStatus::Pending,
                });
            }
            ticket.attempt += 1;
            ticket.notes.push(context.into());
        }
        self.transition(id, TicketStatus::Pending)
    }

    /// Reset a ticket after its checkpoints were rolled back
    ///
    /// This is the one path that bypasses the transition table: rollback
    /// re-opens work whose prior completion was undone in the workspace.
    pub fn reset_after_rollback(&mut self, id: TicketId, note: impl Into<String>) -> Result<Ticket> {
        let ticket = self
            .tickets
            .get_mut(&id)
            .ok_or(ForemanError::TicketNotFound(id))?;

        ticket.status = TicketStatus::Pending;
        ticket.attempt += 1;
        ticket.completed_at = None;
        ticket.checkpoint = None;
        ticket.notes.push(note.into());
        ticket.updated_at = Utc::now();

        let snapshot = ticket.clone();
        self.persist_ticket(&snapshot)?;
        self.persist_index()?;
        Ok(snapshot)
    }

    /// Assign a worker to a ticket
    pub fn assign(&mut self, id: TicketId, worker: impl Into<String>) -> Result<Ticket> {
        let ticket = self
            .tickets
            .get_mut(&id)
            .ok_or(ForemanError::TicketNotFound(id))?;
        ticket.worker = Some(worker.into());
        ticket.updated_at = Utc::now();
        let snapshot = ticket.clone();
        self.persist_ticket(&snapshot)?;
        Ok(snapshot)
    }

    /// Attach a note to a ticket
    pub fn add_note(&mut self, id: TicketId, note: impl Into<String>) -> Result<()> {
        let ticket = self
            .tickets
            .get_mut(&id)
            .ok_or(ForemanError::TicketNotFound(id))?;
        ticket.notes.push(note.into());
        ticket.updated_at = Utc::now();
        let snapshot = ticket.clone();
        self.persist_ticket(&snapshot)
    }

    /// Record the checkpoint created for a ticket's work
    pub fn set_checkpoint(&mut self, id: TicketId, checkpoint: impl Into<String>) -> Result<()> {
        let ticket = self
            .tickets
            .get_mut(&id)
            .ok_or(ForemanError::TicketNotFound(id))?;
        ticket.checkpoint = Some(checkpoint.into());
        ticket.updated_at = Utc::now();
        let snapshot = ticket.clone();
        self.persist_ticket(&snapshot)
    }

    /// Highest-priority ready pending ticket, optionally filtered by worker
    pub fn next_ticket(&self, worker: Option<&str>) -> Option<&Ticket> {
        let mut candidates: Vec<&Ticket> = self
            .tickets
            .values()
            .filter(|t| t.status == TicketStatus::Pending)
            .filter(|t| graph::blocked_by(t, &self.tickets).is_empty())
            .filter(|t| match worker {
                Some(w) => t.worker.as_deref() == Some(w),
                None => true,
            })
            .collect();
        candidates.sort_by_key(|t| (t.priority, t.id));
        candidates.first().copied()
    }

    /// Current aggregate counts from the in-memory records
    pub fn counts_by_status(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for ticket in self.tickets.values() {
            *counts.entry(ticket.status.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Rebuild the in-memory map and the aggregate index from the on-disk
    /// records
    ///
    /// The records are the source of truth: the re-read tickets replace the
    /// in-memory map and the persisted index is recounted from them. An
    /// unreadable or corrupt record becomes a distinct error entry in the
    /// report; the rebuild neither drops it silently nor aborts.
    pub fn rebuild_index(&mut self) -> Result<RebuildReport> {
        let mut report = RebuildReport::default();
        let mut rebuilt = BTreeMap::new();

        for entry in std::fs::read_dir(&self.tickets_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("TICKET-") || !name.ends_with(".json") {
                continue;
            }
            match std::fs::read_to_string(entry.path()) {
                Ok(content) => match serde_json::from_str::<Ticket>(&content) {
                    Ok(ticket) => {
                        report.total += 1;
                        *report
                            .by_status
                            .entry(ticket.status.to_string())
                            .or_insert(0) += 1;
                        rebuilt.insert(ticket.id, ticket);
                    }
                    Err(e) => report.errors.push(RecordError {
                        path: entry.path().display().to_string(),
                        detail: e.to_string(),
                    }),
                },
                Err(e) => report.errors.push(RecordError {
                    path: entry.path().display().to_string(),
                    detail: e.to_string(),
                }),
            }
        }

        self.tickets = rebuilt;
        let max_id = self.tickets.keys().map(|id| id.0).max().unwrap_or(0);
        self.next_id = self.next_id.max(max_id + 1);
        self.persist_index()?;
        Ok(report)
    }

    /// Borrow the full ticket map (read-only), for graph queries
    pub fn tickets(&self) -> &BTreeMap<TicketId, Ticket> {
        &self.tickets
    }

    /// Id the next created ticket will receive (for batch validation)
    pub fn peek_next_id(&self) -> u32 {
        self.next_id
    }

    fn persist_ticket(&self, ticket: &Ticket) -> Result<()> {
        let path = self.tickets_dir.join(format!("{}.json", ticket.id));
        let content = serde_json::to_string_pretty(ticket)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn persist_index(&mut self) -> Result<()> {
        let index = TicketIndex {
            next_id: self.next_id,
            total: self.tickets.len(),
            by_status: self.counts_by_status(),
            last_updated: Some(Utc::now()),
        };
        let content = serde_json::to_string_pretty(&index)?;
        std::fs::write(&self.index_path, content)?;
        Ok(())
    }
}
