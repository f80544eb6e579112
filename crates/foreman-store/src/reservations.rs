//! Exclusive file reservations
//!
//! Grants a ticket exclusive write ownership over a set of paths. Grants are
//! all-or-nothing: either every requested path is free, or nothing is
//! reserved and the caller gets every conflicting path with its owner.
//!
//! Conflict policy between tickets with no dependency relation is
//! first-come-first-served: the second requester is rejected, never queued
//! silently. (The upstream-wins rule only arises through wave ordering,
//! where upstream tickets are dispatched in earlier waves. Flagged for
//! product clarification.)

use chrono::{Duration, Utc};
use foreman_core::{ForemanError, ReservationInfo, Result, TicketId, TicketStatus, FOREMAN_DIR};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ReservationFile {
    reservations: BTreeMap<String, ReservationInfo>,
}

/// Durable reservation table, keyed by file path
pub struct ReservationLedger {
    path: PathBuf,
    reservations: BTreeMap<String, ReservationInfo>,
}

impl ReservationLedger {
    /// Open the ledger, creating an empty one when absent
    pub fn open(repo_root: &Path) -> Result<Self> {
        let dir = repo_root.join(FOREMAN_DIR);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("reservations.json");

        let reservations = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            let file: ReservationFile = serde_json::from_str(&content)?;
            file.reservations
        } else {
            BTreeMap::new()
        };

        Ok(Self { path, reservations })
    }

    /// Reserve every path for a ticket, or nothing
    ///
    /// Paths already held by the same ticket are refreshed, not conflicts.
    pub fn reserve(
        &mut self,
        ticket: TicketId,
        worker: &str,
        files: &[String],
    ) -> Result<Vec<String>> {
        let conflicts: Vec<ReservationInfo> = files
            .iter()
            .filter_map(|f| self.reservations.get(f))
            .filter(|r| r.ticket != ticket)
            .cloned()
            .collect();

        if !conflicts.is_empty() {
            return Err(ForemanError::ReservationConflict { conflicts });
        }

        let now = Utc::now();
        for file in files {
            self.reservations.insert(
                file.clone(),
                ReservationInfo {
                    path: file.clone(),
                    ticket,
                    worker: worker.to_string(),
                    reserved_at: now,
                },
            );
        }
        self.persist()?;
        debug!("{} reserved {} path(s)", ticket, files.len());
        Ok(files.to_vec())
    }

    /// Release every reservation owned by a ticket; a no-op when it holds none
    pub fn release(&mut self, ticket: TicketId) -> Result<Vec<String>> {
        let released: Vec<String> = self
            .reservations
            .iter()
            .filter(|(_, r)| r.ticket == ticket)
            .map(|(path, _)| path.clone())
            .collect();

        for path in &released {
            self.reservations.remove(path);
        }
        if !released.is_empty() {
            self.persist()?;
            debug!("{} released {} path(s)", ticket, released.len());
        }
        Ok(released)
    }

    /// Current owner of a path, if reserved
    pub fn owner_of(&self, path: &str) -> Option<&ReservationInfo> {
        self.reservations.get(path)
    }

    /// All active reservations
    pub fn active(&self) -> Vec<ReservationInfo> {
        self.reservations.values().cloned().collect()
    }

    /// Paths held by a given ticket
    pub fn held_by(&self, ticket: TicketId) -> Vec<String> {
        self.reservations
            .iter()
            .filter(|(_, r)| r.ticket == ticket)
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Force-release reservations older than `max_age` whose owning ticket is
    /// not in progress
    ///
    /// Each reclaim is logged with the path and prior owner; the reclaimed
    /// reservations are returned so the caller can record them to the event
    /// log. Reclaiming is not an error for anyone.
    pub fn sweep_stale<F>(&mut self, max_age: Duration, status_of: F) -> Result<Vec<ReservationInfo>>
    where
        F: Fn(TicketId) -> Option<TicketStatus>,
    {
        let cutoff = Utc::now() - max_age;
        let stale: Vec<ReservationInfo> = self
            .reservations
            .values()
            .filter(|r| r.reserved_at < cutoff)
            .filter(|r| status_of(r.ticket) != Some(TicketStatus::InProgress))
            .cloned()
            .collect();

        for r in &stale {
            self.reservations.remove(&r.path);
            warn!(
                "reclaimed stale reservation on {} (was held by {} / {}, since {})",
                r.path, r.ticket, r.worker, r.reserved_at
            );
        }
        if !stale.is_empty() {
            self.persist()?;
        }
        Ok(stale)
    }

    fn persist(&self) -> Result<()> {
        let file = ReservationFile {
            reservations: self.reservations.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}
