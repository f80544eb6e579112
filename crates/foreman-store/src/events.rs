//! Append-only event log
//!
//! A JSONL bus (`.foreman/events.jsonl`) that every component may publish
//! to and observers consume via `read_since`. Publishing an event never
//! mutates aggregate state; that stays with the owning component.

use chrono::{DateTime, Utc};
use foreman_core::{Result, FOREMAN_DIR};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// One entry on the event log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonically increasing sequence number
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    /// Component that published the event
    pub source: String,
    /// Event kind, e.g. `ticket_completed`, `reservation_reclaimed`
    pub kind: String,
    pub payload: serde_json::Value,
}

/// Append-only JSONL event log
pub struct EventLog {
    path: PathBuf,
    next_seq: u64,
}

impl EventLog {
    /// Open the log, scanning once for the next sequence number
    pub fn open(repo_root: &Path) -> Result<Self> {
        let dir = repo_root.join(FOREMAN_DIR);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("events.jsonl");

        let next_seq = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            content
                .lines()
                .filter(|l| !l.trim().is_empty())
                .filter_map(|l| serde_json::from_str::<Event>(l).ok())
                .map(|e| e.seq)
                .max()
                .map(|s| s + 1)
                .unwrap_or(1)
        } else {
            1
        };

        Ok(Self { path, next_seq })
    }

    /// Append an event and return it
    pub fn post(
        &mut self,
        source: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<Event> {
        let event = Event {
            seq: self.next_seq,
            timestamp: Utc::now(),
            source: source.into(),
            kind: kind.into(),
            payload,
        };
        let line = serde_json::to_string(&event)?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", line)?;

        self.next_seq += 1;
        Ok(event)
    }

    /// All events, oldest first
    pub fn read_all(&self) -> Result<Vec<Event>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)?;
        Ok(content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// Events at or after a timestamp
    pub fn read_since(&self, since: DateTime<Utc>) -> Result<Vec<Event>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.timestamp >= since)
            .collect())
    }

    /// Most recent event of a given kind
    pub fn latest(&self, kind: &str) -> Result<Option<Event>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|e| e.kind == kind)
            .last())
    }
}
