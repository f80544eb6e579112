//! Session state: phase and remediation cycle counter

use chrono::{DateTime, Utc};
use foreman_core::{Result, SessionPhase, FOREMAN_DIR};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Durable per-session state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// Completed remediation cycles in the current gate run
    pub remediation_cycle: u32,
    pub updated_at: DateTime<Utc>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::default(),
            remediation_cycle: 0,
            updated_at: Utc::now(),
        }
    }
}

/// Handle to the persisted session record
pub struct SessionStore {
    path: PathBuf,
    pub state: SessionState,
}

impl SessionStore {
    /// Open the session record, starting fresh when absent
    pub fn open(repo_root: &Path) -> Result<Self> {
        let dir = repo_root.join(FOREMAN_DIR);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("session.json");

        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            SessionState::default()
        };

        Ok(Self { path, state })
    }

    /// Update the phase and persist
    pub fn set_phase(&mut self, phase: SessionPhase) -> Result<()> {
        self.state.phase = phase;
        self.persist()
    }

    /// Record a completed remediation cycle
    pub fn set_cycle(&mut self, cycle: u32) -> Result<()> {
        self.state.remediation_cycle = cycle;
        self.persist()
    }

    fn persist(&mut self) -> Result<()> {
        self.state.updated_at = Utc::now();
        let content = serde_json::to_string_pretty(&self.state)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_session_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let session = SessionStore::open(dir.path()).unwrap();
        assert_eq!(session.state.phase, SessionPhase::Planning);
        assert_eq!(session.state.remediation_cycle, 0);
    }

    #[test]
    fn test_phase_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut session = SessionStore::open(dir.path()).unwrap();
            session.set_phase(SessionPhase::Escalated).unwrap();
            session.set_cycle(3).unwrap();
        }
        let session = SessionStore::open(dir.path()).unwrap();
        assert_eq!(session.state.phase, SessionPhase::Escalated);
        assert_eq!(session.state.remediation_cycle, 3);
    }
}
