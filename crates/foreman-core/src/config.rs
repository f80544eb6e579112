//! Configuration management for foreman
//!
//! Repository-level settings loaded from `.foreman/config.toml`: reservation
//! staleness, remediation budget, worker timeouts, and wave sizing.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::Result;

/// Directory holding all foreman state inside a repository
pub const FOREMAN_DIR: &str = ".foreman";

/// Repository-level foreman configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForemanConfig {
    /// Reservations older than this whose ticket is not in_progress are reclaimed
    #[serde(default = "default_stale_reservation_minutes")]
    pub stale_reservation_minutes: i64,

    /// Maximum automatic remediation cycles before escalation
    #[serde(default = "default_max_remediation_cycles")]
    pub max_remediation_cycles: u32,

    /// Per-ticket worker execution deadline in seconds
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,

    /// Maximum tickets dispatched in a single wave
    #[serde(default = "default_max_wave_size")]
    pub max_wave_size: usize,

    /// Automatic dispatch attempts per ticket before it stays failed
    #[serde(default = "default_max_ticket_attempts")]
    pub max_ticket_attempts: u32,

    /// Paths workers may never reserve or modify
    #[serde(default = "default_protected_paths")]
    pub protected_paths: Vec<String>,
}

fn default_max_ticket_attempts() -> u32 {
    2
}

fn default_stale_reservation_minutes() -> i64 {
    30
}

fn default_max_remediation_cycles() -> u32 {
    3
}

fn default_worker_timeout_secs() -> u64 {
    600
}

fn default_max_wave_size() -> usize {
    4
}

fn default_protected_paths() -> Vec<String> {
    vec![
        ".git".to_string(),
        ".foreman".to_string(),
        ".env".to_string(),
        ".secrets".to_string(),
    ]
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            stale_reservation_minutes: default_stale_reservation_minutes(),
            max_remediation_cycles: default_max_remediation_cycles(),
            worker_timeout_secs: default_worker_timeout_secs(),
            max_wave_size: default_max_wave_size(),
            max_ticket_attempts: default_max_ticket_attempts(),
            protected_paths: default_protected_paths(),
        }
    }
}

impl ForemanConfig {
    /// Load configuration from `.foreman/config.toml` or use defaults
    pub fn load_or_default(repo_root: &Path) -> Result<Self> {
        let config_path = repo_root.join(FOREMAN_DIR).join("config.toml");

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Ok(toml::from_str(&content).map_err(|e| {
                crate::ForemanError::Config(format!("failed to parse config file: {}", e))
            })?)
        } else {
            Ok(Self::default())
        }
    }

    /// Write default configuration to `.foreman/config.toml`
    pub fn write_default(repo_root: &Path) -> Result<()> {
        let config_dir = repo_root.join(FOREMAN_DIR);
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        let config = Self::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| crate::ForemanError::Config(format!("failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Check whether a path falls under any protected prefix
    pub fn is_protected(&self, path: &str) -> bool {
        self.protected_paths
            .iter()
            .any(|p| path == p || path.starts_with(&format!("{}/", p)))
    }
}
