//! Git command execution abstraction

use async_trait::async_trait;
use foreman_core::{ForemanError, Result};
use std::path::PathBuf;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Output from a git command
#[derive(Debug, Clone)]
pub struct VcsOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
}

impl VcsOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: &str) -> Self {
        Self {
            stdout: stdout.to_string(),
            stderr: String::new(),
            success: true,
        }
    }

    /// Failed output with the given stderr
    pub fn err(stderr: &str) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.to_string(),
            success: false,
        }
    }
}

impl From<Output> for VcsOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            success: output.status.success(),
        }
    }
}

/// Trait for executing git commands (allows mocking in tests)
#[async_trait]
pub trait VcsExecutor: Send + Sync {
    /// Execute a git command with the given arguments
    async fn exec(&self, args: &[&str]) -> Result<VcsOutput>;

    /// Get the repository root
    fn repo_root(&self) -> &PathBuf;
}

/// Real git command executor
#[derive(Clone)]
pub struct GitCommand {
    repo_root: PathBuf,
}

impl GitCommand {
    /// Create a new git command executor for the given repository
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }

    /// Auto-detect repository root from current directory
    pub async fn detect() -> Result<Self> {
        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .output()
            .await
            .map_err(|e| ForemanError::Vcs(format!("Failed to run git rev-parse: {}", e)))?;

        if !output.status.success() {
            return Err(ForemanError::Vcs("Not in a git repository".to_string()));
        }

        let root = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Self::new(root))
    }
}

#[async_trait]
impl VcsExecutor for GitCommand {
    #[instrument(skip(self), fields(repo = %self.repo_root.display()))]
    async fn exec(&self, args: &[&str]) -> Result<VcsOutput> {
        debug!("Executing git {:?}", args);

        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_root)
            .output()
            .await
            .map_err(|e| ForemanError::Vcs(format!("Failed to execute git: {}", e)))?;

        let vcs_output = VcsOutput::from(output);

        if !vcs_output.success {
            debug!("git command failed: {}", vcs_output.stderr);
        }

        Ok(vcs_output)
    }

    fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }
}

/// Mock git executor for testing
///
/// Canned outputs are keyed by the full argument line (`"tag ckpt-1 abc123"`);
/// a command with no canned output is an error, so tests fail loudly on any
/// git invocation they did not anticipate.
#[derive(Clone)]
pub struct MockVcsExecutor {
    repo_root: PathBuf,
    canned: std::collections::HashMap<String, VcsOutput>,
}

impl Default for MockVcsExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVcsExecutor {
    pub fn new() -> Self {
        Self {
            repo_root: PathBuf::from("/mock/repo"),
            canned: std::collections::HashMap::new(),
        }
    }

    pub fn with_response(mut self, command: &str, output: VcsOutput) -> Self {
        self.canned.insert(command.to_string(), output);
        self
    }

    /// Canned success for a command, with the given stdout
    pub fn with_ok(self, command: &str, stdout: &str) -> Self {
        self.with_response(command, VcsOutput::ok(stdout))
    }

    /// Canned failure for a command, with the given stderr
    pub fn with_err(self, command: &str, stderr: &str) -> Self {
        self.with_response(command, VcsOutput::err(stderr))
    }

    /// Point the mock at a real directory so callers can persist state under it
    pub fn with_repo_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.repo_root = root.into();
        self
    }
}

#[async_trait]
impl VcsExecutor for MockVcsExecutor {
    async fn exec(&self, args: &[&str]) -> Result<VcsOutput> {
        let key = args.join(" ");
        self.canned
            .get(&key)
            .cloned()
            .ok_or_else(|| ForemanError::Vcs(format!("No canned output for: git {}", key)))
    }

    fn repo_root(&self) -> &PathBuf {
        &self.repo_root
    }
}
