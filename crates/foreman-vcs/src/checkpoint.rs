//! Checkpoint and rollback over git capabilities
//!
//! Checkpoints are ordinary commits tagged `ckpt-{seq}`; checkpoints taken
//! for a ticket carry a second tag `ticket-{id}-{seq}` so the ticket's
//! commits can be found and reverted later. Checkpoint metadata is recorded
//! in `.foreman/checkpoints.json` alongside the tags.
//!
//! Rollback rules:
//!
//! - Restoring to a checkpoint refuses on a dirty tree and never rewrites
//!   history; the restored state lands as a new commit (and new checkpoint).
//! - Reverting a ticket walks its checkpoints newest first. On a revert
//!   conflict the whole operation is aborted and the tree reset to where it
//!   started; the conflicting paths are reported to the caller.

use chrono::{DateTime, Utc};
use foreman_core::{ForemanError, Result, TicketId, FOREMAN_DIR};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

use crate::command::VcsExecutor;

/// A recorded checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Monotonically increasing sequence number
    pub seq: u64,
    /// Commit the checkpoint tag points to
    pub commit: String,
    /// Tag name, `ckpt-{seq}`
    pub tag: String,
    pub message: String,
    /// Ticket the checkpoint was taken for, if any
    pub ticket: Option<TicketId>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of reverting a ticket's work
#[derive(Debug, Clone)]
pub struct TicketRollback {
    /// Checkpoints that were reverted, newest first
    pub reverted: Vec<Checkpoint>,
    /// Checkpoint recording the post-rollback state, if anything was reverted
    pub checkpoint: Option<Checkpoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CheckpointFile {
    checkpoints: Vec<Checkpoint>,
}

/// Manager for checkpoint operations
pub struct CheckpointManager<E: VcsExecutor> {
    executor: E,
    history_path: PathBuf,
    checkpoints: Vec<Checkpoint>,
}

impl<E: VcsExecutor> CheckpointManager<E> {
    /// Create a manager, loading recorded checkpoint history
    pub fn open(executor: E) -> Result<Self> {
        let dir = executor.repo_root().join(FOREMAN_DIR);
        std::fs::create_dir_all(&dir)?;
        let history_path = dir.join("checkpoints.json");

        let checkpoints = if history_path.exists() {
            let content = std::fs::read_to_string(&history_path)?;
            let file: CheckpointFile = serde_json::from_str(&content)?;
            file.checkpoints
        } else {
            Vec::new()
        };

        Ok(Self {
            executor,
            history_path,
            checkpoints,
        })
    }

    /// All recorded checkpoints, oldest first
    pub fn history(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// The most recent checkpoint
    pub fn latest(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }

    /// Take a checkpoint of the current tree
    ///
    /// Commits everything, tags the commit `ckpt-{seq}` (plus a ticket tag
    /// when taken for a ticket) and records it. A clean tree is a no-op that
    /// returns the previous checkpoint.
    #[instrument(skip(self, message))]
    pub async fn checkpoint(
        &mut self,
        message: &str,
        ticket: Option<TicketId>,
    ) -> Result<Checkpoint> {
        if self.dirty_paths().await?.is_empty() {
            debug!("Tree is clean, reusing previous checkpoint");
            return self
                .checkpoints
                .last()
                .cloned()
                .ok_or_else(|| ForemanError::Vcs("Nothing to commit and no checkpoint recorded".to_string()));
        }

        self.exec_checked(&["add", "-A"]).await?;
        self.exec_checked(&["commit", "-m", message]).await?;
        let commit = self.head().await?;

        let seq = self.checkpoints.last().map(|c| c.seq + 1).unwrap_or(1);
        let tag = format!("ckpt-{}", seq);
        self.exec_checked(&["tag", &tag, &commit]).await?;
        if let Some(id) = ticket {
            let ticket_tag = format!("ticket-{}-{}", id, seq);
            self.exec_checked(&["tag", &ticket_tag, &commit]).await?;
        }

        let checkpoint = Checkpoint {
            seq,
            commit,
            tag: tag.clone(),
            message: message.to_string(),
            ticket,
            created_at: Utc::now(),
        };
        self.checkpoints.push(checkpoint.clone());
        self.persist()?;

        info!("Checkpoint {} recorded at {}", tag, checkpoint.commit);
        Ok(checkpoint)
    }

    /// Restore the tree to a recorded checkpoint
    ///
    /// `reference` is a checkpoint tag (`ckpt-3`) or a commit prefix. Refuses
    /// on a dirty tree; the restored state is committed and recorded as a new
    /// checkpoint, leaving history intact.
    #[instrument(skip(self))]
    pub async fn rollback_to_checkpoint(&mut self, reference: &str) -> Result<Checkpoint> {
        let target = self
            .checkpoints
            .iter()
            .find(|c| c.tag == reference || c.commit.starts_with(reference))
            .cloned()
            .ok_or_else(|| ForemanError::CheckpointNotFound(reference.to_string()))?;

        let dirty = self.dirty_paths().await?;
        if !dirty.is_empty() {
            return Err(ForemanError::DirtyWorkspace { dirty });
        }

        self.exec_checked(&["checkout", &target.commit, "--", "."])
            .await?;
        let message = format!("restore: {}", target.tag);
        self.exec_checked(&["commit", "--allow-empty", "-m", &message])
            .await?;
        let commit = self.head().await?;

        let seq = self.checkpoints.last().map(|c| c.seq + 1).unwrap_or(1);
        let tag = format!("ckpt-{}", seq);
        self.exec_checked(&["tag", &tag, &commit]).await?;

        let checkpoint = Checkpoint {
            seq,
            commit,
            tag: tag.clone(),
            message,
            ticket: None,
            created_at: Utc::now(),
        };
        self.checkpoints.push(checkpoint.clone());
        self.persist()?;

        info!("Restored {} as {}", target.tag, tag);
        Ok(checkpoint)
    }

    /// Revert every checkpoint taken for a ticket, newest first
    ///
    /// On a revert conflict the whole operation is aborted, the tree is reset
    /// to where it started, and the conflicting paths are returned in the
    /// error. A ticket with no checkpoints is a no-op.
    #[instrument(skip(self))]
    pub async fn rollback_ticket(&mut self, ticket: TicketId) -> Result<TicketRollback> {
        let mut targets: Vec<Checkpoint> = self
            .checkpoints
            .iter()
            .filter(|c| c.ticket == Some(ticket))
            .cloned()
            .collect();
        targets.reverse();

        if targets.is_empty() {
            debug!("No checkpoints recorded for {}", ticket);
            return Ok(TicketRollback {
                reverted: Vec::new(),
                checkpoint: None,
            });
        }

        let dirty = self.dirty_paths().await?;
        if !dirty.is_empty() {
            return Err(ForemanError::DirtyWorkspace { dirty });
        }

        let saved_head = self.head().await?;
        for target in &targets {
            let output = self
                .executor
                .exec(&["revert", "--no-commit", &target.commit])
                .await?;
            if !output.success {
                let files = self.conflicting_paths().await?;
                warn!(
                    "Revert of {} conflicted on {} path(s), aborting",
                    target.tag,
                    files.len()
                );
                // Best effort abort; the hard reset below restores either way
                let _ = self.executor.exec(&["revert", "--abort"]).await;
                self.exec_checked(&["reset", "--hard", &saved_head]).await?;
                return Err(ForemanError::RollbackConflict {
                    ticket,
                    other: None,
                    files,
                });
            }
        }

        let message = format!("rollback {}", ticket);
        self.exec_checked(&["commit", "-m", &message]).await?;
        let commit = self.head().await?;

        let seq = self.checkpoints.last().map(|c| c.seq + 1).unwrap_or(1);
        let tag = format!("ckpt-{}", seq);
        self.exec_checked(&["tag", &tag, &commit]).await?;

        let checkpoint = Checkpoint {
            seq,
            commit,
            tag,
            message,
            ticket: Some(ticket),
            created_at: Utc::now(),
        };
        self.checkpoints.push(checkpoint.clone());
        self.persist()?;

        info!(
            "Rolled back {} ({} checkpoint(s) reverted)",
            ticket,
            targets.len()
        );
        Ok(TicketRollback {
            reverted: targets,
            checkpoint: Some(checkpoint),
        })
    }

    /// Paths with uncommitted changes
    pub async fn dirty_paths(&self) -> Result<Vec<String>> {
        let output = self.exec_checked(&["status", "--porcelain"]).await?;
        Ok(output
            .stdout
            .lines()
            .filter(|l| l.len() > 3)
            .map(|l| l[3..].to_string())
            .collect())
    }

    async fn conflicting_paths(&self) -> Result<Vec<String>> {
        let output = self
            .exec_checked(&["diff", "--name-only", "--diff-filter=U"])
            .await?;
        Ok(output
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.to_string())
            .collect())
    }

    async fn head(&self) -> Result<String> {
        let output = self.exec_checked(&["rev-parse", "HEAD"]).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn exec_checked(&self, args: &[&str]) -> Result<crate::command::VcsOutput> {
        let output = self.executor.exec(args).await?;
        if !output.success {
            return Err(ForemanError::Vcs(format!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr
            )));
        }
        Ok(output)
    }

    fn persist(&self) -> Result<()> {
        let file = CheckpointFile {
            checkpoints: self.checkpoints.clone(),
        };
        let content = serde_json::to_string_pretty(&file)?;
        std::fs::write(&self.history_path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MockVcsExecutor;

    fn mock_in(dir: &tempfile::TempDir) -> MockVcsExecutor {
        MockVcsExecutor::new().with_repo_root(dir.path())
    }

    fn dirty_checkpoint_mock(dir: &tempfile::TempDir, message: &str, sha: &str) -> MockVcsExecutor {
        mock_in(dir)
            .with_ok("status --porcelain", " M src/a.rs\n")
            .with_ok("add -A", "")
            .with_ok(&format!("commit -m {}", message), "")
            .with_ok("rev-parse HEAD", &format!("{}\n", sha))
            .with_ok(&format!("tag ckpt-1 {}", sha), "")
    }

    #[tokio::test]
    async fn test_checkpoint_commits_and_tags() {
        let dir = tempfile::tempdir().unwrap();
        let executor = dirty_checkpoint_mock(&dir, "wave 1 complete", "abc123");
        let mut manager = CheckpointManager::open(executor).unwrap();

        let ckpt = manager.checkpoint("wave 1 complete", None).await.unwrap();
        assert_eq!(ckpt.seq, 1);
        assert_eq!(ckpt.tag, "ckpt-1");
        assert_eq!(ckpt.commit, "abc123");
        assert_eq!(manager.history().len(), 1);
    }

    #[tokio::test]
    async fn test_ticket_checkpoint_gets_second_tag() {
        let dir = tempfile::tempdir().unwrap();
        let executor = dirty_checkpoint_mock(&dir, "ticket done", "abc123")
            .with_ok("tag ticket-TICKET-007-1 abc123", "");
        let mut manager = CheckpointManager::open(executor).unwrap();

        let ckpt = manager
            .checkpoint("ticket done", Some(TicketId(7)))
            .await
            .unwrap();
        assert_eq!(ckpt.ticket, Some(TicketId(7)));
    }

    #[tokio::test]
    async fn test_clean_tree_returns_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        {
            let executor = dirty_checkpoint_mock(&dir, "first", "abc123");
            let mut manager = CheckpointManager::open(executor).unwrap();
            manager.checkpoint("first", None).await.unwrap();
        }

        // Reopen against a clean tree; history came from disk
        let executor = mock_in(&dir).with_ok("status --porcelain", "");
        let mut manager = CheckpointManager::open(executor).unwrap();
        let ckpt = manager.checkpoint("second", None).await.unwrap();
        assert_eq!(ckpt.tag, "ckpt-1");
        assert_eq!(ckpt.message, "first");
        assert_eq!(manager.history().len(), 1);
    }

    #[tokio::test]
    async fn test_clean_tree_with_no_history_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let executor = mock_in(&dir).with_ok("status --porcelain", "");
        let mut manager = CheckpointManager::open(executor).unwrap();
        assert!(manager.checkpoint("noop", None).await.is_err());
    }

    #[tokio::test]
    async fn test_rollback_to_checkpoint_restores_as_new_commit() {
        let dir = tempfile::tempdir().unwrap();
        {
            let executor = dirty_checkpoint_mock(&dir, "first", "abc123");
            let mut manager = CheckpointManager::open(executor).unwrap();
            manager.checkpoint("first", None).await.unwrap();
        }

        let executor = mock_in(&dir)
            .with_ok("status --porcelain", "")
            .with_ok("checkout abc123 -- .", "")
            .with_ok("commit --allow-empty -m restore: ckpt-1", "")
            .with_ok("rev-parse HEAD", "def456\n")
            .with_ok("tag ckpt-2 def456", "");
        let mut manager = CheckpointManager::open(executor).unwrap();

        let restored = manager.rollback_to_checkpoint("ckpt-1").await.unwrap();
        assert_eq!(restored.seq, 2);
        assert_eq!(restored.commit, "def456");
        assert_eq!(manager.history().len(), 2);
    }

    #[tokio::test]
    async fn test_rollback_refuses_dirty_tree() {
        let dir = tempfile::tempdir().unwrap();
        {
            let executor = dirty_checkpoint_mock(&dir, "first", "abc123");
            let mut manager = CheckpointManager::open(executor).unwrap();
            manager.checkpoint("first", None).await.unwrap();
        }

        let executor = mock_in(&dir).with_ok("status --porcelain", " M src/x.rs\n");
        let mut manager = CheckpointManager::open(executor).unwrap();

        let err = manager.rollback_to_checkpoint("ckpt-1").await.unwrap_err();
        match err {
            ForemanError::DirtyWorkspace { dirty } => {
                assert_eq!(dirty, vec!["src/x.rs".to_string()]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_rollback_unknown_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let executor = mock_in(&dir);
        let mut manager = CheckpointManager::open(executor).unwrap();
        let err = manager.rollback_to_checkpoint("ckpt-99").await.unwrap_err();
        assert!(matches!(err, ForemanError::CheckpointNotFound(_)));
    }

    #[tokio::test]
    async fn test_rollback_ticket_reverts_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        {
            let executor = dirty_checkpoint_mock(&dir, "first", "abc123")
                .with_ok("tag ticket-TICKET-007-1 abc123", "");
            let mut manager = CheckpointManager::open(executor).unwrap();
            manager.checkpoint("first", Some(TicketId(7))).await.unwrap();
        }

        let executor = mock_in(&dir)
            .with_ok("status --porcelain", "")
            .with_ok("rev-parse HEAD", "head0\n")
            .with_ok("revert --no-commit abc123", "")
            .with_ok("commit -m rollback TICKET-007", "")
            .with_ok("tag ckpt-2 head0", "");
        let mut manager = CheckpointManager::open(executor).unwrap();

        let outcome = manager.rollback_ticket(TicketId(7)).await.unwrap();
        assert_eq!(outcome.reverted.len(), 1);
        assert_eq!(outcome.reverted[0].tag, "ckpt-1");
        assert!(outcome.checkpoint.is_some());
    }

    #[tokio::test]
    async fn test_rollback_ticket_conflict_aborts_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        {
            let executor = dirty_checkpoint_mock(&dir, "first", "abc123")
                .with_ok("tag ticket-TICKET-007-1 abc123", "");
            let mut manager = CheckpointManager::open(executor).unwrap();
            manager.checkpoint("first", Some(TicketId(7))).await.unwrap();
        }

        let executor = mock_in(&dir)
            .with_ok("status --porcelain", "")
            .with_ok("rev-parse HEAD", "head0\n")
            .with_err("revert --no-commit abc123", "error: could not revert")
            .with_ok("diff --name-only --diff-filter=U", "src/shared.rs\n")
            .with_ok("revert --abort", "")
            .with_ok("reset --hard head0", "");
        let mut manager = CheckpointManager::open(executor).unwrap();

        let err = manager.rollback_ticket(TicketId(7)).await.unwrap_err();
        match err {
            ForemanError::RollbackConflict { ticket, files, .. } => {
                assert_eq!(ticket, TicketId(7));
                assert_eq!(files, vec!["src/shared.rs".to_string()]);
            }
            other => panic!("unexpected error: {}", other),
        }
        // Nothing new was recorded
        assert_eq!(manager.history().len(), 1);
    }

    #[tokio::test]
    async fn test_rollback_ticket_without_checkpoints_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let executor = mock_in(&dir);
        let mut manager = CheckpointManager::open(executor).unwrap();
        let outcome = manager.rollback_ticket(TicketId(42)).await.unwrap();
        assert!(outcome.reverted.is_empty());
        assert!(outcome.checkpoint.is_none());
    }
}
