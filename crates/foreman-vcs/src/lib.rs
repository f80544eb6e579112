//! # foreman-vcs
//!
//! Version-control capabilities for foreman orchestration: snapshot the
//! tree, tag checkpoints, revert a ticket's commits, and restore a recorded
//! checkpoint. Everything goes through the [`VcsExecutor`] trait so the git
//! backend can be swapped for a mock in tests.

mod checkpoint;
mod command;

pub use checkpoint::{Checkpoint, CheckpointManager, TicketRollback};
pub use command::{GitCommand, MockVcsExecutor, VcsExecutor, VcsOutput};
