//! # foreman-core
//!
//! Core types for the foreman ticket orchestration system.
//!
//! Foreman coordinates fleets of autonomous workers editing a shared
//! repository. The core paradigm:
//!
//! - Tickets are the unit of work, with a strict status state machine
//! - Dependencies are declared edges over a DAG, readiness is computed on demand
//! - Write access is mediated by exclusive per-file reservations
//! - Every completed unit of work gets an immutable checkpoint
//! - Quality-gate failures trigger bounded remediation, then escalation

mod config;
mod error;
mod types;

pub use config::{ForemanConfig, FOREMAN_DIR};
pub use error::{ForemanError, Result};
pub use types::*;
