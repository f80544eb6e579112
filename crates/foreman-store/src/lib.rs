//! # foreman-store
//!
//! Durable state for foreman orchestration, laid out under `.foreman/`:
//!
//! - Ticket records and their aggregate index (`tickets/`)
//! - The exclusive file reservation table (`reservations.json`)
//! - Session phase and remediation cycle counter (`session.json`)
//! - The append-only event log (`events.jsonl`)
//!
//! Each table is independently durable; the index is rebuildable from the
//! ticket records and readiness is always recomputed from tickets and their
//! declared edges.

pub mod graph;

mod events;
mod reservations;
mod session;
mod tickets;

pub use events::{Event, EventLog};
pub use reservations::ReservationLedger;
pub use session::{SessionState, SessionStore};
pub use tickets::{NewTicket, RebuildReport, RecordError, TicketIndex, TicketStore};
