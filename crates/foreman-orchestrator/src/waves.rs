//! Wave partitioning over the ready set
//!
//! A wave is a set of tickets that can run concurrently: every member is
//! ready (pending, dependencies completed) and no two members declare
//! overlapping file sets. Placement is first-fit in (priority, id) order;
//! a ticket whose files overlap an earlier pick defers to a later wave.
//!
//! Dependency edges never appear inside a wave by construction: a ready
//! ticket's dependencies are already completed, so two ready tickets cannot
//! depend on each other.

use foreman_core::Ticket;
use std::collections::BTreeSet;

/// Partition ready tickets into dispatch waves
pub fn plan_waves<'a>(ready: &[&'a Ticket], max_wave_size: usize) -> Vec<Vec<&'a Ticket>> {
    let mut ordered: Vec<&Ticket> = ready.to_vec();
    ordered.sort_by_key(|t| (t.priority, t.id));

    let mut waves: Vec<Vec<&Ticket>> = Vec::new();
    let mut wave_files: Vec<BTreeSet<&str>> = Vec::new();

    for ticket in ordered {
        let files: BTreeSet<&str> = ticket.files.iter().map(String::as_str).collect();
        let slot = (0..waves.len())
            .find(|&i| waves[i].len() < max_wave_size && wave_files[i].is_disjoint(&files));
        match slot {
            Some(i) => {
                waves[i].push(ticket);
                wave_files[i].extend(files);
            }
            None => {
                waves.push(vec![ticket]);
                wave_files.push(files);
            }
        }
    }
    waves
}

/// The next wave to dispatch, first-fit by (priority, id)
pub fn next_wave<'a>(ready: &[&'a Ticket], max_wave_size: usize) -> Vec<&'a Ticket> {
    plan_waves(ready, max_wave_size)
        .into_iter()
        .next()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::{Priority, TicketId};

    fn ticket(id: u32, priority: Priority, files: &[&str]) -> Ticket {
        Ticket::new(TicketId(id), format!("t{}", id), "")
            .with_priority(priority)
            .with_files(files.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_disjoint_files_share_a_wave() {
        let a = ticket(1, Priority::Medium, &["src/a.rs"]);
        let b = ticket(2, Priority::Medium, &["src/b.rs"]);
        let wave = next_wave(&[&a, &b], 4);
        assert_eq!(wave.len(), 2);
    }

    #[test]
    fn test_overlap_defers_to_later_wave() {
        let a = ticket(1, Priority::Medium, &["src/shared.rs", "src/a.rs"]);
        let b = ticket(2, Priority::Medium, &["src/shared.rs"]);
        let waves = plan_waves(&[&a, &b], 4);
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0][0].id, TicketId(1));
        assert_eq!(waves[1][0].id, TicketId(2));
    }

    #[test]
    fn test_priority_wins_overlap() {
        // The critical ticket is placed first even with a higher id
        let a = ticket(1, Priority::Low, &["src/shared.rs"]);
        let b = ticket(2, Priority::Critical, &["src/shared.rs"]);
        let wave = next_wave(&[&a, &b], 4);
        assert_eq!(wave.len(), 1);
        assert_eq!(wave[0].id, TicketId(2));
    }

    #[test]
    fn test_wave_size_cap() {
        let tickets: Vec<Ticket> = (1..=5)
            .map(|i| ticket(i, Priority::Medium, &[]))
            .collect();
        let refs: Vec<&Ticket> = tickets.iter().collect();
        let waves = plan_waves(&refs, 2);
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0].len(), 2);
        assert_eq!(waves[2].len(), 1);
    }

    #[test]
    fn test_empty_ready_set() {
        assert!(next_wave(&[], 4).is_empty());
    }
}
