//! Dependency graph queries over ticket records
//!
//! Readiness is always computed on demand from the declared edges and the
//! current ticket statuses; nothing here is stored as independent truth.

use foreman_core::{Ticket, TicketId, TicketStatus};
use std::collections::{BTreeMap, BTreeSet};

/// Declared dependencies of `ticket` that are not yet completed
pub fn blocked_by(ticket: &Ticket, tickets: &BTreeMap<TicketId, Ticket>) -> Vec<TicketId> {
    ticket
        .dependencies
        .iter()
        .filter(|dep| {
            tickets
                .get(dep)
                .map(|t| t.status != TicketStatus::Completed)
                .unwrap_or(true)
        })
        .copied()
        .collect()
}

/// Pending tickets whose dependencies are all completed
pub fn ready_set<'a>(tickets: &'a BTreeMap<TicketId, Ticket>) -> Vec<&'a Ticket> {
    tickets
        .values()
        .filter(|t| t.status == TicketStatus::Pending)
        .filter(|t| blocked_by(t, tickets).is_empty())
        .collect()
}

/// Tickets that declare a dependency on `id`
pub fn dependents<'a>(id: TicketId, tickets: &'a BTreeMap<TicketId, Ticket>) -> Vec<&'a Ticket> {
    tickets
        .values()
        .filter(|t| t.dependencies.contains(&id))
        .collect()
}

/// Check whether giving `new_id` the dependencies `new_deps` would close a
/// cycle through the existing graph
///
/// Returns the full ordered path, starting and ending at `new_id`, when a
/// cycle is found. The existing graph is assumed acyclic (store invariant).
pub fn find_cycle(
    new_id: TicketId,
    new_deps: &[TicketId],
    tickets: &BTreeMap<TicketId, Ticket>,
) -> Option<Vec<TicketId>> {
    let mut edges: BTreeMap<TicketId, Vec<TicketId>> = tickets
        .iter()
        .map(|(id, t)| (*id, t.dependencies.clone()))
        .collect();
    edges.insert(new_id, new_deps.to_vec());
    find_cycle_through(new_id, &edges)
}

/// Find a cycle anywhere in a proposed edge map (node -> dependencies)
///
/// Used when validating a whole imported graph at once, where forward
/// references between batch entries can form cycles.
pub fn find_cycle_in(edges: &BTreeMap<TicketId, Vec<TicketId>>) -> Option<Vec<TicketId>> {
    for start in edges.keys() {
        if let Some(path) = find_cycle_through(*start, edges) {
            return Some(path);
        }
    }
    None
}

/// Search for a cycle that passes through `start`
fn find_cycle_through(
    start: TicketId,
    edges: &BTreeMap<TicketId, Vec<TicketId>>,
) -> Option<Vec<TicketId>> {
    let mut path = vec![start];
    let mut visited = BTreeSet::new();
    if walk(start, start, edges, &mut path, &mut visited) {
        Some(path)
    } else {
        None
    }
}

fn walk(
    target: TicketId,
    current: TicketId,
    edges: &BTreeMap<TicketId, Vec<TicketId>>,
    path: &mut Vec<TicketId>,
    visited: &mut BTreeSet<TicketId>,
) -> bool {
    let Some(deps) = edges.get(&current) else {
        return false;
    };
    for dep in deps {
        if *dep == target {
            path.push(*dep);
            return true;
        }
        if !visited.insert(*dep) {
            continue;
        }
        path.push(*dep);
        if walk(target, *dep, edges, path, visited) {
            return true;
        }
        path.pop();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::Ticket;

    fn ticket(id: u32, deps: &[u32], status: TicketStatus) -> Ticket {
        let mut t = Ticket::new(TicketId(id), format!("t{}", id), "")
            .with_dependencies(deps.iter().map(|d| TicketId(*d)).collect());
        t.status = status;
        t
    }

    fn map(tickets: Vec<Ticket>) -> BTreeMap<TicketId, Ticket> {
        tickets.into_iter().map(|t| (t.id, t)).collect()
    }

    #[test]
    fn test_blocked_by_computed_on_demand() {
        let tickets = map(vec![
            ticket(1, &[], TicketStatus::InProgress),
            ticket(2, &[1], TicketStatus::Pending),
        ]);
        let t2 = &tickets[&TicketId(2)];
        assert_eq!(blocked_by(t2, &tickets), vec![TicketId(1)]);

        let tickets = map(vec![
            ticket(1, &[], TicketStatus::Completed),
            ticket(2, &[1], TicketStatus::Pending),
        ]);
        let t2 = &tickets[&TicketId(2)];
        assert!(blocked_by(t2, &tickets).is_empty());
    }

    #[test]
    fn test_missing_dependency_blocks() {
        let tickets = map(vec![ticket(2, &[7], TicketStatus::Pending)]);
        let t2 = &tickets[&TicketId(2)];
        assert_eq!(blocked_by(t2, &tickets), vec![TicketId(7)]);
    }

    #[test]
    fn test_ready_set_excludes_dependent_even_when_dep_is_ready() {
        // T1 no deps, T2 depends on T1: only T1 is ready while T1 is pending
        let tickets = map(vec![
            ticket(1, &[], TicketStatus::Pending),
            ticket(2, &[1], TicketStatus::Pending),
        ]);
        let ready = ready_set(&tickets);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, TicketId(1));
    }

    #[test]
    fn test_ready_set_ignores_non_pending() {
        let tickets = map(vec![
            ticket(1, &[], TicketStatus::Failed),
            ticket(2, &[], TicketStatus::Completed),
        ]);
        assert!(ready_set(&tickets).is_empty());
    }

    #[test]
    fn test_find_cycle_reports_full_path() {
        // Proposing 1 -> 2 where 2 -> 3 -> 1 already holds
        let tickets = map(vec![
            ticket(2, &[3], TicketStatus::Pending),
            ticket(3, &[1], TicketStatus::Pending),
        ]);
        let path = find_cycle(TicketId(1), &[TicketId(2)], &tickets).unwrap();
        assert_eq!(
            path,
            vec![TicketId(1), TicketId(2), TicketId(3), TicketId(1)]
        );
    }

    #[test]
    fn test_find_cycle_none_on_dag() {
        let tickets = map(vec![
            ticket(1, &[], TicketStatus::Pending),
            ticket(2, &[1], TicketStatus::Pending),
        ]);
        assert!(find_cycle(TicketId(3), &[TicketId(2)], &tickets).is_none());
    }

    #[test]
    fn test_find_cycle_self_loop() {
        let tickets = map(vec![]);
        let path = find_cycle(TicketId(1), &[TicketId(1)], &tickets).unwrap();
        assert_eq!(path, vec![TicketId(1), TicketId(1)]);
    }

    #[test]
    fn test_find_cycle_in_batch_edges() {
        let mut edges = BTreeMap::new();
        edges.insert(TicketId(1), vec![TicketId(2)]);
        edges.insert(TicketId(2), vec![TicketId(3)]);
        edges.insert(TicketId(3), vec![TicketId(1)]);
        let path = find_cycle_in(&edges).unwrap();
        assert_eq!(path.len(), 4);
        assert_eq!(path.first(), path.last());
    }

    #[test]
    fn test_dependents() {
        let tickets = map(vec![
            ticket(1, &[], TicketStatus::Completed),
            ticket(2, &[1], TicketStatus::Pending),
            ticket(3, &[1], TicketStatus::Pending),
        ]);
        let deps = dependents(TicketId(1), &tickets);
        assert_eq!(deps.len(), 2);
    }
}
