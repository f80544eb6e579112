//! Task-graph import
//!
//! A planning collaborator hands over a whole task graph as JSON; tickets
//! and edges are validated here (duplicate keys, unknown references,
//! cycles) and only then created. Validation failures reject the entire
//! batch; nothing is persisted. Batch entries reference each other by
//! symbolic key, and may reference existing tickets by id.

use foreman_core::{ForemanError, Priority, Result, Ticket, TicketId};
use foreman_store::{graph, NewTicket, TicketStore};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use tracing::info;

/// A whole imported task graph
#[derive(Debug, Deserialize)]
pub struct TaskGraph {
    pub tasks: Vec<TaskSpec>,
}

/// One task in an imported graph
#[derive(Debug, Deserialize)]
pub struct TaskSpec {
    /// Symbolic key other batch entries may reference in `depends_on`
    pub key: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    /// Keys of batch entries or ids of existing tickets
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub worker: Option<String>,
}

/// Validate and create every ticket in an imported graph
pub fn import_graph(store: &mut TicketStore, raw: &str) -> Result<Vec<Ticket>> {
    let task_graph: TaskGraph = serde_json::from_str(raw)?;

    // Duplicate keys poison every reference to them
    let mut keys: HashMap<&str, usize> = HashMap::new();
    for (i, task) in task_graph.tasks.iter().enumerate() {
        if keys.insert(task.key.as_str(), i).is_some() {
            return Err(ForemanError::Config(format!(
                "duplicate task key '{}' in imported graph",
                task.key
            )));
        }
    }

    // Prospective ids for cycle validation; actual ids are assigned at
    // creation and may differ in order, which the cycle check doesn't need
    let base = store.peek_next_id();
    let prospective: HashMap<&str, TicketId> = task_graph
        .tasks
        .iter()
        .enumerate()
        .map(|(i, t)| (t.key.as_str(), TicketId(base + i as u32)))
        .collect();

    let existing: std::collections::BTreeSet<TicketId> =
        store.tickets().keys().copied().collect();
    let resolve = |task: &TaskSpec, dep: &str| -> Result<TicketId> {
        if let Some(id) = prospective.get(dep) {
            return Ok(*id);
        }
        if let Ok(id) = dep.parse::<TicketId>() {
            if existing.contains(&id) {
                return Ok(id);
            }
        }
        Err(ForemanError::Config(format!(
            "task '{}' depends on unknown '{}'",
            task.key, dep
        )))
    };

    let mut edges: BTreeMap<TicketId, Vec<TicketId>> = store
        .tickets()
        .iter()
        .map(|(id, t)| (*id, t.dependencies.clone()))
        .collect();
    for task in &task_graph.tasks {
        let deps = task
            .depends_on
            .iter()
            .map(|d| resolve(task, d))
            .collect::<Result<Vec<_>>>()?;
        edges.insert(prospective[task.key.as_str()], deps);
    }

    if let Some(path) = graph::find_cycle_in(&edges) {
        return Err(ForemanError::CycleDetected { path });
    }

    // Create in an order where batch dependencies already exist
    let mut created: HashMap<String, TicketId> = HashMap::new();
    let mut tickets = Vec::new();
    let mut remaining: Vec<&TaskSpec> = task_graph.tasks.iter().collect();
    while !remaining.is_empty() {
        let ready_idx = remaining.iter().position(|task| {
            task.depends_on
                .iter()
                .all(|d| created.contains_key(d) || !prospective.contains_key(d.as_str()))
        });
        // Guaranteed by the cycle check above
        let Some(idx) = ready_idx else {
            return Err(ForemanError::Other(
                "imported graph could not be ordered".to_string(),
            ));
        };
        let task = remaining.remove(idx);

        let dependencies = task
            .depends_on
            .iter()
            .map(|d| match created.get(d) {
                Some(id) => Ok(*id),
                None => resolve(task, d),
            })
            .collect::<Result<Vec<_>>>()?;

        let ticket = store.create(NewTicket {
            title: task.title.clone(),
            description: task.description.clone(),
            priority: task.priority,
            worker: task.worker.clone(),
            dependencies,
            files: task.files.clone(),
            acceptance_criteria: task.acceptance_criteria.clone(),
            remediation_of: None,
        })?;
        created.insert(task.key.clone(), ticket.id);
        tickets.push(ticket);
    }

    info!("imported {} ticket(s)", tickets.len());
    Ok(tickets)
}
