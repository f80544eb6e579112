//! foreman CLI - multi-agent ticket orchestration
//!
//! Usage:
//!   foreman init                     Initialize foreman in current repo
//!   foreman create <title>           Create a ticket
//!   foreman import <file>            Import a task graph from JSON
//!   foreman list                     List tickets
//!   foreman show <ticket>            Show one ticket
//!   foreman next                     Show the next dispatchable ticket
//!   foreman run --worker-cmd <cmd>   Run the dispatch loop
//!   foreman status                   Show session status
//!   foreman retry / skip / assign    Operator ticket controls
//!   foreman rollback <target>        Revert a ticket or restore a checkpoint
//!   foreman override <gate>          Force a passed session gate to re-run
//!   foreman sweep                    Reclaim stale reservations
//!   foreman events                   Tail the event log
//!   foreman graph / stats            Dependency tree and counts

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use foreman_core::{Finding, ForemanConfig, ForemanError, Priority, Severity, Ticket, TicketId};
use foreman_orchestrator::{
    import_graph, Dispatcher, GateResult, GateRunner, GateScope, WorkerExecutor,
};
use foreman_store::{graph, EventLog, NewTicket, ReservationLedger, SessionStore, TicketStore};
use foreman_vcs::GitCommand;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(author, version, about = "Multi-agent ticket orchestration")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Repository root (defaults to current directory)
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize foreman state in the repository
    Init,

    /// Create a ticket
    Create {
        title: String,

        #[arg(long, default_value = "")]
        description: String,

        /// critical, high, medium or low
        #[arg(long, default_value = "medium")]
        priority: String,

        /// Ticket ids this one depends on (repeatable)
        #[arg(long = "depends")]
        depends: Vec<String>,

        /// Files the ticket will touch (repeatable)
        #[arg(long = "file")]
        files: Vec<String>,

        /// Acceptance criteria (repeatable)
        #[arg(long = "criterion")]
        criteria: Vec<String>,

        #[arg(long)]
        worker: Option<String>,
    },

    /// Import a task graph from a JSON file
    Import { file: PathBuf },

    /// List tickets, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
    },

    /// Show one ticket in full
    Show { ticket: String },

    /// Show the highest-priority ready ticket
    Next {
        #[arg(long)]
        worker: Option<String>,
    },

    /// Run the dispatch loop until the session completes or escalates
    Run {
        /// Shell command run per ticket; receives the ticket as JSON on
        /// stdin and must print a result document to stdout
        #[arg(long)]
        worker_cmd: String,

        /// Ticket-scoped gate as name=command (repeatable)
        #[arg(long = "ticket-gate")]
        ticket_gates: Vec<String>,

        /// Session-scoped gate as name=command (repeatable)
        #[arg(long = "session-gate")]
        session_gates: Vec<String>,
    },

    /// Show session status: counts, reservations, cycle, checkpoints
    Status,

    /// Re-queue a failed ticket
    Retry { ticket: String },

    /// Skip a ticket (terminal)
    Skip { ticket: String },

    /// Assign a worker to a ticket
    Assign { ticket: String, worker: String },

    /// Revert a ticket's checkpoints, or restore a checkpoint by tag
    Rollback { target: String },

    /// Force a passed session gate to run again
    Override { gate: String },

    /// Reclaim stale reservations now
    Sweep,

    /// Print the event log
    Events {
        /// Only the last N events
        #[arg(long, default_value = "50")]
        tail: usize,
    },

    /// Print the dependency tree
    Graph,

    /// Print ticket counts and session summary
    Stats,

    /// Rebuild the ticket index from individual records
    RebuildIndex,
}

/// Worker that shells out per ticket
///
/// The ticket and its reserved files go to the command's stdin as JSON;
/// stdout is taken as the raw result document.
struct CommandWorker {
    command: String,
}

#[async_trait]
impl WorkerExecutor for CommandWorker {
    async fn execute(
        &self,
        ticket: &Ticket,
        reserved_files: &[String],
    ) -> foreman_core::Result<String> {
        let payload = serde_json::to_string(&serde_json::json!({
            "ticket": ticket,
            "reserved_files": reserved_files,
        }))?;

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("FOREMAN_TICKET", ticket.id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ForemanError::Other(format!("failed to spawn worker: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            use tokio::io::AsyncWriteExt;
            stdin.write_all(payload.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

/// Gate runner that shells out per gate
///
/// A nonzero exit fails the gate with a single high-severity finding
/// carrying the command's output.
struct CommandGateRunner {
    ticket: Vec<(String, String)>,
    session: Vec<(String, String)>,
}

impl CommandGateRunner {
    fn command_for(&self, gate: &str, scope: &GateScope) -> Option<&str> {
        let gates = match scope {
            GateScope::Ticket(_) => &self.ticket,
            GateScope::Session => &self.session,
        };
        gates
            .iter()
            .find(|(name, _)| name == gate)
            .map(|(_, cmd)| cmd.as_str())
    }
}

#[async_trait]
impl GateRunner for CommandGateRunner {
    fn ticket_gates(&self) -> Vec<String> {
        self.ticket.iter().map(|(name, _)| name.clone()).collect()
    }

    fn session_gates(&self) -> Vec<String> {
        self.session.iter().map(|(name, _)| name.clone()).collect()
    }

    async fn run(&self, gate: &str, scope: &GateScope) -> foreman_core::Result<GateResult> {
        let Some(command) = self.command_for(gate, scope) else {
            return Ok(GateResult::pass(gate));
        };

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|e| ForemanError::Other(format!("failed to run gate {}: {}", gate, e)))?;

        if output.status.success() {
            return Ok(GateResult::pass(gate));
        }

        let mut message = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if message.is_empty() {
            message = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        if message.is_empty() {
            message = format!("gate {} failed", gate);
        }
        Ok(GateResult::fail(
            gate,
            vec![Finding {
                gate: gate.to_string(),
                severity: Severity::High,
                message,
                file: None,
                suggestion: None,
            }],
        ))
    }
}

/// Placeholder worker for operator commands that never dispatch
struct NoWorker;

#[async_trait]
impl WorkerExecutor for NoWorker {
    async fn execute(&self, ticket: &Ticket, _: &[String]) -> foreman_core::Result<String> {
        Err(ForemanError::Other(format!(
            "no worker configured for {}",
            ticket.id
        )))
    }
}

/// Placeholder gates for operator commands that never gate
struct NoGates;

#[async_trait]
impl GateRunner for NoGates {
    fn ticket_gates(&self) -> Vec<String> {
        Vec::new()
    }

    fn session_gates(&self) -> Vec<String> {
        Vec::new()
    }

    async fn run(&self, gate: &str, _: &GateScope) -> foreman_core::Result<GateResult> {
        Ok(GateResult::pass(gate))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let repo = cli.repo;
    match cli.command {
        Commands::Init => cmd_init(&repo),
        Commands::Create {
            title,
            description,
            priority,
            depends,
            files,
            criteria,
            worker,
        } => cmd_create(&repo, title, description, priority, depends, files, criteria, worker),
        Commands::Import { file } => cmd_import(&repo, &file),
        Commands::List { status } => cmd_list(&repo, status),
        Commands::Show { ticket } => cmd_show(&repo, &ticket),
        Commands::Next { worker } => cmd_next(&repo, worker),
        Commands::Run {
            worker_cmd,
            ticket_gates,
            session_gates,
        } => cmd_run(&repo, worker_cmd, ticket_gates, session_gates).await,
        Commands::Status => cmd_status(&repo),
        Commands::Retry { ticket } => cmd_retry(&repo, &ticket),
        Commands::Skip { ticket } => cmd_skip(&repo, &ticket),
        Commands::Assign { ticket, worker } => cmd_assign(&repo, &ticket, &worker),
        Commands::Rollback { target } => cmd_rollback(&repo, &target).await,
        Commands::Override { gate } => cmd_override(&repo, &gate),
        Commands::Sweep => cmd_sweep(&repo),
        Commands::Events { tail } => cmd_events(&repo, tail),
        Commands::Graph => cmd_graph(&repo),
        Commands::Stats => cmd_stats(&repo),
        Commands::RebuildIndex => cmd_rebuild_index(&repo),
    }
}

fn parse_ticket_id(s: &str) -> Result<TicketId> {
    s.parse::<TicketId>()
        .map_err(|e| anyhow::anyhow!("{}", e))
}

fn parse_gate_specs(specs: &[String]) -> Result<Vec<(String, String)>> {
    specs
        .iter()
        .map(|spec| match spec.split_once('=') {
            Some((name, cmd)) if !name.is_empty() && !cmd.is_empty() => {
                Ok((name.to_string(), cmd.to_string()))
            }
            _ => bail!("gate spec '{}' is not name=command", spec),
        })
        .collect()
}

fn operator_dispatcher(repo: &PathBuf) -> Result<Dispatcher<GitCommand, NoWorker, NoGates>> {
    let config = ForemanConfig::load_or_default(repo)?;
    let vcs = GitCommand::new(repo.clone());
    Ok(Dispatcher::open(repo, config, vcs, NoWorker, NoGates)?)
}

fn cmd_init(repo: &PathBuf) -> Result<()> {
    TicketStore::init(repo).context("failed to initialize ticket store")?;
    ForemanConfig::write_default(repo)?;
    println!("Initialized foreman state under {}/.foreman", repo.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_create(
    repo: &PathBuf,
    title: String,
    description: String,
    priority: String,
    depends: Vec<String>,
    files: Vec<String>,
    criteria: Vec<String>,
    worker: Option<String>,
) -> Result<()> {
    let mut store = TicketStore::open(repo)?;
    let priority: Priority = priority
        .parse()
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    let dependencies = depends
        .iter()
        .map(|d| parse_ticket_id(d))
        .collect::<Result<Vec<_>>>()?;

    let ticket = store.create(NewTicket {
        title,
        description,
        priority,
        worker,
        dependencies,
        files,
        acceptance_criteria: criteria,
        remediation_of: None,
    })?;
    println!("{} created ({})", ticket.id, ticket.priority);
    Ok(())
}

fn cmd_import(repo: &PathBuf, file: &PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let mut store = TicketStore::open(repo)?;
    let tickets = import_graph(&mut store, &raw)?;
    for ticket in &tickets {
        println!("{} {}", ticket.id, ticket.title);
    }
    println!("{} ticket(s) imported", tickets.len());
    Ok(())
}

fn cmd_list(repo: &PathBuf, status: Option<String>) -> Result<()> {
    let store = TicketStore::open(repo)?;
    let filter = status
        .map(|s| s.parse::<foreman_core::TicketStatus>())
        .transpose()
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    for ticket in store.all() {
        if let Some(wanted) = filter {
            if ticket.status != wanted {
                continue;
            }
        }
        println!(
            "{}  {:<11}  {:<8}  {}",
            ticket.id, ticket.status, ticket.priority, ticket.title
        );
    }
    Ok(())
}

fn cmd_show(repo: &PathBuf, ticket: &str) -> Result<()> {
    let store = TicketStore::open(repo)?;
    let id = parse_ticket_id(ticket)?;
    let ticket = store.get(id)?;
    println!("{}", serde_json::to_string_pretty(ticket)?);
    Ok(())
}

fn cmd_next(repo: &PathBuf, worker: Option<String>) -> Result<()> {
    let store = TicketStore::open(repo)?;
    match store.next_ticket(worker.as_deref()) {
        Some(ticket) => println!(
            "{}  {:<8}  {}",
            ticket.id, ticket.priority, ticket.title
        ),
        None => println!("no dispatchable ticket"),
    }
    Ok(())
}

async fn cmd_run(
    repo: &PathBuf,
    worker_cmd: String,
    ticket_gates: Vec<String>,
    session_gates: Vec<String>,
) -> Result<()> {
    let config = ForemanConfig::load_or_default(repo)?;
    let vcs = GitCommand::new(repo.clone());
    let workers = CommandWorker { command: worker_cmd };
    let gates = CommandGateRunner {
        ticket: parse_gate_specs(&ticket_gates)?,
        session: parse_gate_specs(&session_gates)?,
    };

    let mut dispatcher = Dispatcher::open(repo, config, vcs, workers, gates)?;
    let phase = dispatcher.run().await?;
    println!("session finished: {}", phase);
    if let Some(report) = dispatcher.escalation() {
        println!("{}", report.render());
    }
    Ok(())
}

fn cmd_status(repo: &PathBuf) -> Result<()> {
    let dispatcher = operator_dispatcher(repo)?;
    let status = dispatcher.status();

    println!("phase: {}", status.phase);
    println!("remediation cycle: {}", status.remediation_cycle);
    println!("tickets:");
    for (state, count) in &status.counts {
        println!("  {:<11} {}", state, count);
    }
    if !status.reservations.is_empty() {
        println!("reservations:");
        for r in &status.reservations {
            println!("  {}  {} ({}) since {}", r.path, r.ticket, r.worker, r.reserved_at);
        }
    }
    if !status.checkpoints.is_empty() {
        println!("checkpoints:");
        for c in &status.checkpoints {
            let ticket = c
                .ticket
                .map(|t| format!(" [{}]", t))
                .unwrap_or_default();
            println!("  {}  {}{}  {}", c.tag, c.commit, ticket, c.message);
        }
    }
    Ok(())
}

fn cmd_retry(repo: &PathBuf, ticket: &str) -> Result<()> {
    let mut dispatcher = operator_dispatcher(repo)?;
    let ticket = dispatcher.retry(parse_ticket_id(ticket)?)?;
    println!("{} re-queued (attempt {})", ticket.id, ticket.attempt);
    Ok(())
}

fn cmd_skip(repo: &PathBuf, ticket: &str) -> Result<()> {
    let mut dispatcher = operator_dispatcher(repo)?;
    let ticket = dispatcher.skip(parse_ticket_id(ticket)?)?;
    println!("{} skipped", ticket.id);
    Ok(())
}

fn cmd_assign(repo: &PathBuf, ticket: &str, worker: &str) -> Result<()> {
    let mut dispatcher = operator_dispatcher(repo)?;
    let ticket = dispatcher.assign(parse_ticket_id(ticket)?, worker)?;
    println!("{} assigned to {}", ticket.id, worker);
    Ok(())
}

async fn cmd_rollback(repo: &PathBuf, target: &str) -> Result<()> {
    let mut dispatcher = operator_dispatcher(repo)?;
    if let Ok(id) = target.parse::<TicketId>() {
        let outcome = dispatcher.rollback_ticket(id).await?;
        println!(
            "{}: {} checkpoint(s) reverted",
            id,
            outcome.reverted.len()
        );
    } else {
        let ckpt = dispatcher.rollback_to(target).await?;
        println!("restored as {} ({})", ckpt.tag, ckpt.commit);
    }
    Ok(())
}

fn cmd_override(repo: &PathBuf, gate: &str) -> Result<()> {
    let mut dispatcher = operator_dispatcher(repo)?;
    if dispatcher.override_gate(gate)? {
        println!("gate {} will re-run", gate);
    } else {
        println!("gate {} had no pass record", gate);
    }
    Ok(())
}

fn cmd_sweep(repo: &PathBuf) -> Result<()> {
    let config = ForemanConfig::load_or_default(repo)?;
    let store = TicketStore::open(repo)?;
    let mut reservations = ReservationLedger::open(repo)?;
    let mut events = EventLog::open(repo)?;

    let max_age = chrono::Duration::minutes(config.stale_reservation_minutes);
    let reclaimed = reservations.sweep_stale(max_age, |id| {
        store.tickets().get(&id).map(|t| t.status)
    })?;
    for r in &reclaimed {
        events.post(
            "reservations",
            "reservation_reclaimed",
            serde_json::json!({"path": r.path, "ticket": r.ticket.to_string(), "worker": r.worker}),
        )?;
        println!("reclaimed {} (was {} / {})", r.path, r.ticket, r.worker);
    }
    println!("{} reservation(s) reclaimed", reclaimed.len());
    Ok(())
}

fn cmd_events(repo: &PathBuf, tail: usize) -> Result<()> {
    let log = EventLog::open(repo)?;
    let events = log.read_all()?;
    let start = events.len().saturating_sub(tail);
    for event in &events[start..] {
        println!(
            "{:>5}  {}  [{}] {}  {}",
            event.seq, event.timestamp, event.source, event.kind, event.payload
        );
    }
    Ok(())
}

fn cmd_graph(repo: &PathBuf) -> Result<()> {
    let store = TicketStore::open(repo)?;
    for ticket in store.all() {
        println!("{} [{}] {}", ticket.id, ticket.status, ticket.title);
        for dep in &ticket.dependencies {
            let state = store
                .tickets()
                .get(dep)
                .map(|t| t.status.to_string())
                .unwrap_or_else(|| "missing".to_string());
            println!("  └─ depends on {} [{}]", dep, state);
        }
    }
    Ok(())
}

fn cmd_stats(repo: &PathBuf) -> Result<()> {
    let store = TicketStore::open(repo)?;
    let session = SessionStore::open(repo)?;

    println!("phase: {}", session.state.phase);
    println!("remediation cycle: {}", session.state.remediation_cycle);
    let counts = store.counts_by_status();
    let total: usize = counts.values().sum();
    println!("tickets: {}", total);
    for (status, count) in &counts {
        println!("  {:<11} {}", status, count);
    }
    let ready = graph::ready_set(store.tickets());
    println!("ready now: {}", ready.len());
    Ok(())
}

fn cmd_rebuild_index(repo: &PathBuf) -> Result<()> {
    let mut store = TicketStore::open(repo)?;
    let report = store.rebuild_index()?;
    println!("{} record(s) indexed", report.total);
    for (status, count) in &report.by_status {
        println!("  {:<11} {}", status, count);
    }
    for error in &report.errors {
        eprintln!("corrupt record {}: {}", error.path, error.detail);
    }
    Ok(())
}
