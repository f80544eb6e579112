//! Core type definitions for foreman orchestration

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Ticket priority levels
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Medium = 2,
    Low = 3,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" | "0" => Ok(Self::Critical),
            "high" | "1" => Ok(Self::High),
            "medium" | "2" => Ok(Self::Medium),
            "low" | "3" => Ok(Self::Low),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

/// Ticket status. Terminal states are `Completed` and `Skipped`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    #[default]
    Pending,
    InProgress,
    Review,
    Completed,
    Failed,
    Blocked,
    Skipped,
}

impl TicketStatus {
    /// Whether this status ends the ticket lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    /// Statuses reachable from this one.
    ///
    /// Any non-terminal status may additionally transition to `Skipped`
    /// via operator override, which is included here.
    pub fn allowed_next(&self) -> &'static [TicketStatus] {
        match self {
            Self::Pending => &[Self::InProgress, Self::Blocked, Self::Skipped],
            Self::InProgress => &[Self::Review, Self::Failed, Self::Skipped],
            Self::Review => &[Self::Completed, Self::Failed, Self::Skipped],
            Self::Failed => &[Self::Pending, Self::Skipped],
            Self::Blocked => &[Self::Pending, Self::Skipped],
            Self::Completed | Self::Skipped => &[],
        }
    }

    /// Check whether `next` is a valid successor of this status.
    pub fn can_transition_to(&self, next: TicketStatus) -> bool {
        self.allowed_next().contains(&next)
    }
}

impl std::fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Review => write!(f, "review"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

impl std::str::FromStr for TicketStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "in_progress" | "inprogress" => Ok(Self::InProgress),
            "review" => Ok(Self::Review),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "blocked" => Ok(Self::Blocked),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid status: {}", s)),
        }
    }
}

/// Monotonically assigned ticket identifier
///
/// Displayed zero-padded as `TICKET-007`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TicketId(pub u32);

impl TicketId {
    pub fn new(n: u32) -> Self {
        Self(n)
    }
}

impl std::fmt::Display for TicketId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TICKET-{:03}", self.0)
    }
}

impl From<TicketId> for String {
    fn from(id: TicketId) -> Self {
        id.to_string()
    }
}

impl std::str::FromStr for TicketId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("TICKET-").unwrap_or(s);
        digits
            .parse::<u32>()
            .map(TicketId)
            .map_err(|_| format!("Invalid ticket id: {}", s))
    }
}

impl TryFrom<String> for TicketId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// A unit of delegated work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub title: String,
    pub description: String,
    pub status: TicketStatus,
    pub priority: Priority,
    /// Assigned worker, if any
    pub worker: Option<String>,
    /// Declared dependencies (immutable after creation)
    pub dependencies: Vec<TicketId>,
    /// File paths this ticket will touch
    pub files: Vec<String>,
    pub acceptance_criteria: Vec<String>,
    /// Number of dispatch attempts; only ever increases
    pub attempt: u32,
    /// Back-reference to the ticket this one remediates
    pub remediation_of: Option<TicketId>,
    /// Free-form notes: failure context, rollback records, review flags
    #[serde(default)]
    pub notes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Most recent checkpoint created for this ticket's work
    pub checkpoint: Option<String>,
}

impl Ticket {
    pub fn new(id: TicketId, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            title: title.into(),
            description: description.into(),
            status: TicketStatus::Pending,
            priority: Priority::default(),
            worker: None,
            dependencies: Vec::new(),
            files: Vec::new(),
            acceptance_criteria: Vec::new(),
            attempt: 0,
            remediation_of: None,
            notes: Vec::new(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            checkpoint: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_worker(mut self, worker: impl Into<String>) -> Self {
        self.worker = Some(worker.into());
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<TicketId>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_criteria(mut self, criteria: Vec<String>) -> Self {
        self.acceptance_criteria = criteria;
        self
    }

    pub fn remediates(mut self, origin: TicketId) -> Self {
        self.remediation_of = Some(origin);
        self
    }
}

/// Finding severity from a quality gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

impl Severity {
    /// Priority a remediation ticket gets for a finding of this severity.
    pub fn remediation_priority(&self) -> Priority {
        match self {
            Self::Critical => Priority::Critical,
            Self::High => Priority::High,
            Self::Medium | Self::Low => Priority::Medium,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "critical"),
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(format!("Invalid severity: {}", s)),
        }
    }
}

/// A single structured finding from a quality gate run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Gate that produced this finding
    pub gate: String,
    pub severity: Severity,
    pub message: String,
    /// File the finding points at, when applicable
    pub file: Option<String>,
    /// Suggested remediation, when the gate offers one
    pub suggestion: Option<String>,
}

/// An active file reservation, as reported in conflicts and status snapshots
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationInfo {
    pub path: String,
    pub ticket: TicketId,
    pub worker: String,
    pub reserved_at: DateTime<Utc>,
}

/// Phase of an orchestration session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    #[default]
    Planning,
    Executing,
    Gating,
    Remediating,
    Complete,
    Escalated,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Escalated)
    }
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planning => write!(f, "planning"),
            Self::Executing => write!(f, "executing"),
            Self::Gating => write!(f, "gating"),
            Self::Remediating => write!(f, "remediating"),
            Self::Complete => write!(f, "complete"),
            Self::Escalated => write!(f, "escalated"),
        }
    }
}
