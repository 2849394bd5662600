use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Server-assigned task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Queue status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Verified,
    Ignored,
    Unresolved,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Verified => "VERIFIED",
            TaskStatus::Ignored => "IGNORED",
            TaskStatus::Unresolved => "UNRESOLVED",
        }
    }

    /// Parse a stored status. Accepts the legacy `PROCESSING` / `IGNORE`
    /// spellings written by older queue files.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(TaskStatus::Pending),
            "VERIFIED" => Some(TaskStatus::Verified),
            "IGNORED" => Some(TaskStatus::Ignored),
            "UNRESOLVED" => Some(TaskStatus::Unresolved),
            "PROCESSING" => {
                warn!("Legacy status PROCESSING read as PENDING");
                Some(TaskStatus::Pending)
            }
            "IGNORE" => Some(TaskStatus::Ignored),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, TaskStatus::Pending)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a completed comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Confirmed match.
    Verified,
    /// Confirmed non-match (including category pages).
    Ignored,
    /// The run finished but no marker could be read.
    Unresolved,
}

impl Verdict {
    /// Classify the result of a verdict scan. `{YES}` wins when both markers
    /// are present.
    pub fn from_markers(yes: bool, no: bool) -> Self {
        if yes {
            Verdict::Verified
        } else if no {
            Verdict::Ignored
        } else {
            Verdict::Unresolved
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            Verdict::Verified => TaskStatus::Verified,
            Verdict::Ignored => TaskStatus::Ignored,
            Verdict::Unresolved => TaskStatus::Unresolved,
        }
    }
}

/// One competitor-page vs client-page comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub competitor_url: String,
    pub client_url: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Task {
    pub fn new(id: TaskId, competitor_url: impl Into<String>, client_url: impl Into<String>) -> Self {
        Self {
            id,
            competitor_url: competitor_url.into(),
            client_url: client_url.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            last_error: None,
            updated_at: None,
        }
    }
}

/// Which tasks a sweep picks up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReprocessPolicy {
    /// Only `PENDING` tasks; every verdict is final.
    #[default]
    OneShot,
    /// `PENDING` plus `UNRESOLVED` tasks.
    RetryUnresolved,
}

impl ReprocessPolicy {
    pub fn selects(&self, status: TaskStatus) -> bool {
        match status {
            TaskStatus::Pending => true,
            TaskStatus::Unresolved => matches!(self, ReprocessPolicy::RetryUnresolved),
            TaskStatus::Verified | TaskStatus::Ignored => false,
        }
    }

    /// Statuses selected by this policy, in the order they are swept.
    pub fn statuses(&self) -> &'static [TaskStatus] {
        match self {
            ReprocessPolicy::OneShot => &[TaskStatus::Pending],
            ReprocessPolicy::RetryUnresolved => &[TaskStatus::Pending, TaskStatus::Unresolved],
        }
    }
}

/// Per-status row counts in the local queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub verified: usize,
    pub ignored: usize,
    pub unresolved: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.verified + self.ignored + self.unresolved
    }

    pub fn add(&mut self, status: TaskStatus, n: usize) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::Verified => self.verified += n,
            TaskStatus::Ignored => self.ignored += n,
            TaskStatus::Unresolved => self.unresolved += n,
        }
    }
}
