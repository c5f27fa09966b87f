//! Tasks: jobs claimed by a runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, OwnerId, RepoId, ResourceId, Result, Status};

/// Outcome of a task as reported by its runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    /// Still running.
    #[default]
    Unspecified,
    Success,
    Failure,
    Cancelled,
}

impl TaskResult {
    pub fn is_final(&self) -> bool {
        !matches!(self, TaskResult::Unspecified)
    }

    /// The job status this result settles on.
    pub fn job_status(&self) -> Status {
        match self {
            TaskResult::Unspecified => Status::Running,
            TaskResult::Success => Status::Success,
            TaskResult::Failure => Status::Failure,
            TaskResult::Cancelled => Status::Cancelled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskResult::Unspecified => "unspecified",
            TaskResult::Success => "success",
            TaskResult::Failure => "failure",
            TaskResult::Cancelled => "cancelled",
        }
    }
}

impl std::str::FromStr for TaskResult {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unspecified" => Ok(TaskResult::Unspecified),
            "success" => Ok(TaskResult::Success),
            "failure" => Ok(TaskResult::Failure),
            "cancelled" => Ok(TaskResult::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown task result: {}", other))),
        }
    }
}

/// Progress of one step inside a task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepState {
    pub index: i64,
    #[serde(default)]
    pub result: TaskResult,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// First log row of the step.
    #[serde(default)]
    pub log_index: i64,
    #[serde(default)]
    pub log_length: i64,
}

/// The runtime record of a job claimed by a runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: ResourceId,
    pub job_id: ResourceId,
    pub runner_id: ResourceId,
    pub repo_id: RepoId,
    pub owner_id: OwnerId,
    pub attempt: i32,
    pub result: TaskResult,
    pub steps: Vec<StepState>,
    /// Number of log rows durably stored; the next append must start here.
    pub log_length: i64,
    /// The runner declared that no more log rows will follow.
    pub log_closed: bool,
    pub started_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    /// Last time the runner reported state or logs for the task.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn is_stopped(&self) -> bool {
        self.stopped_at.is_some()
    }
}

/// A state report from the runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskState {
    #[serde(default)]
    pub result: TaskResult,
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<StepState>,
}

/// One log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRow {
    pub timestamp: DateTime<Utc>,
    pub content: String,
}

/// How an append lines up against the rows already stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogAppend {
    /// Leading rows of the batch that are already stored.
    pub skip: usize,
    /// Acknowledged length once the remaining rows are stored.
    pub ack_index: i64,
}

impl LogAppend {
    /// Line up `count` rows starting at `start_index` against `stored` rows.
    ///
    /// Rows overlapping what is stored are coalesced; a gap is rejected with the
    /// index the runner has to resume from.
    pub fn plan(stored: i64, start_index: i64, count: usize) -> Result<Self> {
        if start_index < 0 || start_index > stored {
            return Err(Error::LogOutOfOrder {
                expected: stored,
                got: start_index,
            });
        }
        let end = start_index + count as i64;
        if end <= stored {
            return Ok(Self {
                skip: count,
                ack_index: stored,
            });
        }
        Ok(Self {
            skip: (stored - start_index) as usize,
            ack_index: end,
        })
    }
}
