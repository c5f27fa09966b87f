//! Schedulable jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, OwnerId, RepoId, ResourceId, Result, Status};

/// How a job behaves relative to others in its concurrency group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyType {
    /// Serialize behind older unfinished runs of the group.
    #[default]
    QueueBehind,
    /// Serialize, and cancel older unfinished runs of the group when enqueued.
    CancelInProgress,
    /// Never held back by the group.
    Unlimited,
}

impl ConcurrencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConcurrencyType::QueueBehind => "queue_behind",
            ConcurrencyType::CancelInProgress => "cancel_in_progress",
            ConcurrencyType::Unlimited => "unlimited",
        }
    }
}

impl std::str::FromStr for ConcurrencyType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queue_behind" => Ok(ConcurrencyType::QueueBehind),
            "cancel_in_progress" => Ok(ConcurrencyType::CancelInProgress),
            "unlimited" => Ok(ConcurrencyType::Unlimited),
            other => Err(Error::InvalidInput(format!(
                "unknown concurrency type: {}",
                other
            ))),
        }
    }
}

/// One schedulable unit of work within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    pub run_id: ResourceId,
    /// Denormalized from the run.
    pub repo_id: RepoId,
    /// Denormalized from the run.
    pub owner_id: OwnerId,
    /// Global creation order; lower is older.
    pub index: i64,
    pub name: String,
    /// Labels of which a runner must declare at least one.
    pub runs_on: Vec<String>,
    pub concurrency_group: Option<String>,
    pub concurrency_type: ConcurrencyType,
    pub status: Status,
    /// The task currently executing this job, once claimed.
    pub task_id: Option<ResourceId>,
    pub attempt: i32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

impl Job {
    /// The concurrency group, with empty groups treated as absent.
    pub fn group(&self) -> Option<&str> {
        self.concurrency_group.as_deref().filter(|g| !g.is_empty())
    }
}

/// Input for creating a job inside a new run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    #[serde(default)]
    pub runs_on: Vec<String>,
    #[serde(default)]
    pub concurrency_group: Option<String>,
    #[serde(default)]
    pub concurrency_type: ConcurrencyType,
}
