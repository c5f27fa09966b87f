//! Workflow runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, OwnerId, RepoId, ResourceId, Result, Status, UserId};

/// What triggered a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    Push,
    PullRequest,
    WorkflowDispatch,
    Schedule,
}

impl TriggerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEvent::Push => "push",
            TriggerEvent::PullRequest => "pull_request",
            TriggerEvent::WorkflowDispatch => "workflow_dispatch",
            TriggerEvent::Schedule => "schedule",
        }
    }
}

impl std::str::FromStr for TriggerEvent {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "push" => Ok(TriggerEvent::Push),
            "pull_request" => Ok(TriggerEvent::PullRequest),
            "workflow_dispatch" => Ok(TriggerEvent::WorkflowDispatch),
            "schedule" => Ok(TriggerEvent::Schedule),
            other => Err(Error::InvalidInput(format!("unknown trigger event: {}", other))),
        }
    }
}

/// One execution of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: ResourceId,
    pub repo_id: RepoId,
    pub owner_id: OwnerId,
    pub event: TriggerEvent,
    pub commit_sha: String,
    pub git_ref: String,
    pub workflow_id: String,
    /// The contributor whose trust gates this run.
    pub trigger_user_id: UserId,
    pub is_fork_pull_request: bool,
    /// Set at creation when the contributor is untrusted; cleared by any trust decision.
    pub need_approval: bool,
    pub approved_by: Option<UserId>,
    /// Aggregate of the job statuses.
    pub status: Status,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a run, produced by the workflow dispatch front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRun {
    pub repo_id: RepoId,
    pub owner_id: OwnerId,
    pub event: TriggerEvent,
    pub commit_sha: String,
    pub git_ref: String,
    pub workflow_id: String,
    pub trigger_user_id: UserId,
    #[serde(default)]
    pub is_fork_pull_request: bool,
}
