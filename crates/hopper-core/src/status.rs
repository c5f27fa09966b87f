//! Job and run lifecycle.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Status of a job, and the aggregate status of a run.
///
/// ```text
/// Blocked --(trust approved)--> Waiting --(claimed)--> Running --> Success | Failure
/// Blocked | Waiting | Running --(cancelled)--> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting for a trust decision.
    Blocked,
    /// Ready to be claimed by a runner.
    Waiting,
    /// Claimed by a runner and executing as a task.
    Running,
    Success,
    Failure,
    Cancelled,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Success | Status::Failure | Status::Cancelled)
    }

    /// Waiting or running; the statuses that hold a concurrency group.
    pub fn is_unfinished(&self) -> bool {
        matches!(self, Status::Waiting | Status::Running)
    }

    pub fn can_transition_to(&self, next: Status) -> bool {
        matches!(
            (self, next),
            (Status::Blocked, Status::Waiting)
                | (Status::Blocked, Status::Cancelled)
                | (Status::Waiting, Status::Running)
                | (Status::Waiting, Status::Cancelled)
                | (Status::Running, Status::Success)
                | (Status::Running, Status::Failure)
                | (Status::Running, Status::Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Blocked => "blocked",
            Status::Waiting => "waiting",
            Status::Running => "running",
            Status::Success => "success",
            Status::Failure => "failure",
            Status::Cancelled => "cancelled",
        }
    }

    /// Aggregate the statuses of a run's jobs into the run status.
    pub fn aggregate<I>(statuses: I) -> Status
    where
        I: IntoIterator<Item = Status>,
    {
        let mut any = false;
        let mut all_success = true;
        let (mut cancelled, mut failure, mut running, mut waiting) = (false, false, false, false);
        for status in statuses {
            any = true;
            all_success &= status == Status::Success;
            cancelled |= status == Status::Cancelled;
            failure |= status == Status::Failure;
            running |= status == Status::Running;
            waiting |= status == Status::Waiting;
        }
        match () {
            _ if any && all_success => Status::Success,
            _ if cancelled => Status::Cancelled,
            _ if failure => Status::Failure,
            _ if running => Status::Running,
            _ if waiting => Status::Waiting,
            _ => Status::Blocked,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blocked" => Ok(Status::Blocked),
            "waiting" => Ok(Status::Waiting),
            "running" => Ok(Status::Running),
            "success" => Ok(Status::Success),
            "failure" => Ok(Status::Failure),
            "cancelled" => Ok(Status::Cancelled),
            other => Err(Error::InvalidInput(format!("unknown status: {}", other))),
        }
    }
}
