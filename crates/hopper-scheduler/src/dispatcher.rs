//! Task dispatcher: the runner-facing long-poll protocol.
//!
//! A fetch compares the runner's last known task version with the current one
//! for its scope. A stale version is evaluated at once; an unchanged one waits
//! for a wake-up, a poll tick or the deadline. Version `0` means "check now,
//! don't wait".

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use hopper_config::ActionsConfig;
use hopper_core::task::{LogAppend, LogRow, TaskState};
use hopper_core::{Error, Job, ResourceId, Result, Run, Runner, Task};
use hopper_db::{DbError, RunRepo, RunnerRepo, Stores, TaskRepo};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{JobMatcher, VersionNotifier};

/// Attempts at appending a log batch when another append lands first.
const LOG_APPEND_ATTEMPTS: usize = 3;

/// Longest pause between two sweeps for silent tasks.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchRequest {
    /// Version echoed from the previous fetch; `0` asks for an immediate check.
    #[serde(default)]
    pub tasks_version: i64,
    /// Tasks the runner can take in this call. Defaults to one.
    #[serde(default)]
    pub capacity: Option<u32>,
    /// Narrows the runner's labels for this call.
    #[serde(default)]
    pub labels: Vec<String>,
}

/// A claimed job, with what the runner needs to execute it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub task: Task,
    pub job: Job,
    pub run: Run,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FetchResponse {
    pub task: Option<Assignment>,
    #[serde(default)]
    pub additional_tasks: Vec<Assignment>,
    pub tasks_version: i64,
}

impl FetchResponse {
    fn from_assignments(mut assignments: Vec<Assignment>, tasks_version: i64) -> Self {
        let task = if assignments.is_empty() {
            None
        } else {
            Some(assignments.remove(0))
        };
        Self {
            task,
            additional_tasks: assignments,
            tasks_version,
        }
    }
}

/// A task state report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub task_id: ResourceId,
    #[serde(default)]
    pub state: TaskState,
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskUpdateResponse {
    /// The task as stored; a server-side cancellation shows up in its result.
    pub task: Task,
    pub sent_outputs: Vec<String>,
}

/// A batch of log rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogUpdate {
    pub task_id: ResourceId,
    /// Index of the first row of the batch.
    pub index: i64,
    #[serde(default)]
    pub rows: Vec<LogRow>,
    #[serde(default)]
    pub no_more: bool,
}

fn runner_gone(err: DbError, runner: &Runner) -> Error {
    match err {
        DbError::NotFound(_) => {
            warn!(runner_id = %runner.id, "Runner was deleted during the call");
            Error::Unauthorized(format!("unknown runner {}", runner.id))
        }
        other => other.into(),
    }
}

pub struct Dispatcher {
    runs: Arc<dyn RunRepo>,
    tasks: Arc<dyn TaskRepo>,
    runners: Arc<dyn RunnerRepo>,
    matcher: Arc<JobMatcher>,
    notifier: VersionNotifier,
    long_poll_timeout: Duration,
    poll_interval: Duration,
    max_capacity: u32,
    task_expire_after: Duration,
}

impl Dispatcher {
    pub fn new(
        stores: &Stores,
        matcher: Arc<JobMatcher>,
        notifier: VersionNotifier,
        config: &ActionsConfig,
    ) -> Self {
        Self {
            runs: stores.runs.clone(),
            tasks: stores.tasks.clone(),
            runners: stores.runners.clone(),
            matcher,
            notifier,
            long_poll_timeout: config.long_poll_timeout,
            poll_interval: config.poll_interval,
            max_capacity: config.max_task_capacity.max(1),
            task_expire_after: config.task_expire_after,
        }
    }

    /// Claim up to `capacity` jobs for `runner`, waiting for work if there is none.
    ///
    /// Returns an empty response carrying the last observed version when the
    /// wait times out. Dropping the future abandons the wait.
    pub async fn fetch_task(&self, runner: &Runner, request: FetchRequest) -> Result<FetchResponse> {
        let capacity = request.capacity.unwrap_or(1).clamp(1, self.max_capacity) as usize;
        let deadline = Instant::now() + self.long_poll_timeout;
        let mut wake = self.notifier.subscribe();

        if request.tasks_version == 0 {
            self.touch(runner, false).await?;
            let current = self.runs.tasks_version(runner.scope).await?;
            let assignments = self.claim_batch(runner, capacity, &request.labels).await?;
            return Ok(FetchResponse::from_assignments(assignments, current));
        }

        let mut known = request.tasks_version;
        loop {
            self.touch(runner, false).await?;
            let current = self.runs.tasks_version(runner.scope).await?;
            if current != known {
                let assignments = self.claim_batch(runner, capacity, &request.labels).await?;
                if !assignments.is_empty() {
                    return Ok(FetchResponse::from_assignments(assignments, current));
                }
                known = current;
            }

            tokio::select! {
                changed = wake.changed() => {
                    if changed.is_err() {
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(runner_id = %runner.id, tasks_version = known, "Fetch timed out");
                    return Ok(FetchResponse::from_assignments(Vec::new(), known));
                }
            }
        }
    }

    /// Claim jobs one at a time, re-running the matcher after every claim.
    async fn claim_batch(
        &self,
        runner: &Runner,
        capacity: usize,
        label_filter: &[String],
    ) -> Result<Vec<Assignment>> {
        let mut assignments = Vec::new();

        'claim: while assignments.len() < capacity {
            let candidates = self.matcher.available_jobs(runner, label_filter).await?;
            for candidate in candidates {
                let claimed = self
                    .runs
                    .claim_job(candidate.id, runner.id)
                    .await
                    .map_err(|e| runner_gone(e, runner))?;
                let Some(task) = claimed else {
                    debug!(job_id = %candidate.id, runner_id = %runner.id, "Claim lost");
                    continue;
                };
                let job = self.runs.get_job(candidate.id).await?;
                let run = self.runs.get_run(job.run_id).await?;
                info!(
                    task_id = %task.id,
                    job_id = %job.id,
                    run_id = %run.id,
                    runner_id = %runner.id,
                    "Assigned job"
                );
                assignments.push(Assignment { task, job, run });
                continue 'claim;
            }
            break;
        }

        if !assignments.is_empty() {
            self.touch(runner, true).await?;
        }
        Ok(assignments)
    }

    /// Apply a state report and store outputs.
    pub async fn update_task(&self, runner: &Runner, update: TaskUpdate) -> Result<TaskUpdateResponse> {
        let task = self.owned_task(runner, update.task_id).await?;
        let sent_outputs = self.tasks.insert_outputs(task.id, &update.outputs).await?;

        let was_running = !task.is_stopped();
        let task = self.tasks.update_task_state(task.id, &update.state).await?;
        self.touch(runner, true).await?;

        if was_running && task.is_stopped() {
            info!(
                task_id = %task.id,
                job_id = %task.job_id,
                result = task.result.as_str(),
                "Task finished"
            );
            self.notifier.notify();
        }
        Ok(TaskUpdateResponse { task, sent_outputs })
    }

    /// Append log rows, returning how many rows are stored.
    ///
    /// Rows already stored are coalesced. A batch starting past the stored end
    /// is rejected with the index to resume from.
    pub async fn update_log(&self, runner: &Runner, update: LogUpdate) -> Result<i64> {
        for _ in 0..LOG_APPEND_ATTEMPTS {
            let task = self.owned_task(runner, update.task_id).await?;
            let plan = LogAppend::plan(task.log_length, update.index, update.rows.len())?;
            let fresh = &update.rows[plan.skip..];

            if task.log_closed {
                if !fresh.is_empty() {
                    return Err(Error::Conflict(format!("log of task {} is closed", task.id)));
                }
                return Ok(task.log_length);
            }
            if fresh.is_empty() && !update.no_more {
                return Ok(plan.ack_index);
            }

            if let Some(length) = self
                .tasks
                .append_log(task.id, task.log_length, fresh, update.no_more)
                .await?
            {
                self.touch(runner, true).await?;
                return Ok(length);
            }
            debug!(task_id = %task.id, "Log moved during append, retrying");
        }
        Err(Error::Conflict(format!(
            "log of task {} is being appended concurrently",
            update.task_id
        )))
    }

    /// A task and a window of its stored log rows.
    pub async fn read_log(
        &self,
        task_id: ResourceId,
        offset: i64,
        limit: i64,
    ) -> Result<(Task, Vec<LogRow>)> {
        if offset < 0 || limit < 0 {
            return Err(Error::InvalidInput(
                "offset and limit must not be negative".to_string(),
            ));
        }
        let task = self.tasks.get_task(task_id).await?;
        let rows = self.tasks.read_log(task_id, offset, limit).await?;
        Ok((task, rows))
    }

    /// Fail every running task that has not reported since `task_expire_after`
    /// before `now`. Waiting fetches are woken when anything expired.
    pub async fn expire_stale_tasks(&self, now: DateTime<Utc>) -> Result<usize> {
        let window = TimeDelta::from_std(self.task_expire_after).unwrap_or(TimeDelta::MAX);
        let Some(silent_since) = now.checked_sub_signed(window) else {
            return Ok(0);
        };

        let expired = self.tasks.expire_stale_tasks(silent_since).await?;
        for task in &expired {
            warn!(
                task_id = %task.id,
                job_id = %task.job_id,
                runner_id = %task.runner_id,
                "Expired task with no report since {}",
                task.updated_at
            );
        }
        if !expired.is_empty() {
            self.notifier.notify();
        }
        Ok(expired.len())
    }

    /// Sweep for silent tasks until the future is dropped.
    pub async fn run_expiry(&self) {
        let period = EXPIRY_SWEEP_INTERVAL
            .min(self.task_expire_after)
            .max(Duration::from_secs(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = self.expire_stale_tasks(Utc::now()).await {
                warn!(error = %e, "Failed to expire stale tasks");
            }
        }
    }

    /// Record a heartbeat; a runner deleted since it authenticated is rejected.
    async fn touch(&self, runner: &Runner, active: bool) -> Result<()> {
        self.runners
            .touch_runner(runner.id, active)
            .await
            .map_err(|e| runner_gone(e, runner))
    }

    async fn owned_task(&self, runner: &Runner, task_id: ResourceId) -> Result<Task> {
        let task = self.tasks.get_task(task_id).await?;
        if task.runner_id != runner.id {
            return Err(Error::Forbidden(format!(
                "task {} is assigned to another runner",
                task_id
            )));
        }
        Ok(task)
    }
}
