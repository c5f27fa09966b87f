//! In-memory store implementing every repository trait.
//!
//! Backs `storage "memory"` and the test suites. A single lock guards all
//! tables, so every operation is atomic the way a PostgreSQL transaction is.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hopper_core::concurrency::GroupKey;
use hopper_core::task::{LogRow, TaskState};
use hopper_core::{
    Job, NewJob, NewRun, OwnerId, RepoId, ResourceId, Run, Runner, RunnerScope, Status, Task,
    TaskResult, UserId,
};

use crate::{DbError, DbResult, NewRunner, RunRepo, RunnerRepo, TaskRepo, TrustRepo};

#[derive(Default)]
struct MemoryState {
    runs: HashMap<ResourceId, Run>,
    jobs: HashMap<ResourceId, Job>,
    next_job_index: i64,
    runners: HashMap<ResourceId, Runner>,
    /// token hash -> (scope, active)
    registration_tokens: HashMap<String, (RunnerScope, bool)>,
    tasks: HashMap<ResourceId, Task>,
    outputs: HashMap<ResourceId, BTreeMap<String, String>>,
    logs: HashMap<ResourceId, Vec<LogRow>>,
    /// (repo, user) -> trusted_by
    trusted: HashMap<(RepoId, UserId), UserId>,
    versions: HashMap<(OwnerId, RepoId), i64>,
}

impl MemoryState {
    fn bump_versions(&mut self, owner_id: OwnerId, repo_id: RepoId) {
        for key in [(0, 0), (owner_id, 0), (0, repo_id)] {
            *self.versions.entry(key).or_insert(0) += 1;
        }
    }

    fn refresh_run(&mut self, run_id: ResourceId) {
        let status = Status::aggregate(
            self.jobs
                .values()
                .filter(|j| j.run_id == run_id)
                .map(|j| j.status),
        );
        if let Some(run) = self.runs.get_mut(&run_id) {
            run.status = status;
            run.updated_at = Utc::now();
        }
    }

    fn run(&self, id: ResourceId) -> DbResult<&Run> {
        self.runs
            .get(&id)
            .ok_or_else(|| DbError::NotFound(format!("run {}", id)))
    }

    /// Cancel the jobs matching `pred`, then stop their tasks, refresh their runs
    /// and release their concurrency groups.
    fn cancel_jobs_where<F>(&mut self, pred: F) -> Vec<Job>
    where
        F: Fn(&Job) -> bool,
    {
        let now = Utc::now();
        let mut cancelled = Vec::new();
        for job in self.jobs.values_mut() {
            if pred(&*job) && !job.status.is_terminal() {
                job.status = Status::Cancelled;
                job.stopped_at = Some(now);
                cancelled.push(job.clone());
            }
        }
        cancelled.sort_by_key(|j| j.index);

        for job in &cancelled {
            if let Some(task) = self.tasks.values_mut().find(|t| t.job_id == job.id) {
                if !task.is_stopped() {
                    task.result = TaskResult::Cancelled;
                    task.stopped_at = Some(now);
                    task.updated_at = now;
                }
            }
        }

        let mut run_ids: Vec<ResourceId> = cancelled.iter().map(|j| j.run_id).collect();
        run_ids.sort();
        run_ids.dedup();
        for run_id in run_ids {
            self.refresh_run(run_id);
        }

        let mut scopes: Vec<(OwnerId, RepoId)> = cancelled
            .iter()
            .filter(|j| j.group().is_some())
            .map(|j| (j.owner_id, j.repo_id))
            .collect();
        scopes.sort();
        scopes.dedup();
        for (owner_id, repo_id) in scopes {
            self.bump_versions(owner_id, repo_id);
        }
        cancelled
    }
}

/// Process-local implementation of the repository traits.
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    fn read(&self) -> DbResult<RwLockReadGuard<'_, MemoryState>> {
        self.state
            .read()
            .map_err(|e| DbError::Internal(e.to_string()))
    }

    fn write(&self) -> DbResult<RwLockWriteGuard<'_, MemoryState>> {
        self.state
            .write()
            .map_err(|e| DbError::Internal(e.to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunnerRepo for MemoryStore {
    async fn issue_registration_token(&self, scope: RunnerScope, token_hash: &str) -> DbResult<()> {
        let mut state = self.write()?;
        for (token_scope, active) in state.registration_tokens.values_mut() {
            if *token_scope == scope {
                *active = false;
            }
        }
        state
            .registration_tokens
            .insert(token_hash.to_string(), (scope, true));
        Ok(())
    }

    async fn registration_token_scope(&self, token_hash: &str) -> DbResult<Option<RunnerScope>> {
        let state = self.read()?;
        Ok(state
            .registration_tokens
            .get(token_hash)
            .filter(|(_, active)| *active)
            .map(|(scope, _)| *scope))
    }

    async fn upsert_runner(&self, runner: NewRunner) -> DbResult<Runner> {
        let mut state = self.write()?;
        if let Some(existing) = state
            .runners
            .values_mut()
            .find(|r| r.scope == runner.scope && r.name == runner.name)
        {
            existing.labels = runner.labels;
            existing.version = runner.version;
            existing.token_hash = runner.token_hash;
            existing.token_salt = runner.token_salt;
            return Ok(existing.clone());
        }

        let created = Runner {
            id: ResourceId::new(),
            name: runner.name,
            scope: runner.scope,
            labels: runner.labels,
            version: runner.version,
            token_hash: runner.token_hash,
            token_salt: runner.token_salt,
            last_online: None,
            last_active: None,
            created_at: Utc::now(),
        };
        state.runners.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_runner(&self, id: ResourceId) -> DbResult<Runner> {
        let state = self.read()?;
        state
            .runners
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("runner {}", id)))
    }

    async fn list_runners(&self, scope: RunnerScope) -> DbResult<Vec<Runner>> {
        let state = self.read()?;
        let mut runners: Vec<Runner> = state
            .runners
            .values()
            .filter(|r| scope == RunnerScope::Global || r.scope == scope)
            .cloned()
            .collect();
        runners.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(runners)
    }

    async fn delete_runner(&self, id: ResourceId) -> DbResult<()> {
        let mut state = self.write()?;
        state
            .runners
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| DbError::NotFound(format!("runner {}", id)))
    }

    async fn touch_runner(&self, id: ResourceId, active: bool) -> DbResult<()> {
        let mut state = self.write()?;
        let runner = state
            .runners
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("runner {}", id)))?;
        let now = Utc::now();
        runner.last_online = Some(now);
        if active {
            runner.last_active = Some(now);
        }
        Ok(())
    }
}

#[async_trait]
impl RunRepo for MemoryStore {
    async fn create_run(
        &self,
        run: NewRun,
        need_approval: bool,
        jobs: Vec<NewJob>,
    ) -> DbResult<(Run, Vec<Job>)> {
        let initial = if need_approval {
            Status::Blocked
        } else {
            Status::Waiting
        };
        let now = Utc::now();
        let mut state = self.write()?;

        let created_run = Run {
            id: ResourceId::new(),
            repo_id: run.repo_id,
            owner_id: run.owner_id,
            event: run.event,
            commit_sha: run.commit_sha,
            git_ref: run.git_ref,
            workflow_id: run.workflow_id,
            trigger_user_id: run.trigger_user_id,
            is_fork_pull_request: run.is_fork_pull_request,
            need_approval,
            approved_by: None,
            status: initial,
            created_at: now,
            updated_at: now,
        };
        state.runs.insert(created_run.id, created_run.clone());

        let mut created = Vec::with_capacity(jobs.len());
        for job in jobs {
            state.next_job_index += 1;
            let job = Job {
                id: ResourceId::new(),
                run_id: created_run.id,
                repo_id: created_run.repo_id,
                owner_id: created_run.owner_id,
                index: state.next_job_index,
                name: job.name,
                runs_on: job.runs_on,
                concurrency_group: job.concurrency_group.filter(|g| !g.is_empty()),
                concurrency_type: job.concurrency_type,
                status: initial,
                task_id: None,
                attempt: 0,
                created_at: now,
                started_at: None,
                stopped_at: None,
            };
            state.jobs.insert(job.id, job.clone());
            created.push(job);
        }

        if !need_approval && !created.is_empty() {
            state.bump_versions(created_run.owner_id, created_run.repo_id);
        }
        state.refresh_run(created_run.id);
        let created_run = state.run(created_run.id)?.clone();
        Ok((created_run, created))
    }

    async fn get_run(&self, id: ResourceId) -> DbResult<Run> {
        let state = self.read()?;
        state.run(id).cloned()
    }

    async fn list_run_jobs(&self, run_id: ResourceId) -> DbResult<Vec<Job>> {
        let state = self.read()?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.run_id == run_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.index);
        Ok(jobs)
    }

    async fn get_job(&self, id: ResourceId) -> DbResult<Job> {
        let state = self.read()?;
        state
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn list_waiting_jobs(&self, scope: RunnerScope) -> DbResult<Vec<Job>> {
        let state = self.read()?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.status == Status::Waiting && scope.admits(j.owner_id, j.repo_id))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.index.cmp(&a.index));
        Ok(jobs)
    }

    async fn list_group_members(&self, groups: &[GroupKey]) -> DbResult<Vec<Job>> {
        let state = self.read()?;
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.status.is_unfinished())
            .filter(|j| {
                j.group()
                    .is_some_and(|g| groups.iter().any(|(repo, name)| *repo == j.repo_id && name == g))
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.index);
        Ok(jobs)
    }

    async fn tasks_version(&self, scope: RunnerScope) -> DbResult<i64> {
        let state = self.read()?;
        Ok(state
            .versions
            .get(&scope.version_key())
            .copied()
            .unwrap_or(0))
    }

    async fn claim_job(&self, job_id: ResourceId, runner_id: ResourceId) -> DbResult<Option<Task>> {
        let mut state = self.write()?;
        let now = Utc::now();
        let task_id = ResourceId::new();

        if !state.runners.contains_key(&runner_id) {
            return Err(DbError::NotFound(format!("runner {}", runner_id)));
        }
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.status != Status::Waiting {
            return Ok(None);
        }
        job.status = Status::Running;
        job.task_id = Some(task_id);
        job.attempt += 1;
        job.started_at = Some(now);

        let task = Task {
            id: task_id,
            job_id,
            runner_id,
            repo_id: job.repo_id,
            owner_id: job.owner_id,
            attempt: job.attempt,
            result: TaskResult::Unspecified,
            steps: Vec::new(),
            log_length: 0,
            log_closed: false,
            started_at: now,
            stopped_at: None,
            updated_at: now,
        };
        let run_id = job.run_id;
        state.tasks.insert(task_id, task.clone());
        state.refresh_run(run_id);
        Ok(Some(task))
    }

    async fn approve_run(&self, run_id: ResourceId, approved_by: UserId) -> DbResult<bool> {
        let mut state = self.write()?;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| DbError::NotFound(format!("run {}", run_id)))?;
        if !run.need_approval {
            return Ok(false);
        }
        run.need_approval = false;
        run.approved_by = Some(approved_by);
        let (owner_id, repo_id) = (run.owner_id, run.repo_id);

        let mut released = false;
        for job in state.jobs.values_mut() {
            if job.run_id == run_id && job.status == Status::Blocked {
                job.status = Status::Waiting;
                released = true;
            }
        }
        if released {
            state.bump_versions(owner_id, repo_id);
        }
        state.refresh_run(run_id);
        Ok(true)
    }

    async fn deny_run(&self, run_id: ResourceId, denied_by: UserId) -> DbResult<bool> {
        let mut state = self.write()?;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| DbError::NotFound(format!("run {}", run_id)))?;
        if !run.need_approval {
            return Ok(false);
        }
        run.need_approval = false;
        run.approved_by = Some(denied_by);

        let now = Utc::now();
        for job in state.jobs.values_mut() {
            if job.run_id == run_id && job.status == Status::Blocked {
                job.status = Status::Cancelled;
                job.stopped_at = Some(now);
            }
        }
        state.refresh_run(run_id);
        Ok(true)
    }

    async fn list_runs_awaiting_approval(
        &self,
        repo_id: RepoId,
        user_id: UserId,
    ) -> DbResult<Vec<ResourceId>> {
        let state = self.read()?;
        let mut runs: Vec<&Run> = state
            .runs
            .values()
            .filter(|r| r.repo_id == repo_id && r.trigger_user_id == user_id && r.need_approval)
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs.into_iter().map(|r| r.id).collect())
    }

    async fn cancel_run(&self, run_id: ResourceId) -> DbResult<Vec<Job>> {
        let mut state = self.write()?;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| DbError::NotFound(format!("run {}", run_id)))?;
        run.need_approval = false;
        Ok(state.cancel_jobs_where(|j| j.run_id == run_id))
    }

    async fn cancel_superseded(
        &self,
        repo_id: RepoId,
        group: &str,
        keep_run: ResourceId,
    ) -> DbResult<Vec<Job>> {
        let mut state = self.write()?;
        Ok(state.cancel_jobs_where(|j| {
            j.repo_id == repo_id && j.group() == Some(group) && j.run_id != keep_run
        }))
    }
}

#[async_trait]
impl TaskRepo for MemoryStore {
    async fn get_task(&self, id: ResourceId) -> DbResult<Task> {
        let state = self.read()?;
        state
            .tasks
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))
    }

    async fn update_task_state(&self, id: ResourceId, state_report: &TaskState) -> DbResult<Task> {
        let mut state = self.write()?;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))?;
        if task.is_stopped() {
            return Ok(task.clone());
        }

        task.steps = state_report.steps.clone();
        task.updated_at = Utc::now();
        if !state_report.result.is_final() {
            return Ok(task.clone());
        }

        let stopped_at = state_report.stopped_at.unwrap_or_else(Utc::now);
        task.result = state_report.result;
        task.stopped_at = Some(stopped_at);
        let updated = task.clone();

        let settled = match state.jobs.get_mut(&updated.job_id) {
            Some(job) if job.status == Status::Running => {
                job.status = state_report.result.job_status();
                job.stopped_at = Some(stopped_at);
                Some((job.run_id, job.owner_id, job.repo_id, job.group().is_some()))
            }
            _ => None,
        };
        if let Some((run_id, owner_id, repo_id, grouped)) = settled {
            state.refresh_run(run_id);
            if grouped {
                state.bump_versions(owner_id, repo_id);
            }
        }
        Ok(updated)
    }

    async fn insert_outputs(
        &self,
        id: ResourceId,
        outputs: &BTreeMap<String, String>,
    ) -> DbResult<Vec<String>> {
        let mut state = self.write()?;
        if !state.tasks.contains_key(&id) {
            return Err(DbError::NotFound(format!("task {}", id)));
        }
        let stored = state.outputs.entry(id).or_default();
        for (key, value) in outputs {
            stored.entry(key.clone()).or_insert_with(|| value.clone());
        }
        Ok(outputs.keys().cloned().collect())
    }

    async fn append_log(
        &self,
        id: ResourceId,
        at_index: i64,
        rows: &[LogRow],
        close: bool,
    ) -> DbResult<Option<i64>> {
        let mut state = self.write()?;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))?;
        if task.log_length != at_index {
            return Ok(None);
        }
        task.log_length += rows.len() as i64;
        task.log_closed |= close;
        task.updated_at = Utc::now();
        let length = task.log_length;

        state.logs.entry(id).or_default().extend_from_slice(rows);
        Ok(Some(length))
    }

    async fn read_log(&self, id: ResourceId, offset: i64, limit: i64) -> DbResult<Vec<LogRow>> {
        let state = self.read()?;
        let rows = state.logs.get(&id).map(Vec::as_slice).unwrap_or_default();
        let offset = usize::try_from(offset.max(0)).unwrap_or(usize::MAX);
        let limit = usize::try_from(limit.max(0)).unwrap_or(usize::MAX);
        Ok(rows.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn expire_stale_tasks(&self, silent_since: DateTime<Utc>) -> DbResult<Vec<Task>> {
        let mut state = self.write()?;
        let now = Utc::now();

        let mut expired = Vec::new();
        for task in state.tasks.values_mut() {
            if !task.is_stopped() && task.updated_at < silent_since {
                task.result = TaskResult::Failure;
                task.stopped_at = Some(now);
                task.updated_at = now;
                expired.push(task.clone());
            }
        }

        let mut run_ids = Vec::new();
        let mut scopes = Vec::new();
        for task in &expired {
            if let Some(job) = state.jobs.get_mut(&task.job_id) {
                if job.status == Status::Running {
                    job.status = Status::Failure;
                    job.stopped_at = Some(now);
                    run_ids.push(job.run_id);
                    if job.group().is_some() {
                        scopes.push((job.owner_id, job.repo_id));
                    }
                }
            }
        }
        run_ids.sort();
        run_ids.dedup();
        for run_id in run_ids {
            state.refresh_run(run_id);
        }
        scopes.sort();
        scopes.dedup();
        for (owner_id, repo_id) in scopes {
            state.bump_versions(owner_id, repo_id);
        }
        Ok(expired)
    }
}

#[async_trait]
impl TrustRepo for MemoryStore {
    async fn is_always_trusted(&self, repo_id: RepoId, user_id: UserId) -> DbResult<bool> {
        let state = self.read()?;
        Ok(state.trusted.contains_key(&(repo_id, user_id)))
    }

    async fn set_always_trusted(
        &self,
        repo_id: RepoId,
        user_id: UserId,
        trusted_by: UserId,
    ) -> DbResult<()> {
        let mut state = self.write()?;
        state.trusted.insert((repo_id, user_id), trusted_by);
        Ok(())
    }

    async fn revoke_trust(&self, repo_id: RepoId, user_id: UserId) -> DbResult<bool> {
        let mut state = self.write()?;
        Ok(state.trusted.remove(&(repo_id, user_id)).is_some())
    }
}
