//! Run and job repository.
//!
//! Owns every job status transition except task completion, and bumps the
//! task versions in the same transaction whenever a job becomes claimable or a
//! grouped job stops holding its concurrency group.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hopper_core::concurrency::GroupKey;
use hopper_core::{
    Job, NewJob, NewRun, RepoId, ResourceId, Run, RunnerScope, Status, Task, UserId,
};
use sqlx::{PgConnection, PgPool};

use super::task::TaskRecord;
use super::{bump_task_versions, refresh_run_status};
use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
struct RunRecord {
    id: uuid::Uuid,
    repo_id: i64,
    owner_id: i64,
    event: String,
    commit_sha: String,
    git_ref: String,
    workflow_id: String,
    trigger_user_id: i64,
    is_fork_pull_request: bool,
    need_approval: bool,
    approved_by: Option<i64>,
    status: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RunRecord> for Run {
    type Error = DbError;

    fn try_from(record: RunRecord) -> DbResult<Self> {
        Ok(Run {
            id: ResourceId::from_uuid(record.id),
            repo_id: record.repo_id,
            owner_id: record.owner_id,
            event: record.event.parse()?,
            commit_sha: record.commit_sha,
            git_ref: record.git_ref,
            workflow_id: record.workflow_id,
            trigger_user_id: record.trigger_user_id,
            is_fork_pull_request: record.is_fork_pull_request,
            need_approval: record.need_approval,
            approved_by: record.approved_by,
            status: record.status.parse()?,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct JobRecord {
    id: uuid::Uuid,
    run_id: uuid::Uuid,
    repo_id: i64,
    owner_id: i64,
    job_index: i64,
    name: String,
    runs_on: Vec<String>,
    concurrency_group: Option<String>,
    concurrency_type: String,
    status: String,
    task_id: Option<uuid::Uuid>,
    attempt: i32,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    stopped_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRecord> for Job {
    type Error = DbError;

    fn try_from(record: JobRecord) -> DbResult<Self> {
        Ok(Job {
            id: ResourceId::from_uuid(record.id),
            run_id: ResourceId::from_uuid(record.run_id),
            repo_id: record.repo_id,
            owner_id: record.owner_id,
            index: record.job_index,
            name: record.name,
            runs_on: record.runs_on,
            concurrency_group: record.concurrency_group,
            concurrency_type: record.concurrency_type.parse()?,
            status: record.status.parse()?,
            task_id: record.task_id.map(ResourceId::from_uuid),
            attempt: record.attempt,
            created_at: record.created_at,
            started_at: record.started_at,
            stopped_at: record.stopped_at,
        })
    }
}

fn into_jobs(records: Vec<JobRecord>) -> DbResult<Vec<Job>> {
    records.into_iter().map(Job::try_from).collect()
}

#[async_trait]
pub trait RunRepo: Send + Sync {
    /// Create a run and its jobs. Jobs start `Blocked` when the run needs
    /// approval and `Waiting` otherwise.
    async fn create_run(
        &self,
        run: NewRun,
        need_approval: bool,
        jobs: Vec<NewJob>,
    ) -> DbResult<(Run, Vec<Job>)>;
    async fn get_run(&self, id: ResourceId) -> DbResult<Run>;
    async fn list_run_jobs(&self, run_id: ResourceId) -> DbResult<Vec<Job>>;
    async fn get_job(&self, id: ResourceId) -> DbResult<Job>;

    /// Waiting jobs visible to `scope`, newest first.
    async fn list_waiting_jobs(&self, scope: RunnerScope) -> DbResult<Vec<Job>>;
    /// Waiting and running jobs of the given concurrency groups.
    async fn list_group_members(&self, groups: &[GroupKey]) -> DbResult<Vec<Job>>;
    /// Current task version of `scope`.
    async fn tasks_version(&self, scope: RunnerScope) -> DbResult<i64>;

    /// Move a waiting job to running and create its task.
    ///
    /// Returns `None` when the job is no longer waiting.
    ///
    /// Fails with `NotFound` when the runner no longer exists.
    async fn claim_job(&self, job_id: ResourceId, runner_id: ResourceId) -> DbResult<Option<Task>>;

    /// Clear the approval flag and release blocked jobs.
    ///
    /// Returns `false` when the run was not awaiting approval.
    async fn approve_run(&self, run_id: ResourceId, approved_by: UserId) -> DbResult<bool>;
    /// Clear the approval flag and cancel blocked jobs.
    async fn deny_run(&self, run_id: ResourceId, denied_by: UserId) -> DbResult<bool>;
    /// Runs of `user_id` in `repo_id` still awaiting approval.
    async fn list_runs_awaiting_approval(
        &self,
        repo_id: RepoId,
        user_id: UserId,
    ) -> DbResult<Vec<ResourceId>>;

    /// Cancel every unfinished job of a run, stopping running tasks.
    async fn cancel_run(&self, run_id: ResourceId) -> DbResult<Vec<Job>>;
    /// Cancel unfinished jobs of other runs in a concurrency group.
    async fn cancel_superseded(
        &self,
        repo_id: RepoId,
        group: &str,
        keep_run: ResourceId,
    ) -> DbResult<Vec<Job>>;
}

/// PostgreSQL implementation of RunRepo.
pub struct PgRunRepo {
    pool: PgPool,
}

impl PgRunRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_run(conn: &mut PgConnection, id: ResourceId) -> DbResult<Run> {
        sqlx::query_as::<_, RunRecord>("SELECT * FROM runs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(conn)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("run {}", id)))?
            .try_into()
    }

    /// Stop the tasks of cancelled jobs, refresh the affected runs and release
    /// their concurrency groups.
    async fn settle_cancelled(conn: &mut PgConnection, jobs: &[Job]) -> DbResult<()> {
        if jobs.is_empty() {
            return Ok(());
        }
        let job_ids: Vec<uuid::Uuid> = jobs.iter().map(|j| *j.id.as_uuid()).collect();
        sqlx::query(
            r#"
            UPDATE tasks SET result = 'cancelled', stopped_at = NOW(), updated_at = NOW()
            WHERE job_id = ANY($1) AND stopped_at IS NULL
            "#,
        )
        .bind(&job_ids)
        .execute(&mut *conn)
        .await?;

        let mut run_ids: Vec<ResourceId> = jobs.iter().map(|j| j.run_id).collect();
        run_ids.sort();
        run_ids.dedup();
        for run_id in run_ids {
            refresh_run_status(&mut *conn, run_id).await?;
        }

        let mut scopes: Vec<(i64, i64)> = jobs
            .iter()
            .filter(|j| j.group().is_some())
            .map(|j| (j.owner_id, j.repo_id))
            .collect();
        scopes.sort();
        scopes.dedup();
        for (owner_id, repo_id) in scopes {
            bump_task_versions(&mut *conn, owner_id, repo_id).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RunRepo for PgRunRepo {
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
        let run_id = uuid::Uuid::now_v7();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO runs (id, repo_id, owner_id, event, commit_sha, git_ref, workflow_id,
                              trigger_user_id, is_fork_pull_request, need_approval, status,
                              created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW(), NOW())
            "#,
        )
        .bind(run_id)
        .bind(run.repo_id)
        .bind(run.owner_id)
        .bind(run.event.as_str())
        .bind(&run.commit_sha)
        .bind(&run.git_ref)
        .bind(&run.workflow_id)
        .bind(run.trigger_user_id)
        .bind(run.is_fork_pull_request)
        .bind(need_approval)
        .bind(initial.as_str())
        .execute(&mut *tx)
        .await?;

        let mut created = Vec::with_capacity(jobs.len());
        for job in jobs {
            let record = sqlx::query_as::<_, JobRecord>(
                r#"
                INSERT INTO jobs (id, run_id, repo_id, owner_id, name, runs_on,
                                  concurrency_group, concurrency_type, status, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
                RETURNING *
                "#,
            )
            .bind(uuid::Uuid::now_v7())
            .bind(run_id)
            .bind(run.repo_id)
            .bind(run.owner_id)
            .bind(&job.name)
            .bind(&job.runs_on)
            .bind(job.concurrency_group.as_deref().filter(|g| !g.is_empty()))
            .bind(job.concurrency_type.as_str())
            .bind(initial.as_str())
            .fetch_one(&mut *tx)
            .await?;
            created.push(Job::try_from(record)?);
        }

        if !need_approval && !created.is_empty() {
            bump_task_versions(&mut tx, run.owner_id, run.repo_id).await?;
        }
        refresh_run_status(&mut tx, ResourceId::from_uuid(run_id)).await?;
        let run = Self::fetch_run(&mut tx, ResourceId::from_uuid(run_id)).await?;

        tx.commit().await?;
        Ok((run, created))
    }

    async fn get_run(&self, id: ResourceId) -> DbResult<Run> {
        let mut conn = self.pool.acquire().await?;
        Self::fetch_run(&mut conn, id).await
    }

    async fn list_run_jobs(&self, run_id: ResourceId) -> DbResult<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            "SELECT * FROM jobs WHERE run_id = $1 ORDER BY job_index",
        )
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        into_jobs(records)
    }

    async fn get_job(&self, id: ResourceId) -> DbResult<Job> {
        sqlx::query_as::<_, JobRecord>("SELECT * FROM jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?
            .try_into()
    }

    async fn list_waiting_jobs(&self, scope: RunnerScope) -> DbResult<Vec<Job>> {
        let (owner_id, repo_id) = scope.to_columns();
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM jobs
            WHERE status = 'waiting'
              AND ($1::BIGINT IS NULL OR owner_id = $1)
              AND ($2::BIGINT IS NULL OR repo_id = $2)
            ORDER BY job_index DESC
            "#,
        )
        .bind(owner_id)
        .bind(repo_id)
        .fetch_all(&self.pool)
        .await?;
        into_jobs(records)
    }

    async fn list_group_members(&self, groups: &[GroupKey]) -> DbResult<Vec<Job>> {
        if groups.is_empty() {
            return Ok(Vec::new());
        }
        let (repo_ids, names): (Vec<i64>, Vec<String>) = groups.iter().cloned().unzip();
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT * FROM jobs
            WHERE status IN ('waiting', 'running')
              AND (repo_id, concurrency_group) IN (
                  SELECT * FROM UNNEST($1::BIGINT[], $2::TEXT[])
              )
            ORDER BY job_index
            "#,
        )
        .bind(&repo_ids)
        .bind(&names)
        .fetch_all(&self.pool)
        .await?;
        into_jobs(records)
    }

    async fn tasks_version(&self, scope: RunnerScope) -> DbResult<i64> {
        let (owner_id, repo_id) = scope.version_key();
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM tasks_versions WHERE owner_id = $1 AND repo_id = $2",
        )
        .bind(owner_id)
        .bind(repo_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(version.unwrap_or(0))
    }

    async fn claim_job(&self, job_id: ResourceId, runner_id: ResourceId) -> DbResult<Option<Task>> {
        let task_id = uuid::Uuid::now_v7();
        let mut tx = self.pool.begin().await?;

        // Holds off a concurrent delete of the runner until the claim commits.
        let runner: Option<uuid::Uuid> =
            sqlx::query_scalar("SELECT id FROM runners WHERE id = $1 FOR SHARE")
                .bind(runner_id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;
        if runner.is_none() {
            return Err(DbError::NotFound(format!("runner {}", runner_id)));
        }

        let claimed = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs
            SET status = 'running', task_id = $2, attempt = attempt + 1, started_at = NOW()
            WHERE id = $1 AND status = 'waiting'
            RETURNING *
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?;

        // Lost the race; dropping the transaction rolls it back.
        let Some(job) = claimed else {
            return Ok(None);
        };
        let job = Job::try_from(job)?;

        let task = sqlx::query_as::<_, TaskRecord>(
            r#"
            INSERT INTO tasks (id, job_id, runner_id, repo_id, owner_id, attempt, started_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, NOW(), NOW())
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(job.id.as_uuid())
        .bind(runner_id.as_uuid())
        .bind(job.repo_id)
        .bind(job.owner_id)
        .bind(job.attempt)
        .fetch_one(&mut *tx)
        .await?;

        refresh_run_status(&mut tx, job.run_id).await?;
        tx.commit().await?;
        Ok(Some(task.try_into()?))
    }

    async fn approve_run(&self, run_id: ResourceId, approved_by: UserId) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let approved: Option<(i64, i64)> = sqlx::query_as(
            r#"
            UPDATE runs SET need_approval = FALSE, approved_by = $2, updated_at = NOW()
            WHERE id = $1 AND need_approval
            RETURNING owner_id, repo_id
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(approved_by)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((owner_id, repo_id)) = approved else {
            Self::fetch_run(&mut tx, run_id).await?;
            return Ok(false);
        };

        let released = sqlx::query(
            "UPDATE jobs SET status = 'waiting' WHERE run_id = $1 AND status = 'blocked'",
        )
        .bind(run_id.as_uuid())
        .execute(&mut *tx)
        .await?;

        if released.rows_affected() > 0 {
            bump_task_versions(&mut tx, owner_id, repo_id).await?;
        }
        refresh_run_status(&mut tx, run_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn deny_run(&self, run_id: ResourceId, denied_by: UserId) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let denied = sqlx::query(
            r#"
            UPDATE runs SET need_approval = FALSE, approved_by = $2, updated_at = NOW()
            WHERE id = $1 AND need_approval
            "#,
        )
        .bind(run_id.as_uuid())
        .bind(denied_by)
        .execute(&mut *tx)
        .await?;

        if denied.rows_affected() == 0 {
            Self::fetch_run(&mut tx, run_id).await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE jobs SET status = 'cancelled', stopped_at = NOW()
            WHERE run_id = $1 AND status = 'blocked'
            "#,
        )
        .bind(run_id.as_uuid())
        .execute(&mut *tx)
        .await?;

        refresh_run_status(&mut tx, run_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn list_runs_awaiting_approval(
        &self,
        repo_id: RepoId,
        user_id: UserId,
    ) -> DbResult<Vec<ResourceId>> {
        let ids: Vec<uuid::Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM runs
            WHERE repo_id = $1 AND trigger_user_id = $2 AND need_approval
            ORDER BY created_at
            "#,
        )
        .bind(repo_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ResourceId::from_uuid).collect())
    }

    async fn cancel_run(&self, run_id: ResourceId) -> DbResult<Vec<Job>> {
        let mut tx = self.pool.begin().await?;
        Self::fetch_run(&mut tx, run_id).await?;

        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs SET status = 'cancelled', stopped_at = NOW()
            WHERE run_id = $1 AND status IN ('blocked', 'waiting', 'running')
            RETURNING *
            "#,
        )
        .bind(run_id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;
        let jobs = into_jobs(records)?;

        sqlx::query("UPDATE runs SET need_approval = FALSE, updated_at = NOW() WHERE id = $1")
            .bind(run_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        Self::settle_cancelled(&mut tx, &jobs).await?;

        tx.commit().await?;
        Ok(jobs)
    }

    async fn cancel_superseded(
        &self,
        repo_id: RepoId,
        group: &str,
        keep_run: ResourceId,
    ) -> DbResult<Vec<Job>> {
        let mut tx = self.pool.begin().await?;

        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            UPDATE jobs SET status = 'cancelled', stopped_at = NOW()
            WHERE repo_id = $1 AND concurrency_group = $2 AND run_id <> $3
              AND status IN ('blocked', 'waiting', 'running')
            RETURNING *
            "#,
        )
        .bind(repo_id)
        .bind(group)
        .bind(keep_run.as_uuid())
        .fetch_all(&mut *tx)
        .await?;
        let jobs = into_jobs(records)?;

        Self::settle_cancelled(&mut tx, &jobs).await?;
        tx.commit().await?;
        Ok(jobs)
    }
}
