//! Task repository: state reports, outputs and logs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hopper_core::task::{LogRow, StepState, TaskState};
use hopper_core::{ResourceId, Task};
use sqlx::PgPool;

use super::{bump_task_versions, refresh_run_status};
use crate::{DbError, DbResult};

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct TaskRecord {
    id: uuid::Uuid,
    job_id: uuid::Uuid,
    runner_id: uuid::Uuid,
    repo_id: i64,
    owner_id: i64,
    attempt: i32,
    result: String,
    steps: serde_json::Value,
    log_length: i64,
    log_closed: bool,
    started_at: DateTime<Utc>,
    stopped_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TaskRecord> for Task {
    type Error = DbError;

    fn try_from(record: TaskRecord) -> DbResult<Self> {
        let steps: Vec<StepState> = serde_json::from_value(record.steps)
            .map_err(|e| DbError::InvalidData(format!("task {} steps: {}", record.id, e)))?;
        Ok(Task {
            id: ResourceId::from_uuid(record.id),
            job_id: ResourceId::from_uuid(record.job_id),
            runner_id: ResourceId::from_uuid(record.runner_id),
            repo_id: record.repo_id,
            owner_id: record.owner_id,
            attempt: record.attempt,
            result: record.result.parse()?,
            steps,
            log_length: record.log_length,
            log_closed: record.log_closed,
            started_at: record.started_at,
            stopped_at: record.stopped_at,
            updated_at: record.updated_at,
        })
    }
}

#[async_trait]
pub trait TaskRepo: Send + Sync {
    async fn get_task(&self, id: ResourceId) -> DbResult<Task>;

    /// Apply a runner's state report.
    ///
    /// A final result stops the task, settles its job and refreshes the run.
    /// A task that is already stopped is returned unchanged.
    async fn update_task_state(&self, id: ResourceId, state: &TaskState) -> DbResult<Task>;

    /// Store outputs whose key is not stored yet. Returns the keys of
    /// `outputs` that are stored after the call.
    async fn insert_outputs(
        &self,
        id: ResourceId,
        outputs: &BTreeMap<String, String>,
    ) -> DbResult<Vec<String>>;

    /// Append `rows` at `at_index`, provided the stored length still equals it.
    ///
    /// Returns the new length, or `None` if the log moved underneath the caller.
    async fn append_log(
        &self,
        id: ResourceId,
        at_index: i64,
        rows: &[LogRow],
        close: bool,
    ) -> DbResult<Option<i64>>;

    async fn read_log(&self, id: ResourceId, offset: i64, limit: i64) -> DbResult<Vec<LogRow>>;

    /// Stop every running task with no report since `silent_since` as failed.
    ///
    /// Settles the jobs of those tasks, refreshes their runs and releases their
    /// concurrency groups. Returns the stopped tasks.
    async fn expire_stale_tasks(&self, silent_since: DateTime<Utc>) -> DbResult<Vec<Task>>;
}

/// PostgreSQL implementation of TaskRepo.
pub struct PgTaskRepo {
    pool: PgPool,
}

impl PgTaskRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskRepo for PgTaskRepo {
    async fn get_task(&self, id: ResourceId) -> DbResult<Task> {
        sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("task {}", id)))?
            .try_into()
    }

    async fn update_task_state(&self, id: ResourceId, state: &TaskState) -> DbResult<Task> {
        let mut tx = self.pool.begin().await?;

        let task: Task = sqlx::query_as::<_, TaskRecord>(
            "SELECT * FROM tasks WHERE id = $1 FOR UPDATE",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("task {}", id)))?
        .try_into()?;

        if task.is_stopped() {
            return Ok(task);
        }

        let steps = serde_json::to_value(&state.steps)
            .map_err(|e| DbError::Internal(format!("encode steps: {}", e)))?;

        let updated = if state.result.is_final() {
            let stopped_at = state.stopped_at.unwrap_or_else(Utc::now);
            let updated = sqlx::query_as::<_, TaskRecord>(
                r#"
                UPDATE tasks SET steps = $2, result = $3, stopped_at = $4, updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(id.as_uuid())
            .bind(steps)
            .bind(state.result.as_str())
            .bind(stopped_at)
            .fetch_one(&mut *tx)
            .await?;

            let job: Option<(uuid::Uuid, i64, i64, Option<String>)> = sqlx::query_as(
                r#"
                UPDATE jobs SET status = $2, stopped_at = $3
                WHERE id = $1 AND status = 'running'
                RETURNING run_id, owner_id, repo_id, concurrency_group
                "#,
            )
            .bind(task.job_id.as_uuid())
            .bind(state.result.job_status().as_str())
            .bind(stopped_at)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some((run_id, owner_id, repo_id, group)) = job {
                refresh_run_status(&mut tx, ResourceId::from_uuid(run_id)).await?;
                if group.is_some_and(|g| !g.is_empty()) {
                    bump_task_versions(&mut tx, owner_id, repo_id).await?;
                }
            }
            updated
        } else {
            sqlx::query_as::<_, TaskRecord>("UPDATE tasks SET steps = $2, updated_at = NOW() WHERE id = $1 RETURNING *")
                .bind(id.as_uuid())
                .bind(steps)
                .fetch_one(&mut *tx)
                .await?
        };

        tx.commit().await?;
        updated.try_into()
    }

    async fn insert_outputs(
        &self,
        id: ResourceId,
        outputs: &BTreeMap<String, String>,
    ) -> DbResult<Vec<String>> {
        if outputs.is_empty() {
            return Ok(Vec::new());
        }
        let (keys, values): (Vec<String>, Vec<String>) =
            outputs.iter().map(|(k, v)| (k.clone(), v.clone())).unzip();

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO task_outputs (task_id, output_key, output_value)
            SELECT $1, * FROM UNNEST($2::TEXT[], $3::TEXT[])
            ON CONFLICT (task_id, output_key) DO NOTHING
            "#,
        )
        .bind(id.as_uuid())
        .bind(&keys)
        .bind(&values)
        .execute(&mut *tx)
        .await?;

        let stored: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT output_key FROM task_outputs
            WHERE task_id = $1 AND output_key = ANY($2)
            ORDER BY output_key
            "#,
        )
        .bind(id.as_uuid())
        .bind(&keys)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(stored)
    }

    async fn append_log(
        &self,
        id: ResourceId,
        at_index: i64,
        rows: &[LogRow],
        close: bool,
    ) -> DbResult<Option<i64>> {
        let new_length = at_index + rows.len() as i64;
        let mut tx = self.pool.begin().await?;

        let moved: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE tasks
            SET log_length = $3, log_closed = log_closed OR $4, updated_at = NOW()
            WHERE id = $1 AND log_length = $2
            RETURNING log_length
            "#,
        )
        .bind(id.as_uuid())
        .bind(at_index)
        .bind(new_length)
        .bind(close)
        .fetch_optional(&mut *tx)
        .await?;

        if moved.is_none() {
            let exists: Option<uuid::Uuid> =
                sqlx::query_scalar("SELECT id FROM tasks WHERE id = $1")
                    .bind(id.as_uuid())
                    .fetch_optional(&mut *tx)
                    .await?;
            return match exists {
                Some(_) => Ok(None),
                None => Err(DbError::NotFound(format!("task {}", id))),
            };
        }

        if !rows.is_empty() {
            let indexes: Vec<i64> = (at_index..new_length).collect();
            let timestamps: Vec<DateTime<Utc>> = rows.iter().map(|r| r.timestamp).collect();
            let contents: Vec<String> = rows.iter().map(|r| r.content.clone()).collect();
            sqlx::query(
                r#"
                INSERT INTO task_logs (task_id, row_index, logged_at, content)
                SELECT $1, * FROM UNNEST($2::BIGINT[], $3::TIMESTAMPTZ[], $4::TEXT[])
                "#,
            )
            .bind(id.as_uuid())
            .bind(&indexes)
            .bind(&timestamps)
            .bind(&contents)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(new_length))
    }

    async fn read_log(&self, id: ResourceId, offset: i64, limit: i64) -> DbResult<Vec<LogRow>> {
        let rows: Vec<(DateTime<Utc>, String)> = sqlx::query_as(
            r#"
            SELECT logged_at, content FROM task_logs
            WHERE task_id = $1 AND row_index >= $2
            ORDER BY row_index
            LIMIT $3
            "#,
        )
        .bind(id.as_uuid())
        .bind(offset)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(timestamp, content)| LogRow { timestamp, content })
            .collect())
    }

    async fn expire_stale_tasks(&self, silent_since: DateTime<Utc>) -> DbResult<Vec<Task>> {
        let mut tx = self.pool.begin().await?;

        let records = sqlx::query_as::<_, TaskRecord>(
            r#"
            UPDATE tasks SET result = 'failure', stopped_at = NOW(), updated_at = NOW()
            WHERE stopped_at IS NULL AND updated_at < $1
            RETURNING *
            "#,
        )
        .bind(silent_since)
        .fetch_all(&mut *tx)
        .await?;
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let tasks = records
            .into_iter()
            .map(Task::try_from)
            .collect::<DbResult<Vec<_>>>()?;

        let job_ids: Vec<uuid::Uuid> = tasks.iter().map(|t| *t.job_id.as_uuid()).collect();
        let settled: Vec<(uuid::Uuid, i64, i64, Option<String>)> = sqlx::query_as(
            r#"
            UPDATE jobs SET status = 'failure', stopped_at = NOW()
            WHERE id = ANY($1) AND status = 'running'
            RETURNING run_id, owner_id, repo_id, concurrency_group
            "#,
        )
        .bind(&job_ids)
        .fetch_all(&mut *tx)
        .await?;

        let mut run_ids: Vec<uuid::Uuid> = settled.iter().map(|(run_id, ..)| *run_id).collect();
        run_ids.sort();
        run_ids.dedup();
        for run_id in run_ids {
            refresh_run_status(&mut tx, ResourceId::from_uuid(run_id)).await?;
        }

        let mut scopes: Vec<(i64, i64)> = settled
            .iter()
            .filter(|(_, _, _, group)| group.as_deref().is_some_and(|g| !g.is_empty()))
            .map(|(_, owner_id, repo_id, _)| (*owner_id, *repo_id))
            .collect();
        scopes.sort();
        scopes.dedup();
        for (owner_id, repo_id) in scopes {
            bump_task_versions(&mut tx, owner_id, repo_id).await?;
        }

        tx.commit().await?;
        Ok(tasks)
    }
}
