//! Repository traits and implementations.

pub mod run;
pub mod runner;
pub mod task;
pub mod trust;

pub use run::{PgRunRepo, RunRepo};
pub use runner::{NewRunner, PgRunnerRepo, RunnerRepo};
pub use task::{PgTaskRepo, TaskRepo};
pub use trust::{PgTrustRepo, TrustRepo};

use std::sync::Arc;

use hopper_core::{OwnerId, RepoId, ResourceId, RunnerScope, Status};
use sqlx::{PgConnection, PgPool};

use crate::{DbError, DbResult, MemoryStore};

/// The repositories a scheduler needs, behind trait objects.
#[derive(Clone)]
pub struct Stores {
    pub runners: Arc<dyn RunnerRepo>,
    pub runs: Arc<dyn RunRepo>,
    pub tasks: Arc<dyn TaskRepo>,
    pub trust: Arc<dyn TrustRepo>,
}

impl Stores {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            runners: Arc::new(PgRunnerRepo::new(pool.clone())),
            runs: Arc::new(PgRunRepo::new(pool.clone())),
            tasks: Arc::new(PgTaskRepo::new(pool.clone())),
            trust: Arc::new(PgTrustRepo::new(pool)),
        }
    }

    pub fn memory() -> Self {
        Self::from_memory(Arc::new(MemoryStore::new()))
    }

    pub fn from_memory(store: Arc<MemoryStore>) -> Self {
        Self {
            runners: store.clone(),
            runs: store.clone(),
            tasks: store.clone(),
            trust: store,
        }
    }
}

/// Bump the global, owner and repository task versions in one statement.
pub(crate) async fn bump_task_versions(
    conn: &mut PgConnection,
    owner_id: OwnerId,
    repo_id: RepoId,
) -> DbResult<()> {
    sqlx::query(
        r#"
        INSERT INTO tasks_versions (owner_id, repo_id, version, updated_at)
        VALUES (0, 0, 1, NOW()), ($1, 0, 1, NOW()), (0, $2, 1, NOW())
        ON CONFLICT (owner_id, repo_id)
        DO UPDATE SET version = tasks_versions.version + 1, updated_at = NOW()
        "#,
    )
    .bind(owner_id)
    .bind(repo_id)
    .execute(conn)
    .await?;
    Ok(())
}

/// Recompute a run's aggregate status from its jobs.
pub(crate) async fn refresh_run_status(conn: &mut PgConnection, run_id: ResourceId) -> DbResult<()> {
    let rows: Vec<(String,)> = sqlx::query_as("SELECT status FROM jobs WHERE run_id = $1")
        .bind(run_id.as_uuid())
        .fetch_all(&mut *conn)
        .await?;
    let statuses = rows
        .iter()
        .map(|(s,)| s.parse::<Status>())
        .collect::<hopper_core::Result<Vec<_>>>()?;

    sqlx::query("UPDATE runs SET status = $2, updated_at = NOW() WHERE id = $1")
        .bind(run_id.as_uuid())
        .bind(Status::aggregate(statuses).as_str())
        .execute(conn)
        .await?;
    Ok(())
}

/// Load the nullable scope columns back into a `RunnerScope`.
pub(crate) fn scope_from_columns(
    owner_id: Option<OwnerId>,
    repo_id: Option<RepoId>,
) -> DbResult<RunnerScope> {
    RunnerScope::from_columns(owner_id, repo_id).map_err(|e| DbError::InvalidData(e.to_string()))
}
