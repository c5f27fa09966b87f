//! Runner and registration-token repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hopper_core::{ResourceId, Runner, RunnerScope};
use sqlx::PgPool;

use super::scope_from_columns;
use crate::{DbError, DbResult};

/// Input for registering (or re-keying) a runner.
#[derive(Debug, Clone)]
pub struct NewRunner {
    pub name: String,
    pub scope: RunnerScope,
    pub labels: Vec<String>,
    pub version: String,
    pub token_hash: String,
    pub token_salt: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct RunnerRecord {
    id: uuid::Uuid,
    name: String,
    owner_id: Option<i64>,
    repo_id: Option<i64>,
    labels: Vec<String>,
    version: String,
    token_hash: String,
    token_salt: String,
    last_online: Option<DateTime<Utc>>,
    last_active: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<RunnerRecord> for Runner {
    type Error = DbError;

    fn try_from(record: RunnerRecord) -> DbResult<Self> {
        Ok(Runner {
            id: ResourceId::from_uuid(record.id),
            name: record.name,
            scope: scope_from_columns(record.owner_id, record.repo_id)?,
            labels: record.labels,
            version: record.version,
            token_hash: record.token_hash,
            token_salt: record.token_salt,
            last_online: record.last_online,
            last_active: record.last_active,
            created_at: record.created_at,
        })
    }
}

#[async_trait]
pub trait RunnerRepo: Send + Sync {
    /// Store a new registration token for `scope`, retiring the previous ones.
    async fn issue_registration_token(&self, scope: RunnerScope, token_hash: &str) -> DbResult<()>;
    /// Scope of an active registration token, if any.
    async fn registration_token_scope(&self, token_hash: &str) -> DbResult<Option<RunnerScope>>;

    /// Create a runner, or re-key the runner with the same name in the same scope.
    async fn upsert_runner(&self, runner: NewRunner) -> DbResult<Runner>;
    async fn get_runner(&self, id: ResourceId) -> DbResult<Runner>;
    /// Runners registered exactly in `scope`; the global scope lists every runner.
    async fn list_runners(&self, scope: RunnerScope) -> DbResult<Vec<Runner>>;
    async fn delete_runner(&self, id: ResourceId) -> DbResult<()>;
    /// Record a heartbeat. `active` also marks the runner as working.
    ///
    /// Fails with `NotFound` once the runner is deleted.
    async fn touch_runner(&self, id: ResourceId, active: bool) -> DbResult<()>;
}

/// PostgreSQL implementation of RunnerRepo.
pub struct PgRunnerRepo {
    pool: PgPool,
}

impl PgRunnerRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunnerRepo for PgRunnerRepo {
    async fn issue_registration_token(&self, scope: RunnerScope, token_hash: &str) -> DbResult<()> {
        let (owner_id, repo_id) = scope.to_columns();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE registration_tokens SET is_active = FALSE
            WHERE owner_id IS NOT DISTINCT FROM $1 AND repo_id IS NOT DISTINCT FROM $2
            "#,
        )
        .bind(owner_id)
        .bind(repo_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO registration_tokens (token_hash, owner_id, repo_id, is_active, created_at)
            VALUES ($1, $2, $3, TRUE, NOW())
            "#,
        )
        .bind(token_hash)
        .bind(owner_id)
        .bind(repo_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn registration_token_scope(&self, token_hash: &str) -> DbResult<Option<RunnerScope>> {
        let row: Option<(Option<i64>, Option<i64>)> = sqlx::query_as(
            "SELECT owner_id, repo_id FROM registration_tokens WHERE token_hash = $1 AND is_active",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|(owner_id, repo_id)| scope_from_columns(owner_id, repo_id))
            .transpose()
    }

    async fn upsert_runner(&self, runner: NewRunner) -> DbResult<Runner> {
        let (owner_id, repo_id) = runner.scope.to_columns();
        let record = sqlx::query_as::<_, RunnerRecord>(
            r#"
            INSERT INTO runners (id, name, owner_id, repo_id, labels, version, token_hash, token_salt, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT ((COALESCE(owner_id, 0)), (COALESCE(repo_id, 0)), name)
            DO UPDATE SET labels = EXCLUDED.labels,
                          version = EXCLUDED.version,
                          token_hash = EXCLUDED.token_hash,
                          token_salt = EXCLUDED.token_salt
            RETURNING *
            "#,
        )
        .bind(uuid::Uuid::now_v7())
        .bind(&runner.name)
        .bind(owner_id)
        .bind(repo_id)
        .bind(&runner.labels)
        .bind(&runner.version)
        .bind(&runner.token_hash)
        .bind(&runner.token_salt)
        .fetch_one(&self.pool)
        .await?;
        record.try_into()
    }

    async fn get_runner(&self, id: ResourceId) -> DbResult<Runner> {
        sqlx::query_as::<_, RunnerRecord>("SELECT * FROM runners WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("runner {}", id)))?
            .try_into()
    }

    async fn list_runners(&self, scope: RunnerScope) -> DbResult<Vec<Runner>> {
        let query = match scope {
            RunnerScope::Global => {
                sqlx::query_as::<_, RunnerRecord>("SELECT * FROM runners ORDER BY name")
            }
            RunnerScope::Owner(owner_id) => sqlx::query_as::<_, RunnerRecord>(
                "SELECT * FROM runners WHERE owner_id = $1 ORDER BY name",
            )
            .bind(owner_id),
            RunnerScope::Repository(repo_id) => sqlx::query_as::<_, RunnerRecord>(
                "SELECT * FROM runners WHERE repo_id = $1 ORDER BY name",
            )
            .bind(repo_id),
        };
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Runner::try_from)
            .collect()
    }

    async fn delete_runner(&self, id: ResourceId) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM runners WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("runner {}", id)));
        }
        Ok(())
    }

    async fn touch_runner(&self, id: ResourceId, active: bool) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE runners
            SET last_online = NOW(),
                last_active = CASE WHEN $2 THEN NOW() ELSE last_active END
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(active)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("runner {}", id)));
        }
        Ok(())
    }
}
