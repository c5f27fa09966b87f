//! Persistent trust records.

use async_trait::async_trait;
use hopper_core::{RepoId, UserId};
use sqlx::PgPool;

use crate::DbResult;

/// Stores `AlwaysTrusted` decisions per (repository, contributor).
#[async_trait]
pub trait TrustRepo: Send + Sync {
    async fn is_always_trusted(&self, repo_id: RepoId, user_id: UserId) -> DbResult<bool>;
    async fn set_always_trusted(
        &self,
        repo_id: RepoId,
        user_id: UserId,
        trusted_by: UserId,
    ) -> DbResult<()>;
    /// Returns whether a record was removed.
    async fn revoke_trust(&self, repo_id: RepoId, user_id: UserId) -> DbResult<bool>;
}

/// PostgreSQL implementation of TrustRepo.
pub struct PgTrustRepo {
    pool: PgPool,
}

impl PgTrustRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TrustRepo for PgTrustRepo {
    async fn is_always_trusted(&self, repo_id: RepoId, user_id: UserId) -> DbResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT user_id FROM trusted_users WHERE repo_id = $1 AND user_id = $2",
        )
        .bind(repo_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    async fn set_always_trusted(
        &self,
        repo_id: RepoId,
        user_id: UserId,
        trusted_by: UserId,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO trusted_users (repo_id, user_id, trusted_by, created_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (repo_id, user_id) DO UPDATE SET trusted_by = EXCLUDED.trusted_by
            "#,
        )
        .bind(repo_id)
        .bind(user_id)
        .bind(trusted_by)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn revoke_trust(&self, repo_id: RepoId, user_id: UserId) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM trusted_users WHERE repo_id = $1 AND user_id = $2")
            .bind(repo_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
