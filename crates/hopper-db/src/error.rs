//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    /// A stored row could not be mapped back to a domain value.
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl From<hopper_core::Error> for DbError {
    fn from(err: hopper_core::Error) -> Self {
        DbError::InvalidData(err.to_string())
    }
}

impl From<DbError> for hopper_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(what) => hopper_core::Error::NotFound(what),
            DbError::Duplicate(what) => hopper_core::Error::Conflict(what),
            other => hopper_core::Error::Internal(other.to_string()),
        }
    }
}
