//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt record: {0}")]
    Decode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<DbError> for cachebuild_core::Error {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => cachebuild_core::Error::NotFound(msg),
            other => cachebuild_core::Error::Internal(other.to_string()),
        }
    }
}

pub type DbResult<T> = std::result::Result<T, DbError>;
