//! Storage and messaging backends for cachebuild.
//!
//! Provides PostgreSQL implementations of the job store, access oracle and
//! node registry, a LISTEN/NOTIFY message bus, and in-memory implementations
//! of all of them for development and tests.

pub mod bus;
pub mod error;
pub mod memory;
pub mod repo;

pub use bus::PgMessageBus;
pub use error::{DbError, DbResult};
pub use memory::{
    MemoryAccessOracle, MemoryJobStore, MemoryMessageBus, MemoryNodeRegistry, Seed,
};
pub use repo::*;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
