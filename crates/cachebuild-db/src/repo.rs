//! Repository implementations backed by PostgreSQL.

pub mod access;
pub mod job;
pub mod node;

pub use access::{PgAccessOracle, token_digest};
pub use job::PgJobStore;
pub use node::PgNodeRegistry;
