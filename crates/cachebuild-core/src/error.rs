//! Error types for cachebuild.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not running: {0}")]
    NotRunning(String),

    #[error("no capable build node: {0}")]
    NoCapableNode(String),

    #[error("provisioning failed: {0}")]
    ProvisionFailure(String),

    #[error("build session failed: {0}")]
    ProtocolFailure(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The error returned when a build configuration id is unknown.
    pub fn configuration_not_found(id: impl std::fmt::Display) -> Self {
        Error::NotFound(format!("build configuration {}", id))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
