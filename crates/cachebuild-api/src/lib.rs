//! HTTP surface of the cachebuild build orchestrator.
//!
//! Build triggers (manual and webhook), the live log stream, configuration
//! refresh, kill, status and health endpoints, all backed by a
//! [`cachebuild_scheduler::SchedulerHandle`].

pub mod auth;
pub mod error;
pub mod routes;
pub mod state;
pub mod stream;

#[cfg(test)]
mod testing;

pub use state::AppState;
