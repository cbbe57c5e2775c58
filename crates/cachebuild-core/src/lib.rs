//! Core domain types and traits for the cachebuild build orchestrator.
//!
//! This crate contains:
//! - Identifiers for caches, build configurations and runs
//! - Build configuration and run record types
//! - Build session protocol and message bus payloads
//! - Collaborator traits (job store, access oracle, container runtime, message bus)

pub mod auth;
pub mod bus;
pub mod configuration;
pub mod error;
pub mod id;
pub mod run;
pub mod runtime;
pub mod session;
pub mod store;

pub use error::{Error, Result};
pub use id::{CacheId, ConfigId, RunId};
