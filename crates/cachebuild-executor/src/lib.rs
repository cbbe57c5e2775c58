//! Container runtimes hosting cachebuild build workers.
//!
//! - Docker (local and single-host deployments)

pub mod docker;

pub use docker::DockerRuntime;
