//! KDL configuration parsing for the cachebuild controller.
//!
//! Every setting has a default, so an empty document (or no file at all) is a
//! valid configuration for local development.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    ControllerConfig, DatabaseConfig, DispatchMode, SchedulerConfig, ServerConfig, StreamConfig,
    load_controller_config, parse_controller_config,
};
