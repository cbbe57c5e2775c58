//! CLI command implementations.

pub mod admin;
pub mod builds;

use anyhow::Result;

pub fn validate(path: &str) -> Result<()> {
    match cachebuild_config::load_controller_config(path) {
        Ok(config) => {
            println!("Configuration is valid");
            println!("  listen:          {}", config.server.listen);
            println!("  dispatch:        {:?}", config.dispatch);
            println!("  max concurrency: {}", config.scheduler.max_concurrency);
            println!("  builder image:   {}", config.scheduler.builder_image);
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}
