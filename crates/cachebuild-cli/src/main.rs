//! cachebuild CLI tool.

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod client;
mod commands;

use client::ApiClient;

#[derive(Parser)]
#[command(name = "cachebuild")]
#[command(about = "Operate the cachebuild build orchestrator", long_about = None)]
struct Cli {
    /// API server URL
    #[arg(long, env = "CACHEBUILD_API_URL", default_value = "http://localhost:3000")]
    api_url: String,

    /// Bearer token: the admin token for kill/refresh, a cache token for logs
    #[arg(long, env = "CACHEBUILD_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Trigger a build of a configuration
    Trigger {
        /// Build configuration ID
        config_id: i64,
        /// Follow the build output
        #[arg(short, long)]
        follow: bool,
    },
    /// Stream the output of a running build
    Logs {
        /// Run ID
        run_id: i64,
        /// Print session messages as received
        #[arg(long)]
        raw: bool,
    },
    /// Kill the running builds of a configuration
    Kill {
        /// Build configuration ID
        config_id: i64,
    },
    /// Reload build configurations on the server
    Refresh,
    /// Show live workers and queued builds
    Status,
    /// Validate a controller configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "cachebuild.kdl")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Validate { path } = &cli.command {
        return commands::validate(path);
    }

    let client = ApiClient::new(&cli.api_url, cli.token)?;
    match cli.command {
        Commands::Trigger { config_id, follow } => {
            commands::builds::trigger(&client, config_id, follow).await?;
        }
        Commands::Logs { run_id, raw } => {
            commands::builds::logs(&client, run_id, raw).await?;
        }
        Commands::Kill { config_id } => {
            commands::builds::kill(&client, config_id).await?;
        }
        Commands::Refresh => {
            commands::admin::refresh(&client).await?;
        }
        Commands::Status => {
            commands::admin::status(&client).await?;
        }
        Commands::Validate { .. } => {}
    }

    Ok(())
}
