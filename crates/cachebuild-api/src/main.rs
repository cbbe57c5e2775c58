//! cachebuild server

use anyhow::Context;
use cachebuild_api::{AppState, routes};
use cachebuild_config::{ControllerConfig, DispatchMode, load_controller_config};
use cachebuild_core::auth::AccessOracle;
use cachebuild_core::bus::{MessageBus, NodeRegistry};
use cachebuild_core::store::JobStore;
use cachebuild_db::{
    MemoryAccessOracle, MemoryJobStore, MemoryMessageBus, MemoryNodeRegistry, PgAccessOracle,
    PgJobStore, PgMessageBus, PgNodeRegistry, Seed, create_pool, run_migrations,
};
use cachebuild_executor::DockerRuntime;
use cachebuild_scheduler::{Coordinator, Scheduler, WsConnector};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "cachebuild.kdl";

#[derive(Parser)]
#[command(name = "cachebuild-server")]
#[command(about = "Build orchestrator for the binary cache platform", long_about = None)]
struct Args {
    /// Controller configuration file
    #[arg(long, env = "CACHEBUILD_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "CACHEBUILD_LISTEN")]
    listen: Option<SocketAddr>,

    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Bearer token for the administrative endpoints
    #[arg(long, env = "CACHEBUILD_REFRESH_TOKEN")]
    refresh_token: Option<String>,

    /// Keep all state in memory instead of PostgreSQL
    #[arg(long)]
    in_memory: bool,

    /// JSON file seeding the in-memory backends
    #[arg(long, requires = "in_memory")]
    seed: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

struct Backends {
    store: Arc<dyn JobStore>,
    oracle: Arc<dyn AccessOracle>,
    registry: Arc<dyn NodeRegistry>,
    bus: Arc<dyn MessageBus>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let mut config = load_config(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if let Some(url) = args.database_url.clone() {
        config.database.url = Some(url);
    }
    if let Some(token) = args.refresh_token.clone() {
        config.server.refresh_token = Some(token);
    }
    if config.server.refresh_token.is_none() {
        warn!("No refresh token configured, administrative endpoints are disabled");
    }

    let backends = if args.in_memory {
        in_memory_backends(args.seed.as_deref())?
    } else {
        postgres_backends(&config).await?
    };

    let runtime = DockerRuntime::new().context("connecting to Docker")?;
    let scheduler = Scheduler::start(
        config.scheduler.clone(),
        backends.store.clone(),
        Arc::new(runtime),
        Arc::new(WsConnector),
    )
    .await
    .context("starting scheduler")?;

    let mut state = AppState::new(scheduler, backends.store.clone(), backends.oracle)
        .with_admin_token(config.server.refresh_token.clone())
        .with_stream_config(config.stream.clone());

    if config.dispatch == DispatchMode::Remote {
        let coordinator = Arc::new(Coordinator::new(
            backends.store,
            backends.bus,
            backends.registry,
        ));
        info!(controller = %coordinator.id(), "Remote dispatch enabled");
        let listener = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                warn!(error = %e, "Node control listener stopped");
            }
        });
        state = state.with_coordinator(coordinator);
    }

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", config.server.listen);
    let listener = TcpListener::bind(config.server.listen).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }
}

/// Load the configuration file; a missing default file means defaults.
fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<ControllerConfig> {
    match path {
        Some(path) => load_controller_config(path)
            .with_context(|| format!("loading {}", path.display())),
        None if std::path::Path::new(DEFAULT_CONFIG).exists() => {
            load_controller_config(DEFAULT_CONFIG)
                .with_context(|| format!("loading {}", DEFAULT_CONFIG))
        }
        None => Ok(ControllerConfig::default()),
    }
}

fn in_memory_backends(seed: Option<&std::path::Path>) -> anyhow::Result<Backends> {
    let seed = match seed {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            Seed::from_json(&json)?
        }
        None => Seed::default(),
    };
    info!(
        caches = seed.caches.len(),
        configurations = seed.configurations.len(),
        "Using in-memory backends"
    );

    Ok(Backends {
        store: Arc::new(MemoryJobStore::from_seed(&seed)),
        oracle: Arc::new(MemoryAccessOracle::from_seed(&seed)),
        registry: Arc::new(MemoryNodeRegistry::from_seed(&seed)),
        bus: Arc::new(MemoryMessageBus::new()),
    })
}

async fn postgres_backends(config: &ControllerConfig) -> anyhow::Result<Backends> {
    let url = config
        .database
        .url
        .as_deref()
        .context("no database url configured (use --database-url or --in-memory)")?;

    info!("Connecting to database...");
    let pool = create_pool(url, config.database.max_connections).await?;
    run_migrations(&pool).await?;
    info!("Database connected");

    Ok(Backends {
        store: Arc::new(PgJobStore::new(pool.clone())),
        oracle: Arc::new(PgAccessOracle::new(pool.clone())),
        registry: Arc::new(PgNodeRegistry::new(pool.clone())),
        bus: Arc::new(PgMessageBus::new(pool)),
    })
}
