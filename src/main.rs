use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use skiff::api::{create_router, AppState, PolicyClient};
use skiff::config::Config;
use skiff::engine::Engine;
use skiff::jobs::{reaper, KubeBroker, LocalBroker, Orchestrator};
use skiff::registry::RunStore;
use skiff::shutdown::ShutdownCoordinator;

#[derive(Parser)]
#[command(name = "skiff")]
#[command(about = "Workflow engine that runs packed CWL graphs as container jobs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    Listen {
        /// Port to expose the API on
        #[arg(long)]
        port: Option<u16>,
        /// Run jobs as local processes instead of cluster jobs
        #[arg(long)]
        local: bool,
    },
    /// Drive the engine for one run (executed inside the engine pod)
    Run {
        /// Run ID to execute
        run_id: String,
        /// User the run belongs to (falls back to SKIFF_RUN_USER)
        #[arg(long)]
        user: Option<String>,
        /// Run jobs as local processes instead of cluster jobs
        #[arg(long)]
        local: bool,
    },
    /// Pack a multi-file CWL workflow into a single document on stdout
    Pack {
        /// Path to the entry CWL file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "skiff=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::load();

    match cli.command {
        Commands::Listen { port, local } => cmd_listen(config, port, local).await,
        Commands::Run { run_id, user, local } => cmd_run(config, &run_id, user, local).await,
        Commands::Pack { file } => cmd_pack(&file),
    }
}

fn make_broker(config: &Config, local: bool) -> anyhow::Result<Arc<dyn Orchestrator>> {
    if local || config.orchestrator.local {
        Ok(Arc::new(LocalBroker::new()))
    } else {
        Ok(Arc::new(KubeBroker::in_cluster(config)?))
    }
}

async fn cmd_listen(mut config: Config, port: Option<u16>, local: bool) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if local {
        config.orchestrator.local = true;
    }
    let config = Arc::new(config);

    skiff::metrics::init_metrics();

    let store = RunStore::new(config.data_dir());
    std::fs::create_dir_all(store.root())?;
    let broker = make_broker(&config, local)?;
    let auth = Arc::new(PolicyClient::new(
        config.auth.authz_url.clone(),
        Duration::from_secs(config.orchestrator.api_timeout_seconds),
    ));

    let shutdown = ShutdownCoordinator::new();
    shutdown.listen_for_signals();

    tokio::spawn(reaper::reap_completed_jobs(
        broker.clone(),
        Duration::from_secs(config.engine.reaper_period_seconds),
        config.engine.reaper_grace_seconds,
        shutdown.clone(),
    ));

    let state = AppState {
        store,
        broker,
        auth,
        config: config.clone(),
    };
    let router = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!("skiff serving at {addr}");

    let wait = shutdown.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { wait.wait_for_shutdown().await })
        .await?;
    Ok(())
}

async fn cmd_run(
    config: Config,
    run_id: &str,
    user: Option<String>,
    local: bool,
) -> anyhow::Result<()> {
    let user = user
        .or_else(|| std::env::var("SKIFF_RUN_USER").ok())
        .context("no user given (pass --user or set SKIFF_RUN_USER)")?;
    let config = Arc::new(config);

    let store = RunStore::new(config.data_dir());
    let broker = make_broker(&config, local)?;

    let engine = Engine::open(broker, store, config, &user, run_id).await?;
    let outputs = engine.run().await?;

    println!("{}", serde_json::to_string_pretty(&outputs)?);
    Ok(())
}

fn cmd_pack(file: &PathBuf) -> anyhow::Result<()> {
    if !file.exists() {
        anyhow::bail!("file not found: {}", file.display());
    }
    let packed = skiff::pack::pack_file(file)?;
    println!("{}", serde_json::to_string_pretty(&packed)?);
    Ok(())
}
