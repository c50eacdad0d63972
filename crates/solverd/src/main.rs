//! solverd — the SolverGrid daemon.
//!
//! Boots an in-process cluster of solver servers over one state store and
//! serves the REST API from the first node.
//!
//! # Usage
//!
//! ```text
//! solverd run --config solvergrid.toml --port 8443 --data-dir /var/lib/solvergrid --nodes 3
//! solverd default-config > solvergrid.toml
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use solvergrid_core::GridConfig;
use solvergrid_core::config::LoggingConfig;
use solvergrid_state::StateStore;
use solverd::LocalCluster;

#[derive(Parser)]
#[command(name = "solverd", about = "SolverGrid daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a local cluster and its REST API.
    Run {
        /// TOML configuration file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Number of in-process solver nodes.
        #[arg(long)]
        nodes: Option<u32>,
    },
    /// Print the default configuration.
    DefaultConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
            nodes,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(port) = port {
                config.api.port = port;
            }
            if let Some(data_dir) = data_dir {
                config.data_dir = Some(data_dir);
            }
            if let Some(nodes) = nodes {
                config.cluster.nodes = nodes;
            }
            init_tracing(&config.logging);
            run(config).await
        }
        Command::DefaultConfig => {
            print!("{}", GridConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<GridConfig> {
    match path {
        Some(path) => GridConfig::from_file(path),
        None => Ok(GridConfig::default()),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: GridConfig) -> anyhow::Result<()> {
    info!("SolverGrid daemon starting");

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("solvergrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let cluster = LocalCluster::start(&config, store).await?;

    // ── API server ─────────────────────────────────────────────

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let state = solvergrid_api::ApiState::new(cluster.entry().server.clone(), shutdown_tx);
    let router = solvergrid_api::build_router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api.port));

    info!(%addr, node = %cluster.entry().server.local_address(), "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Graceful shutdown on Ctrl-C or `POST /api/v1/shutdown`.
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = ctrl_c => info!("shutdown signal received"),
                _ = shutdown_rx.wait_for(|stop| *stop) => info!("shutdown requested"),
            }
        })
        .await?;

    cluster.shutdown().await;

    info!("SolverGrid daemon stopped");
    Ok(())
}
