//! `apphost` entry point.
//!
//! Two modes: `serve` runs the gateway (the host proper), `static-serve`
//! is the per-instance worker the supervisor spawns for each plugin.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use apphost::blobstore::FsBlobStore;
use apphost::config::HostConfig;
use apphost::extractor::Extractor;
use apphost::gateway::{GatewayState, build_router};
use apphost::registry::InstanceRegistry;
use apphost::resolver::{Resolver, SharedPackageStore};
use apphost::static_host;
use apphost::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "apphost", about = "Isolated execution host for plugin bundles")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway.
    Serve {
        /// Path to an alternate config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Serve one directory of static files (spawned per plugin instance).
    StaticServe {
        /// Directory to serve.
        #[arg(long)]
        root: PathBuf,
        /// Port to bind on loopback.
        #[arg(long, env = "PORT")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "apphost=info".into()),
        )
        .init();

    match Cli::parse().command {
        Command::Serve { config } => {
            let config = match config {
                Some(path) => HostConfig::load_from(&path),
                None => HostConfig::load(),
            };
            run_serve(config).await
        }
        Command::StaticServe { root, port } => static_host::run(root, port).await,
    }
}

async fn run_serve(config: HostConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(config.instances_dir())?;

    let registry = Arc::new(InstanceRegistry::new(config.clone()));
    let sweeper = registry.start_sweeper();

    let state = GatewayState {
        registry: Arc::clone(&registry),
        extractor: Arc::new(Extractor::new(
            Arc::new(FsBlobStore::new(config.blob_root.clone())),
            config.instances_dir(),
        )),
        resolver: Arc::new(Resolver::new(
            SharedPackageStore::new(config.packages_root.clone()),
            reqwest::Client::new(),
            config.cdn_fixups,
        )),
        supervisor: Arc::new(Supervisor::new(Arc::clone(&registry), config.clone())),
        http: reqwest::Client::new(),
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    sweeper.abort();
    registry.shutdown_all();
    Ok(())
}
