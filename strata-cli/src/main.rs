//! `stratad` — the image-layer registry service.

#![allow(clippy::print_stderr, clippy::missing_docs_in_private_items)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use strata::{Images, Registry, worker};
use strata_http::ServiceConfig;
use strata_queue::{Coordinator, MemoryCoordinator, RedisCoordinator};
use strata_store::LocalStore;

#[derive(Parser)]
#[command(name = "stratad", version, about = "Image-layer service of a container registry")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "STRATA_LISTEN", default_value = "0.0.0.0:5000")]
    listen: SocketAddr,

    /// Object store root directory.
    #[arg(long, env = "STRATA_STORAGE_ROOT", default_value = "/var/lib/strata")]
    storage_root: PathBuf,

    /// Accelerated-download URI prefix (e.g. an nginx internal
    /// location). Only honored with local storage.
    #[arg(long, env = "STRATA_ACCEL_PREFIX")]
    accel_prefix: Option<String>,

    /// Host of the redis coordination service. Without it the service
    /// runs standalone: in-process coordinator plus an embedded diff
    /// worker.
    #[arg(long, env = "REDIS_PORT_6379_TCP_ADDR")]
    redis_host: Option<String>,

    /// Port of the redis coordination service.
    #[arg(long, env = "REDIS_PORT_6379_TCP_PORT", default_value_t = 6379)]
    redis_port: u16,

    /// Redis database to connect to.
    #[arg(long, default_value_t = 0)]
    redis_db: i64,

    /// Redis database password.
    #[arg(long)]
    redis_password: Option<String>,
}

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(e) = run(Cli::parse()).await {
        eprintln!("stratad: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_env_var("STRATA_LOG")
        .try_from_env()
        .unwrap_or_else(|_| "stratad=info,strata=info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let store = LocalStore::open(&cli.storage_root)
        .await
        .context("opening the object store")?;
    let images = Images::new(Arc::new(store));

    let coord: Arc<dyn Coordinator> = match &cli.redis_host {
        Some(host) => Arc::new(
            RedisCoordinator::connect(
                host,
                cli.redis_port,
                cli.redis_db,
                cli.redis_password.as_deref(),
            )
            .await
            .context("connecting to the coordination service")?,
        ),
        None => Arc::new(MemoryCoordinator::new()),
    };

    if cli.redis_host.is_none() {
        info!("no coordinator configured, running an embedded diff worker");
        let worker_images = images.clone();
        let worker_coord = Arc::clone(&coord);
        tokio::spawn(async move {
            if let Err(err) = worker::run(worker_images, worker_coord).await {
                error!(error = %err, "embedded diff worker stopped");
            }
        });
    }

    let registry = Registry::new(images, coord);
    let config = ServiceConfig {
        accel_prefix: cli.accel_prefix,
    };
    let app = strata_http::app(registry, config);

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("binding {}", cli.listen))?;
    info!(addr = %cli.listen, root = %cli.storage_root.display(), "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}
