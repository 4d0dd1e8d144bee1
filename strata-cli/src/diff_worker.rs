//! `strata-diff-worker` — daemon computing layer diffs.
//!
//! Blocks on the shared diff queue; for each popped layer id it takes
//! the per-layer lock, re-checks the diff cache, and computes on a
//! miss. Run any number of these against the same coordinator.

#![allow(clippy::print_stderr, clippy::missing_docs_in_private_items)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use strata::{Images, worker};
use strata_queue::RedisCoordinator;
use strata_store::LocalStore;

#[derive(Parser)]
#[command(
    name = "strata-diff-worker",
    version,
    about = "Daemon for computing layer diffs"
)]
struct Cli {
    /// Host of the redis instance to listen to.
    #[arg(long = "rhost", env = "REDIS_PORT_6379_TCP_ADDR", default_value = "0.0.0.0")]
    redis_host: String,

    /// Port of the redis instance to listen to.
    #[arg(long = "rport", env = "REDIS_PORT_6379_TCP_PORT", default_value_t = 6379)]
    redis_port: u16,

    /// Redis database to connect to.
    #[arg(short = 'd', long = "database", default_value_t = 0)]
    redis_db: i64,

    /// Redis database password.
    #[arg(short = 'p', long = "password")]
    redis_password: Option<String>,

    /// Object store root directory.
    #[arg(long, env = "STRATA_STORAGE_ROOT", default_value = "/var/lib/strata")]
    storage_root: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_logging();
    if let Err(e) = run(Cli::parse()).await {
        eprintln!("strata-diff-worker: {e:#}");
        std::process::exit(1);
    }
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_env_var("STRATA_LOG")
        .try_from_env()
        .unwrap_or_else(|_| "strata_diff_worker=info,strata=info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let store = LocalStore::open(&cli.storage_root)
        .await
        .context("opening the object store")?;
    let images = Images::new(Arc::new(store));

    let coord = RedisCoordinator::connect(
        &cli.redis_host,
        cli.redis_port,
        cli.redis_db,
        cli.redis_password.as_deref(),
    )
    .await
    .context("connecting to the coordination service")?;

    info!("starting worker");
    tokio::select! {
        result = worker::run(images, Arc::new(coord)) => result.context("worker loop"),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            Ok(())
        }
    }
}
