//! tapestage-daemon — transparent recall server.
//!
//! Binds the recall socket, opens the queue store, and runs the recall
//! core until signalled. The first SIGTERM/SIGINT starts a graceful
//! shutdown (in-flight requests finish, unanswered events are failed);
//! a second signal forces the current tape copy to abort.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tapestage_core::DaemonConfig;
use tapestage_daemon::RecallServer;
use tapestage_daemon::connector::SocketConnector;
use tapestage_daemon::inventory::DirectoryInventory;
use tapestage_daemon::store::{QueueStore, StoreLocation};

/// tapestage transparent recall daemon.
#[derive(Parser, Debug)]
#[command(name = "tapestage-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the daemon configuration file
    #[arg(short, long, default_value = "/etc/tapestage/daemon.toml")]
    config: PathBuf,

    /// Override the recall socket path
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Override the queue store path
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).context("invalid log level")?,
        )
        .init();

    let mut config = DaemonConfig::load(&args.config).context("loading configuration")?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        socket = %config.socket_path.display(),
        db = %config.db_path.display(),
        "tapestage daemon starting"
    );

    // Queue state does not survive restarts: shutdown cleanup already
    // answered everything a previous run left behind.
    QueueStore::cleanup(&config.db_path).context("removing stale queue store")?;
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("creating store directory")?;
    }
    let store = Arc::new(
        QueueStore::open(&StoreLocation::File(config.db_path.clone()))
            .context("opening queue store")?,
    );

    let connector = Arc::new(SocketConnector::new(config.socket_path.clone()));
    let inventory = Arc::new(DirectoryInventory::new(
        config.mount_root.clone(),
        config.drives,
    ));

    let server = RecallServer::new(config, store, connector, inventory);
    let handle = server.handle();
    let mut server_task = tokio::spawn(server.run());

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("SIGTERM received, shutting down");
            handle.shutdown().await;
        }
        _ = sigint.recv() => {
            info!("SIGINT received, shutting down");
            handle.shutdown().await;
        }
        result = &mut server_task => {
            result.context("server task failed")??;
            return Ok(());
        }
    }

    // A second signal aborts the in-flight tape copy.
    tokio::select! {
        _ = sigterm.recv() => {
            warn!("second signal, forcing shutdown");
            handle.shutdown_forced().await;
        }
        _ = sigint.recv() => {
            warn!("second signal, forcing shutdown");
            handle.shutdown_forced().await;
        }
        result = &mut server_task => {
            result.context("server task failed")??;
            info!("tapestage daemon stopped");
            return Ok(());
        }
    }

    server_task.await.context("server task failed")??;
    info!("tapestage daemon stopped");
    Ok(())
}
