#![warn(missing_docs)]

//! `mfs-manager`: serves the MosaicFS control protocol.

use anyhow::Result;
use clap::Parser;
use mosaicfs_meta::MemoryKvStore;
use mosaicfs_mgmt::{ClusterCoordinator, ControlService, ManagerConfig};
use mosaicfs_transport::TcpNodeClient;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "mfs-manager")]
#[command(about = "MosaicFS cluster manager", long_about = None)]
struct Cli {
    /// Config file (.toml or .json).
    #[arg(short, long, env = "MFS_MANAGER_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overriding the config file.
    #[arg(short, long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => ManagerConfig::from_file(path)?,
        None => {
            tracing::warn!("No config file given, using defaults");
            ManagerConfig::default()
        }
    };
    if let Some(bind) = cli.bind {
        config.bind_addr = bind;
    }

    let locks = config.lock_backend.build();
    let nodes = Arc::new(TcpNodeClient::new(config.node_client()));
    let coordinator = Arc::new(ClusterCoordinator::new(
        Arc::new(MemoryKvStore::new()),
        locks,
        nodes,
        &config,
    ));

    if config.sync_on_start {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.sync_clusters().await {
                tracing::error!("Startup sync failed: {}", e);
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "mfs-manager listening");
    ControlService::new(coordinator).serve(listener).await;
    Ok(())
}
