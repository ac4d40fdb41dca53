//! Chaincode runner
//!
//! Connects the bundled asset chaincode to a ledger peer and serves
//! transactions until the peer hangs up or the process is signalled.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chaincode_runner::{connect, AssetChaincode};
use chaincode_shim::ShimConfig;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "chaincode-runner", version, long_version = shim_build_info::long_version())]
#[command(about = "Serve a chaincode over a peer stream")]
struct Cli {
    /// Peer address: host:port or unix:<path> (or CORE_PEER_ADDRESS)
    #[arg(long)]
    peer_address: Option<String>,

    /// Chaincode identity announced at registration (or CORE_CHAINCODE_ID_NAME)
    #[arg(long)]
    chaincode_id: Option<String>,

    /// TOML file with a [shim] table
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    info!(
        "{}",
        shim_build_info::banner(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
    );

    let mut config = ShimConfig::load(cli.config.as_deref())?;
    if let Some(address) = cli.peer_address {
        config.peer_address = address;
    }
    if let Some(id) = cli.chaincode_id {
        config.chaincode_id = id;
    }

    let (manager, mut inbound) = connect(config, Arc::new(AssetChaincode)).await?;
    if let Err(err) = manager.start(&mut inbound).await {
        manager.shutdown().await;
        return Err(err).context("Registration with peer failed");
    }

    let outcome = tokio::select! {
        result = manager.serve(inbound) => result.context("Peer session failed"),
        received = shutdown_signal() => {
            info!("Received {}, shutting down", received);
            Ok(())
        }
    };
    manager.shutdown().await;
    outcome
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};

    match unix_signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = signal::ctrl_c() => "Ctrl+C",
                _ = terminate.recv() => "SIGTERM",
            }
        }
        Err(err) => {
            warn!("Failed to install SIGTERM handler: {}", err);
            let _ = signal::ctrl_c().await;
            "Ctrl+C"
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    if let Err(err) = signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", err);
        std::future::pending::<()>().await;
    }
    "Ctrl+C"
}
