//! Chaincode runner
//!
//! Library half of the `chaincode-runner` binary: the bundled sample
//! chaincode and the session wiring shared by `main` and the tests.

pub mod asset;

use std::sync::Arc;

use anyhow::{Context, Result};
use chaincode_shim::{Chaincode, InvocationTaskManager, ShimConfig, TracingObserver, Transport};
use tracing::info;

pub use asset::{Asset, AssetChaincode};

/// Dials the configured peer and builds a session around `chaincode`. The
/// returned receiver must be handed to [`InvocationTaskManager::run`].
pub async fn connect(
    config: ShimConfig,
    chaincode: Arc<dyn Chaincode>,
) -> Result<(
    InvocationTaskManager,
    tokio::sync::mpsc::Receiver<chaincode_shim::ChaincodeMessage>,
)> {
    config.validate()?;
    let transport = Transport::connect(&config.peer_address, config.outbound_queue_capacity)
        .await
        .with_context(|| format!("Failed to reach peer at {}", config.peer_address))?;
    info!(peer = %config.peer_address, chaincode = %config.chaincode_id, "Connected to peer");

    let (sender, inbound) = transport.split();
    let manager =
        InvocationTaskManager::with_observer(config, chaincode, Arc::new(TracingObserver), sender);
    Ok((manager, inbound))
}
