//! Chaincode shim runtime
//!
//! Hosts business logic behind the [`Chaincode`] trait and multiplexes its
//! transactions over one duplex stream to a ledger peer. The
//! [`InvocationTaskManager`] performs the registration handshake, routes
//! every inbound message, runs each transaction on a bounded worker pool and
//! reports exactly one terminal result per transaction.
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use chaincode_shim::{Chaincode, ChaincodeStub, InvocationTaskManager, Response, ShimConfig, Transport};
//!
//! struct Counter;
//!
//! #[async_trait]
//! impl Chaincode for Counter {
//!     async fn init(&self, _stub: &mut ChaincodeStub) -> Response {
//!         Response::success(Vec::new())
//!     }
//!
//!     async fn invoke(&self, stub: &mut ChaincodeStub) -> Response {
//!         match stub.get_state("counter").await {
//!             Ok(value) => Response::success(value),
//!             Err(err) => err.to_response(),
//!         }
//!     }
//! }
//!
//! # async fn demo() -> Result<(), chaincode_shim::ShimError> {
//! let config = ShimConfig::new("counter:1.0");
//! let transport = Transport::connect(&config.peer_address, config.outbound_queue_capacity).await?;
//! let (sender, inbound) = transport.split();
//! let manager = InvocationTaskManager::new(config, Arc::new(Counter), sender);
//! manager.run(inbound).await
//! # }
//! ```

pub mod chaincode;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod manager;
pub mod stub;
pub mod telemetry;
pub mod transport;
pub mod worker;

pub use chaincode::Chaincode;
pub use chaincode_protocol::{ChaincodeEvent, ChaincodeMessage, KeyModification, KeyValue, MessageType, Response};
pub use config::ShimConfig;
pub use context::{InvocationKind, TransactionContext, TxKey, TxPhase};
pub use error::{HandshakeError, ShimError, ShimResult};
pub use manager::{InvocationTaskManager, SessionPhase};
pub use stub::{ChaincodeStub, HistoryQueryIterator, QueryIterator, StateQueryIterator};
pub use telemetry::{
    MetricsSnapshot, NoopObserver, SessionMetrics, TracingObserver, TransactionInfo,
    TransactionObserver, TransactionOutcome,
};
pub use transport::{PeerEnd, PeerSender, Transport};
pub use worker::WorkerPool;
