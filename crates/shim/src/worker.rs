//! Bounded execution of business logic, off the reader loop.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use chaincode_protocol::{ChaincodeEvent, ChaincodeInput, Response};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::chaincode::Chaincode;
use crate::context::{InvocationKind, TransactionContext};
use crate::error::{ShimError, ShimResult};
use crate::stub::ChaincodeStub;

/// Caps how many transactions execute at once. Work queued behind a full
/// pool waits for a permit; the reader loop never does.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn spawn<F>(&self, work: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                debug!("Worker pool closed; dropping queued work");
                return;
            };
            work.await;
        })
    }

    /// Queued work that has not started yet is dropped.
    pub fn close(&self) {
        self.permits.close();
    }
}

/// What business logic produced for one transaction.
pub(crate) struct Execution {
    pub response: Response,
    pub event: Option<ChaincodeEvent>,
}

/// Runs `init` or `invoke` on its own task so a panic or an abort surfaces
/// as an error instead of tearing down the worker.
pub(crate) async fn run_chaincode(
    chaincode: Arc<dyn Chaincode>,
    ctx: Arc<TransactionContext>,
    input: ChaincodeInput,
    chaincode_id: String,
) -> ShimResult<Execution> {
    let kind = ctx.kind();
    let mut stub = ChaincodeStub::new(ctx.clone(), input, chaincode_id);
    let handle = tokio::spawn(async move {
        let response = match kind {
            InvocationKind::Init => chaincode.init(&mut stub).await,
            InvocationKind::Invoke => chaincode.invoke(&mut stub).await,
        };
        Execution {
            response,
            event: stub.take_event(),
        }
    });
    ctx.attach_worker(handle.abort_handle());

    match handle.await {
        Ok(execution) => Ok(execution),
        Err(err) if err.is_panic() => {
            let reason = panic_message(err.into_panic());
            error!(tx = %ctx.key(), "Chaincode panicked: {}", reason);
            Err(ShimError::Application(format!("chaincode panicked: {reason}")))
        }
        Err(_) => Err(ShimError::Cancelled),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
