use async_trait::async_trait;
use chaincode_protocol::Response;

use crate::stub::ChaincodeStub;

/// Business logic hosted by the shim.
///
/// Both methods run on the worker pool, one call per transaction, possibly
/// many at once. A returned status below 400 completes the transaction; any
/// other status, a panic, or a timed-out state operation fails it.
#[async_trait]
pub trait Chaincode: Send + Sync + 'static {
    async fn init(&self, stub: &mut ChaincodeStub) -> Response;

    async fn invoke(&self, stub: &mut ChaincodeStub) -> Response;
}
