//! Per-transaction state and the correlation table that turns asynchronous
//! peer round trips into awaitable state operations.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chaincode_protocol::{ChaincodeInput, ChaincodeMessage, MessageType, QueryStateClose};
use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use crate::error::{ShimError, ShimResult};
use crate::telemetry::{SessionMetrics, TransactionInfo};
use crate::transport::PeerSender;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry key: transaction ids are only unique within a channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TxKey {
    pub channel_id: String,
    pub txid: String,
}

impl TxKey {
    pub fn of(msg: &ChaincodeMessage) -> Self {
        Self {
            channel_id: msg.channel_id.clone(),
            txid: msg.txid.clone(),
        }
    }
}

impl fmt::Display for TxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.txid)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationKind {
    Init,
    Invoke,
}

impl InvocationKind {
    pub fn from_message(kind: MessageType) -> Option<Self> {
        match kind {
            MessageType::Init => Some(InvocationKind::Init),
            MessageType::Transaction => Some(InvocationKind::Invoke),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationKind::Init => "init",
            InvocationKind::Invoke => "invoke",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPhase {
    Created,
    Executing,
    Completed,
    Failed,
}

impl TxPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxPhase::Completed | TxPhase::Failed)
    }
}

struct PendingRequest {
    kind: MessageType,
    reply: oneshot::Sender<ChaincodeMessage>,
}

#[derive(Default)]
struct Correlation {
    pending: HashMap<u64, PendingRequest>,
    fulfilled: HashSet<u64>,
    cancelled: bool,
}

/// Result of routing a reply into a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fulfillment {
    Delivered { correlation_id: u64, kind: MessageType },
    /// A second reply for an id that was already answered.
    Duplicate(u64),
    /// The waiter gave up (timeout or cancellation) before the reply arrived.
    Late(u64),
    Unknown(Option<u64>),
    /// No correlation id and not exactly one outstanding request.
    Ambiguous(usize),
}

pub struct TransactionContext {
    key: TxKey,
    kind: InvocationKind,
    info: TransactionInfo,
    phase: Mutex<TxPhase>,
    correlation: Mutex<Correlation>,
    next_correlation: AtomicU64,
    failure: Mutex<Option<ShimError>>,
    finished: AtomicBool,
    worker: Mutex<Option<AbortHandle>>,
    /// Peer-side cursors opened by this transaction and not yet closed.
    open_queries: Mutex<Vec<String>>,
    sender: PeerSender,
    request_timeout: Duration,
    metrics: Arc<SessionMetrics>,
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("phase", &self.phase())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

impl TransactionContext {
    pub(crate) fn new(
        key: TxKey,
        kind: InvocationKind,
        input: &ChaincodeInput,
        sender: PeerSender,
        request_timeout: Duration,
        metrics: Arc<SessionMetrics>,
    ) -> Self {
        let function = input
            .args
            .first()
            .map(|arg| String::from_utf8_lossy(arg).into_owned());
        let info = TransactionInfo {
            channel_id: key.channel_id.clone(),
            tx_id: key.txid.clone(),
            kind,
            function,
            started_at: Instant::now(),
        };
        Self {
            key,
            kind,
            info,
            phase: Mutex::new(TxPhase::Created),
            correlation: Mutex::new(Correlation::default()),
            next_correlation: AtomicU64::new(1),
            failure: Mutex::new(None),
            finished: AtomicBool::new(false),
            worker: Mutex::new(None),
            open_queries: Mutex::new(Vec::new()),
            sender,
            request_timeout,
            metrics,
        }
    }

    pub fn key(&self) -> &TxKey {
        &self.key
    }

    pub fn channel_id(&self) -> &str {
        &self.key.channel_id
    }

    pub fn txid(&self) -> &str {
        &self.key.txid
    }

    pub fn kind(&self) -> InvocationKind {
        self.kind
    }

    pub fn info(&self) -> &TransactionInfo {
        &self.info
    }

    pub fn phase(&self) -> TxPhase {
        *lock(&self.phase)
    }

    pub(crate) fn set_phase(&self, phase: TxPhase) {
        *lock(&self.phase) = phase;
    }

    pub fn outstanding(&self) -> usize {
        lock(&self.correlation).pending.len()
    }

    pub fn is_cancelled(&self) -> bool {
        lock(&self.correlation).cancelled
    }

    /// Sends one state operation and waits for its correlated reply.
    ///
    /// Returns the RESPONSE payload; a peer ERROR becomes
    /// [`ShimError::Application`]. Timeouts and cancellation also mark the
    /// whole transaction as failed.
    pub async fn request<T: Serialize>(&self, kind: MessageType, payload: &T) -> ShimResult<Vec<u8>> {
        self.exchange(kind, payload, true).await
    }

    async fn exchange<T: Serialize>(
        &self,
        kind: MessageType,
        payload: &T,
        poison_on_failure: bool,
    ) -> ShimResult<Vec<u8>> {
        let body = serde_json::to_vec(payload)?;
        let (correlation_id, reply_rx) = self.register_pending(kind)?;

        let msg = ChaincodeMessage::new(kind, self.channel_id(), self.txid(), body)
            .with_correlation(correlation_id);
        debug!(tx = %self.key, %kind, correlation_id, "Sending state request");
        if let Err(err) = self.sender.send(msg).await {
            lock(&self.correlation).pending.remove(&correlation_id);
            return Err(err);
        }

        let reply = match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => {
                if poison_on_failure {
                    self.poison(ShimError::Cancelled);
                }
                return Err(ShimError::Cancelled);
            }
            Err(_) => {
                lock(&self.correlation).pending.remove(&correlation_id);
                self.metrics.record_timeout();
                warn!(
                    tx = %self.key,
                    %kind,
                    correlation_id,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "State request timed out"
                );
                if poison_on_failure {
                    self.poison(ShimError::RequestTimeout {
                        kind,
                        timeout: self.request_timeout,
                    });
                }
                return Err(ShimError::RequestTimeout {
                    kind,
                    timeout: self.request_timeout,
                });
            }
        };

        match reply.msg_type {
            MessageType::Response => Ok(reply.payload),
            MessageType::Error => Err(ShimError::Application(reply.payload_text())),
            other => Err(ShimError::violation(format!(
                "{other} is not a valid reply to {kind}"
            ))),
        }
    }

    fn register_pending(
        &self,
        kind: MessageType,
    ) -> ShimResult<(u64, oneshot::Receiver<ChaincodeMessage>)> {
        let mut correlation = lock(&self.correlation);
        if correlation.cancelled {
            return Err(ShimError::Cancelled);
        }
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let (reply, reply_rx) = oneshot::channel();
        correlation
            .pending
            .insert(correlation_id, PendingRequest { kind, reply });
        Ok((correlation_id, reply_rx))
    }

    /// Hands `reply` to the waiting state operation, at most once per id.
    pub(crate) fn fulfill(&self, reply: ChaincodeMessage) -> Fulfillment {
        let mut correlation = lock(&self.correlation);
        let correlation_id = match reply.correlation_id {
            Some(id) => id,
            None => {
                if correlation.pending.len() != 1 {
                    return Fulfillment::Ambiguous(correlation.pending.len());
                }
                match correlation.pending.keys().next().copied() {
                    Some(id) => id,
                    None => return Fulfillment::Ambiguous(0),
                }
            }
        };

        let Some(entry) = correlation.pending.remove(&correlation_id) else {
            if correlation.fulfilled.contains(&correlation_id) {
                return Fulfillment::Duplicate(correlation_id);
            }
            if correlation_id > 0 && correlation_id < self.next_correlation.load(Ordering::Relaxed) {
                return Fulfillment::Late(correlation_id);
            }
            return Fulfillment::Unknown(reply.correlation_id);
        };

        correlation.fulfilled.insert(correlation_id);
        let kind = entry.kind;
        if entry.reply.send(reply).is_err() {
            return Fulfillment::Late(correlation_id);
        }
        Fulfillment::Delivered {
            correlation_id,
            kind,
        }
    }

    /// Fails every outstanding request with `Cancelled` and refuses new ones.
    pub(crate) fn cancel(&self) {
        let dropped = {
            let mut correlation = lock(&self.correlation);
            correlation.cancelled = true;
            std::mem::take(&mut correlation.pending)
        };
        if !dropped.is_empty() {
            debug!(tx = %self.key, outstanding = dropped.len(), "Cancelling pending requests");
        }
    }

    /// Records the first transaction-fatal error; later ones are ignored.
    pub(crate) fn poison(&self, err: ShimError) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    pub(crate) fn take_failure(&self) -> Option<ShimError> {
        lock(&self.failure).take()
    }

    /// Claims the right to send the terminal result. True exactly once.
    pub(crate) fn try_finish(&self) -> bool {
        self.finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn attach_worker(&self, handle: AbortHandle) {
        *lock(&self.worker) = Some(handle);
    }

    pub(crate) fn abort_worker(&self) {
        if let Some(handle) = lock(&self.worker).take() {
            handle.abort();
        }
    }

    pub(crate) fn track_query(&self, id: &str) {
        let mut open = lock(&self.open_queries);
        if !open.iter().any(|known| known == id) {
            open.push(id.to_string());
        }
    }

    pub(crate) fn forget_query(&self, id: &str) {
        lock(&self.open_queries).retain(|known| known != id);
    }

    pub fn open_queries(&self) -> usize {
        lock(&self.open_queries).len()
    }

    /// Closes cursors that business logic left open. Failures are logged and
    /// do not change the transaction outcome.
    pub(crate) async fn close_open_queries(&self) {
        let leftover = std::mem::take(&mut *lock(&self.open_queries));
        if leftover.is_empty() || self.is_cancelled() {
            return;
        }
        debug!(tx = %self.key, count = leftover.len(), "Closing query cursors left open");
        for id in leftover {
            let payload = QueryStateClose { id: id.clone() };
            if let Err(err) = self.exchange(MessageType::QueryStateClose, &payload, false).await {
                warn!(tx = %self.key, query = %id, "Could not close query cursor: {}", err);
                if err.is_session_fatal() || matches!(err, ShimError::Cancelled) {
                    return;
                }
            }
        }
    }
}
