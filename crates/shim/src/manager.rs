//! The Invocation Task Manager: session lifecycle, the transaction registry
//! and dispatch of business logic onto the worker pool.
//!
//! The registry is the only state shared between the reader loop and the
//! workers. Its lock is held for inserts, lookups and removals only; it is
//! never held across an `.await`, so a slow transaction cannot stall intake
//! for any other.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chaincode_protocol::{ChaincodeEvent, ChaincodeId, ChaincodeInput, ChaincodeMessage, MessageType};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chaincode::Chaincode;
use crate::config::ShimConfig;
use crate::context::{lock, Fulfillment, InvocationKind, TransactionContext, TxKey, TxPhase};
use crate::dispatcher::{classify, Route};
use crate::error::{HandshakeError, ShimError, ShimResult};
use crate::telemetry::{
    notify_end, notify_start, MetricsSnapshot, NoopObserver, SessionMetrics, TransactionObserver,
    TransactionOutcome,
};
use crate::transport::PeerSender;
use crate::worker::{run_chaincode, WorkerPool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Created,
    /// REGISTER sent, waiting for the peer's confirmation.
    Established,
    Ready,
    /// Terminal. No transactions are accepted.
    Error,
}

impl SessionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPhase::Created => "created",
            SessionPhase::Established => "established",
            SessionPhase::Ready => "ready",
            SessionPhase::Error => "error",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct Inner {
    session_id: Uuid,
    config: ShimConfig,
    chaincode: Arc<dyn Chaincode>,
    observer: Arc<dyn TransactionObserver>,
    sender: PeerSender,
    phase: Mutex<SessionPhase>,
    contexts: Mutex<HashMap<TxKey, Arc<TransactionContext>>>,
    metrics: Arc<SessionMetrics>,
    pool: WorkerPool,
    shutting_down: AtomicBool,
    drained: Notify,
}

/// One shim session. Cheap to clone; clones share the session.
#[derive(Clone)]
pub struct InvocationTaskManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for InvocationTaskManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationTaskManager")
            .field("session_id", &self.inner.session_id)
            .field("chaincode_id", &self.inner.config.chaincode_id)
            .field("phase", &self.phase())
            .field("active", &self.active_transactions())
            .finish()
    }
}

impl InvocationTaskManager {
    pub fn new(config: ShimConfig, chaincode: Arc<dyn Chaincode>, sender: PeerSender) -> Self {
        Self::with_observer(config, chaincode, Arc::new(NoopObserver), sender)
    }

    pub fn with_observer(
        config: ShimConfig,
        chaincode: Arc<dyn Chaincode>,
        observer: Arc<dyn TransactionObserver>,
        sender: PeerSender,
    ) -> Self {
        let pool = WorkerPool::new(config.max_concurrent_transactions);
        Self {
            inner: Arc::new(Inner {
                session_id: Uuid::new_v4(),
                config,
                chaincode,
                observer,
                sender,
                phase: Mutex::new(SessionPhase::Created),
                contexts: Mutex::new(HashMap::new()),
                metrics: Arc::new(SessionMetrics::default()),
                pool,
                shutting_down: AtomicBool::new(false),
                drained: Notify::new(),
            }),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.inner.session_id
    }

    pub fn chaincode_id(&self) -> &str {
        &self.inner.config.chaincode_id
    }

    pub fn config(&self) -> &ShimConfig {
        &self.inner.config
    }

    pub fn phase(&self) -> SessionPhase {
        *lock(&self.inner.phase)
    }

    fn set_phase(&self, phase: SessionPhase) {
        let previous = std::mem::replace(&mut *lock(&self.inner.phase), phase);
        if previous != phase {
            debug!(session = %self.inner.session_id, from = %previous, to = %phase, "Session phase changed");
        }
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn active_transactions(&self) -> usize {
        lock(&self.inner.contexts).len()
    }

    pub fn is_active(&self, channel_id: &str, txid: &str) -> bool {
        let key = TxKey {
            channel_id: channel_id.to_string(),
            txid: txid.to_string(),
        };
        lock(&self.inner.contexts).contains_key(&key)
    }

    /// Registers with the peer and waits for READY.
    ///
    /// Reads from `inbound` until READY arrives or the registration window
    /// closes. Any failure leaves the session in [`SessionPhase::Error`].
    pub async fn start(&self, inbound: &mut mpsc::Receiver<ChaincodeMessage>) -> ShimResult<()> {
        {
            let mut phase = lock(&self.inner.phase);
            if *phase != SessionPhase::Created {
                return Err(HandshakeError::AlreadyStarted.into());
            }
            *phase = SessionPhase::Established;
        }

        let chaincode_id = ChaincodeId::new(self.inner.config.chaincode_id.clone());
        let register = ChaincodeMessage::with_payload(MessageType::Register, "", "", &chaincode_id)?;
        if let Err(err) = self.inner.sender.send(register).await {
            self.set_phase(SessionPhase::Error);
            return Err(err);
        }
        info!(
            session = %self.inner.session_id,
            chaincode = %self.inner.config.chaincode_id,
            "Registration sent, waiting for peer"
        );

        let window = self.inner.config.registration_timeout();
        match tokio::time::timeout(window, self.await_ready(inbound)).await {
            Ok(Ok(())) => {
                self.set_phase(SessionPhase::Ready);
                info!(session = %self.inner.session_id, "Session ready");
                Ok(())
            }
            Ok(Err(err)) => {
                self.set_phase(SessionPhase::Error);
                error!(session = %self.inner.session_id, "Handshake failed: {}", err);
                Err(err)
            }
            Err(_) => {
                self.set_phase(SessionPhase::Error);
                error!(
                    session = %self.inner.session_id,
                    timeout_ms = window.as_millis() as u64,
                    "Handshake timed out"
                );
                Err(HandshakeError::Timeout(window).into())
            }
        }
    }

    async fn await_ready(&self, inbound: &mut mpsc::Receiver<ChaincodeMessage>) -> ShimResult<()> {
        let mut registered = false;
        loop {
            let Some(msg) = inbound.recv().await else {
                return Err(self
                    .inner
                    .sender
                    .failure()
                    .unwrap_or_else(|| HandshakeError::StreamClosed.into()));
            };
            match msg.msg_type {
                MessageType::Registered if !registered && !msg.has_txid() => {
                    debug!(session = %self.inner.session_id, "Registration confirmed");
                    registered = true;
                }
                MessageType::Ready if registered && !msg.has_txid() => return Ok(()),
                MessageType::Keepalive if !msg.has_txid() => self.echo_keepalive(msg)?,
                MessageType::Error if !msg.has_txid() => {
                    return Err(HandshakeError::Rejected(msg.payload_text()).into());
                }
                received => {
                    let phase = if registered {
                        "awaiting ready"
                    } else {
                        "awaiting registration"
                    };
                    return Err(HandshakeError::UnexpectedMessage { received, phase }.into());
                }
            }
        }
    }

    /// Entry point for every inbound message once the session is up.
    ///
    /// Only session-fatal conditions are returned as errors; everything that
    /// concerns a single transaction is handled or dropped here.
    pub async fn on_message(&self, msg: ChaincodeMessage) -> ShimResult<()> {
        if self.phase() == SessionPhase::Error {
            debug!(msg_type = %msg.msg_type, txid = %msg.txid, "Session closed; dropping message");
            self.inner.metrics.record_dropped();
            return Ok(());
        }

        match classify(&msg) {
            Route::Lifecycle => self.on_lifecycle(msg),
            Route::Event => {
                warn!(session = %self.inner.session_id, "Peer reported an error: {}", msg.payload_text());
                Ok(())
            }
            Route::TransactionStart => self.on_transaction_start(msg),
            Route::CorrelatedReply => self.on_reply(msg),
            Route::Unroutable(reason) => self.violation(&msg, reason.describe()),
        }
    }

    fn on_lifecycle(&self, msg: ChaincodeMessage) -> ShimResult<()> {
        match msg.msg_type {
            MessageType::Keepalive => self.echo_keepalive(msg),
            other => {
                warn!(phase = %self.phase(), "Ignoring {} outside the handshake", other);
                Ok(())
            }
        }
    }

    fn echo_keepalive(&self, msg: ChaincodeMessage) -> ShimResult<()> {
        debug!("Keepalive");
        self.inner
            .sender
            .send_nowait(ChaincodeMessage::session(MessageType::Keepalive, msg.payload))
    }

    fn on_transaction_start(&self, msg: ChaincodeMessage) -> ShimResult<()> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            return self.refuse(&msg, ShimError::Cancelled);
        }
        if self.phase() != SessionPhase::Ready {
            return self.refuse(&msg, ShimError::violation("session is not ready"));
        }
        let Some(kind) = InvocationKind::from_message(msg.msg_type) else {
            return self.violation(&msg, "not a transaction start");
        };

        let mut input = if msg.payload.is_empty() {
            ChaincodeInput::default()
        } else {
            match msg.decode_payload::<ChaincodeInput>() {
                Ok(input) => input,
                Err(err) => {
                    self.violation(&msg, "undecodable chaincode input")?;
                    return self.refuse(&msg, ShimError::InvalidArgument(err.to_string()));
                }
            }
        };
        input.is_init |= kind == InvocationKind::Init;

        let key = TxKey::of(&msg);
        let ctx = Arc::new(TransactionContext::new(
            key.clone(),
            kind,
            &input,
            self.inner.sender.clone(),
            self.inner.config.request_timeout(),
            self.inner.metrics.clone(),
        ));
        {
            let mut contexts = lock(&self.inner.contexts);
            if contexts.contains_key(&key) {
                drop(contexts);
                return self.violation(&msg, "transaction already in flight");
            }
            contexts.insert(key, ctx.clone());
        }

        self.inner.metrics.record_started();
        notify_start(self.inner.observer.as_ref(), ctx.info());
        debug!(tx = %ctx.key(), kind = kind.as_str(), "Dispatching transaction");

        let manager = self.clone();
        self.inner.pool.spawn(async move {
            manager.execute(ctx, input).await;
        });
        Ok(())
    }

    fn on_reply(&self, msg: ChaincodeMessage) -> ShimResult<()> {
        let key = TxKey::of(&msg);
        let ctx = lock(&self.inner.contexts).get(&key).cloned();
        let Some(ctx) = ctx else {
            debug!(tx = %key, msg_type = %msg.msg_type, "Reply for a finished or unknown transaction; dropping");
            self.inner.metrics.record_dropped();
            return Ok(());
        };

        let msg_type = msg.msg_type;
        let txid = msg.txid.clone();
        let channel_id = msg.channel_id.clone();
        match ctx.fulfill(msg) {
            Fulfillment::Delivered {
                correlation_id,
                kind,
            } => {
                debug!(tx = %key, %kind, correlation_id, reply = %msg_type, "Reply delivered");
                Ok(())
            }
            Fulfillment::Late(correlation_id) => {
                debug!(tx = %key, correlation_id, "Late reply after the waiter gave up; dropping");
                self.inner.metrics.record_dropped();
                Ok(())
            }
            rejected => {
                let detail = match rejected {
                    Fulfillment::Duplicate(id) => format!("duplicate reply for correlation id {id}"),
                    Fulfillment::Unknown(Some(id)) => format!("unknown correlation id {id}"),
                    Fulfillment::Unknown(None) => "reply without correlation id".to_string(),
                    Fulfillment::Ambiguous(outstanding) => format!(
                        "reply without correlation id while {outstanding} requests are outstanding"
                    ),
                    _ => "unmatched reply".to_string(),
                };
                let header = ChaincodeMessage::new(msg_type, channel_id, txid, Vec::new());
                self.violation(&header, &detail)
            }
        }
    }

    /// Logs and counts a dropped message; escalates once the configured
    /// threshold is exceeded.
    fn violation(&self, msg: &ChaincodeMessage, detail: &str) -> ShimResult<()> {
        let count = self.inner.metrics.record_violation();
        warn!(
            msg_type = %msg.msg_type,
            channel = %msg.channel_id,
            txid = %msg.txid,
            count,
            "Protocol violation, dropping message: {}",
            detail
        );
        let threshold = self.inner.config.protocol_violation_threshold;
        if threshold > 0 && count > threshold {
            error!(count, threshold, "Protocol violation threshold exceeded");
            return Err(ShimError::transport(format!(
                "{count} protocol violations exceed threshold {threshold}"
            )));
        }
        Ok(())
    }

    fn refuse(&self, msg: &ChaincodeMessage, reason: ShimError) -> ShimResult<()> {
        warn!(channel = %msg.channel_id, txid = %msg.txid, "Refusing transaction: {}", reason);
        self.inner.metrics.record_dropped();
        let reply = ChaincodeMessage::with_payload(
            MessageType::Error,
            msg.channel_id.clone(),
            msg.txid.clone(),
            &reason.to_response(),
        )?;
        self.inner.sender.send_nowait(reply)
    }

    async fn execute(&self, ctx: Arc<TransactionContext>, input: ChaincodeInput) {
        ctx.set_phase(TxPhase::Executing);
        let result = run_chaincode(
            self.inner.chaincode.clone(),
            ctx.clone(),
            input,
            self.inner.config.chaincode_id.clone(),
        )
        .await;
        ctx.close_open_queries().await;

        let (outcome, event) = match (ctx.take_failure(), result) {
            (Some(err), _) | (None, Err(err)) => (TransactionOutcome::Failed(err.to_response()), None),
            (None, Ok(execution)) if execution.response.is_success() => {
                (TransactionOutcome::Completed(execution.response), execution.event)
            }
            (None, Ok(execution)) => (TransactionOutcome::Failed(execution.response), None),
        };
        self.finish(&ctx, outcome, event).await;
    }

    /// Sends the terminal result and releases the context, at most once.
    async fn finish(
        &self,
        ctx: &Arc<TransactionContext>,
        outcome: TransactionOutcome,
        event: Option<ChaincodeEvent>,
    ) {
        if !ctx.try_finish() {
            debug!(tx = %ctx.key(), "Terminal result already sent");
            return;
        }

        let (phase, msg) = match &outcome {
            TransactionOutcome::Completed(response) => (
                TxPhase::Completed,
                ChaincodeMessage::with_payload(
                    MessageType::Completed,
                    ctx.channel_id(),
                    ctx.txid(),
                    response,
                )
                .map(|msg| msg.with_event(event)),
            ),
            TransactionOutcome::Failed(response) => (
                TxPhase::Failed,
                ChaincodeMessage::with_payload(
                    MessageType::Error,
                    ctx.channel_id(),
                    ctx.txid(),
                    response,
                ),
            ),
        };
        ctx.set_phase(phase);

        match msg {
            Ok(msg) => {
                if let Err(err) = self.inner.sender.send(msg).await {
                    error!(tx = %ctx.key(), "Terminal result lost, peer stream is broken: {}", err);
                }
            }
            Err(err) => error!(tx = %ctx.key(), "Could not encode terminal result: {}", err),
        }

        ctx.cancel();
        let now_empty = {
            let mut contexts = lock(&self.inner.contexts);
            if contexts
                .get(ctx.key())
                .is_some_and(|current| Arc::ptr_eq(current, ctx))
            {
                contexts.remove(ctx.key());
            }
            contexts.is_empty()
        };

        self.inner.metrics.record_outcome(&outcome);
        notify_end(self.inner.observer.as_ref(), ctx.info(), &outcome);
        if now_empty {
            self.inner.drained.notify_waiters();
        }
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if lock(&self.inner.contexts).is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Reader loop: routes inbound messages until the peer closes the stream
    /// cleanly (`Ok`) or a session-fatal error occurs. A broken stream in
    /// either direction is reported as [`ShimError::Transport`].
    pub async fn serve(&self, mut inbound: mpsc::Receiver<ChaincodeMessage>) -> ShimResult<()> {
        let metrics_task = self.spawn_metrics_logger();
        let result = loop {
            tokio::select! {
                received = inbound.recv() => match received {
                    Some(msg) => {
                        if let Err(err) = self.on_message(msg).await {
                            error!(session = %self.inner.session_id, "Session failed: {}", err);
                            break Err(err);
                        }
                    }
                    None => match self.inner.sender.failure() {
                        Some(err) => {
                            error!(session = %self.inner.session_id, "Session failed: {}", err);
                            break Err(err);
                        }
                        None => {
                            info!(session = %self.inner.session_id, "Peer stream closed");
                            break Ok(());
                        }
                    },
                },
                err = self.inner.sender.failed() => {
                    error!(session = %self.inner.session_id, "Session failed: {}", err);
                    break Err(err);
                }
            }
        };
        if let Some(task) = metrics_task {
            task.abort();
        }
        result
    }

    /// Handshake, reader loop and shutdown in one call.
    pub async fn run(&self, mut inbound: mpsc::Receiver<ChaincodeMessage>) -> ShimResult<()> {
        if let Err(err) = self.start(&mut inbound).await {
            self.shutdown().await;
            return Err(err);
        }
        let result = self.serve(inbound).await;
        self.shutdown().await;
        result
    }

    /// Cancels outstanding state operations, gives running business logic
    /// the configured grace period, then fails whatever is left with
    /// `Cancelled`. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            debug!("Shutdown already in progress");
            return;
        }

        let in_flight: Vec<Arc<TransactionContext>> =
            lock(&self.inner.contexts).values().cloned().collect();
        info!(
            session = %self.inner.session_id,
            in_flight = in_flight.len(),
            "Shutting down shim session"
        );
        for ctx in &in_flight {
            ctx.cancel();
        }

        let grace = self.inner.config.shutdown_grace();
        if tokio::time::timeout(grace, self.wait_drained()).await.is_err() {
            let leftover: Vec<Arc<TransactionContext>> =
                lock(&self.inner.contexts).values().cloned().collect();
            warn!(
                remaining = leftover.len(),
                grace_ms = grace.as_millis() as u64,
                "Grace period elapsed; cancelling remaining transactions"
            );
            for ctx in leftover {
                ctx.abort_worker();
                self.finish(
                    &ctx,
                    TransactionOutcome::Failed(ShimError::Cancelled.to_response()),
                    None,
                )
                .await;
            }
        }
        self.inner.pool.close();

        self.set_phase(SessionPhase::Error);
        lock(&self.inner.contexts).clear();
        let snapshot = self.metrics();
        info!(
            session = %self.inner.session_id,
            completed = snapshot.transactions_completed,
            failed = snapshot.transactions_failed,
            "Shim session stopped"
        );
    }

    fn spawn_metrics_logger(&self) -> Option<JoinHandle<()>> {
        let period = self.inner.config.metrics_log_interval()?;
        let metrics = self.inner.metrics.clone();
        let session = self.inner.session_id;
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match serde_json::to_string(&metrics.snapshot()) {
                    Ok(json) => info!(%session, metrics = %json, "Session metrics"),
                    Err(err) => warn!("Failed to render session metrics: {}", err),
                }
            }
        }))
    }
}
