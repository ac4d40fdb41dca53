//! The duplex peer stream, modelled as two directional FIFO queues.

use std::sync::{Arc, Mutex};

use chaincode_protocol::{read_message, write_message, ChaincodeMessage};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, error, warn};

use crate::context::lock;
use crate::error::{ShimError, ShimResult};

/// First fatal failure seen on either direction of the stream. A clean end of
/// stream never sets it.
#[derive(Debug, Default)]
struct StreamHealth {
    failure: Mutex<Option<String>>,
    failed: Notify,
}

impl StreamHealth {
    fn fail(&self, reason: String) {
        {
            let mut failure = lock(&self.failure);
            if failure.is_some() {
                return;
            }
            *failure = Some(reason);
        }
        self.failed.notify_waiters();
    }

    fn failure(&self) -> Option<String> {
        lock(&self.failure).clone()
    }

    async fn wait(&self) -> String {
        loop {
            let notified = self.failed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(reason) = self.failure() {
                return reason;
            }
            notified.await;
        }
    }
}

/// Cloneable handle for the outbound direction. Sends are FIFO and fail once
/// the writer side has gone away; nothing is retried. A failed send marks
/// the whole stream as failed.
#[derive(Clone, Debug)]
pub struct PeerSender {
    tx: mpsc::Sender<ChaincodeMessage>,
    health: Arc<StreamHealth>,
}

impl PeerSender {
    fn new(tx: mpsc::Sender<ChaincodeMessage>, health: Arc<StreamHealth>) -> Self {
        Self { tx, health }
    }

    pub async fn send(&self, msg: ChaincodeMessage) -> ShimResult<()> {
        let msg_type = msg.msg_type;
        if self.tx.send(msg).await.is_err() {
            let reason = format!("peer stream closed while sending {msg_type}");
            self.health.fail(reason.clone());
            return Err(ShimError::transport(reason));
        }
        Ok(())
    }

    /// Queues `msg` without waiting for room. If the queue is full the send
    /// completes on a background task, so the caller never blocks on a slow
    /// writer.
    pub fn send_nowait(&self, msg: ChaincodeMessage) -> ShimResult<()> {
        match self.tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                let sender = self.clone();
                tokio::spawn(async move {
                    let msg_type = msg.msg_type;
                    if let Err(err) = sender.send(msg).await {
                        warn!(%msg_type, "Deferred send failed: {}", err);
                    }
                });
                Ok(())
            }
            Err(TrySendError::Closed(msg)) => {
                let reason = format!("peer stream closed while sending {}", msg.msg_type);
                self.health.fail(reason.clone());
                Err(ShimError::transport(reason))
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// The stream failure, if one has been recorded.
    pub fn failure(&self) -> Option<ShimError> {
        self.health.failure().map(ShimError::transport)
    }

    /// Resolves once the stream has failed.
    pub async fn failed(&self) -> ShimError {
        ShimError::transport(self.health.wait().await)
    }
}

/// Shim side of a peer connection.
pub struct Transport {
    pub sender: PeerSender,
    pub inbound: mpsc::Receiver<ChaincodeMessage>,
}

/// Peer side of an in-memory transport: what the shim sent, and a way to
/// deliver messages to it.
pub struct PeerEnd {
    pub outbound: mpsc::Receiver<ChaincodeMessage>,
    pub inbound: mpsc::Sender<ChaincodeMessage>,
    health: Arc<StreamHealth>,
}

impl PeerEnd {
    /// Next message written by the shim, `None` once it hung up.
    pub async fn recv(&mut self) -> Option<ChaincodeMessage> {
        self.outbound.recv().await
    }

    pub async fn send(&self, msg: ChaincodeMessage) -> ShimResult<()> {
        self.inbound
            .send(msg)
            .await
            .map_err(|_| ShimError::transport("shim stopped reading"))
    }

    /// Closes the inbound direction, which the shim observes as end of stream.
    pub fn close(self) -> mpsc::Receiver<ChaincodeMessage> {
        self.outbound
    }

    /// Breaks the connection the way an I/O error would: the shim sees the
    /// inbound direction end with `reason` recorded as a stream failure.
    pub fn fail(self, reason: impl Into<String>) -> mpsc::Receiver<ChaincodeMessage> {
        self.health.fail(reason.into());
        self.outbound
    }
}

impl Transport {
    pub fn split(self) -> (PeerSender, mpsc::Receiver<ChaincodeMessage>) {
        (self.sender, self.inbound)
    }

    pub fn in_memory(capacity: usize) -> (Transport, PeerEnd) {
        let (out_tx, out_rx) = mpsc::channel(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let health = Arc::new(StreamHealth::default());
        (
            Transport {
                sender: PeerSender::new(out_tx, health.clone()),
                inbound: in_rx,
            },
            PeerEnd {
                outbound: out_rx,
                inbound: in_tx,
                health,
            },
        )
    }

    /// Runs the line codec over `stream` on two background tasks.
    pub fn from_stream<S>(stream: S, capacity: usize) -> Transport
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let (out_tx, mut out_rx) = mpsc::channel::<ChaincodeMessage>(capacity);
        let (in_tx, in_rx) = mpsc::channel(capacity);
        let health = Arc::new(StreamHealth::default());

        let read_health = health.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(reader);
            loop {
                match read_message(&mut reader).await {
                    Ok(Some(msg)) => {
                        if in_tx.send(msg).await.is_err() {
                            debug!("Inbound consumer dropped; stopping reader");
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("Peer closed the stream");
                        break;
                    }
                    Err(err) if err.is_stream_failure() => {
                        error!("Peer stream read failed: {}", err);
                        read_health.fail(format!("peer stream read failed: {err}"));
                        break;
                    }
                    Err(err) => {
                        warn!("Dropping undecodable frame: {}", err);
                    }
                }
            }
        });

        let write_health = health.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                if let Err(err) = write_message(&mut writer, &msg).await {
                    error!(msg_type = %msg.msg_type, txid = %msg.txid, "Peer stream write failed: {}", err);
                    write_health.fail(format!("peer stream write failed: {err}"));
                    break;
                }
            }
        });

        Transport {
            sender: PeerSender::new(out_tx, health),
            inbound: in_rx,
        }
    }

    /// Dials `unix:<path>` or a `host:port` TCP address.
    pub async fn connect(address: &str, capacity: usize) -> ShimResult<Transport> {
        let address = address.trim();
        #[cfg(unix)]
        if let Some(path) = address.strip_prefix("unix:") {
            let stream = UnixStream::connect(path)
                .await
                .map_err(|err| ShimError::transport(format!("connect {address}: {err}")))?;
            return Ok(Self::from_stream(stream, capacity));
        }

        let stream = TcpStream::connect(address)
            .await
            .map_err(|err| ShimError::transport(format!("connect {address}: {err}")))?;
        stream
            .set_nodelay(true)
            .map_err(|err| ShimError::transport(format!("configure {address}: {err}")))?;
        Ok(Self::from_stream(stream, capacity))
    }
}
