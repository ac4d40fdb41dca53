#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chaincode_protocol::{
    ChaincodeInput, ChaincodeMessage, DelState, GetHistoryForKey, GetState, GetStateByRange,
    KeyModification, KeyValue, MessageType, PutState, QueryResponse, QueryResultBytes,
    QueryStateClose, QueryStateNext, Response,
};
use async_trait::async_trait;
use chaincode_shim::{
    Chaincode, ChaincodeStub, InvocationTaskManager, PeerEnd, ShimConfig, ShimResult,
    TransactionObserver, Transport,
};
use chrono::Utc;
use tokio::task::JoinHandle;

pub const CHANNEL: &str = "mychannel";
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config() -> ShimConfig {
    ShimConfig {
        registration_timeout_ms: 500,
        request_timeout_ms: 2_000,
        shutdown_grace_ms: 200,
        max_concurrent_transactions: 8,
        ..ShimConfig::new("testcc:1.0")
    }
}

pub struct Session {
    pub manager: InvocationTaskManager,
    pub peer: PeerEnd,
    pub task: JoinHandle<ShimResult<()>>,
}

/// Spawns `run` for a fresh session over an in-memory transport.
pub fn spawn_session(config: ShimConfig, chaincode: Arc<dyn Chaincode>) -> Session {
    let (transport, peer) = Transport::in_memory(64);
    let (sender, inbound) = transport.split();
    let manager = InvocationTaskManager::new(config, chaincode, sender);
    let runner = manager.clone();
    let task = tokio::spawn(async move { runner.run(inbound).await });
    Session {
        manager,
        peer,
        task,
    }
}

pub fn spawn_observed_session(
    config: ShimConfig,
    chaincode: Arc<dyn Chaincode>,
    observer: Arc<dyn TransactionObserver>,
) -> Session {
    let (transport, peer) = Transport::in_memory(64);
    let (sender, inbound) = transport.split();
    let manager = InvocationTaskManager::with_observer(config, chaincode, observer, sender);
    let runner = manager.clone();
    let task = tokio::spawn(async move { runner.run(inbound).await });
    Session {
        manager,
        peer,
        task,
    }
}

pub async fn recv(peer: &mut PeerEnd) -> ChaincodeMessage {
    tokio::time::timeout(RECV_TIMEOUT, peer.recv())
        .await
        .expect("timed out waiting for shim")
        .expect("shim hung up")
}

pub async fn send(peer: &PeerEnd, msg: ChaincodeMessage) {
    peer.send(msg).await.expect("shim inbound closed");
}

/// Plays the peer side of REGISTER / REGISTERED / READY.
pub async fn handshake(peer: &mut PeerEnd) {
    let register = recv(peer).await;
    assert_eq!(register.msg_type, MessageType::Register);
    send(peer, ChaincodeMessage::session(MessageType::Registered, Vec::new())).await;
    send(peer, ChaincodeMessage::session(MessageType::Ready, Vec::new())).await;
}

pub fn transaction(txid: &str, args: &[&str]) -> ChaincodeMessage {
    ChaincodeMessage::with_payload(
        MessageType::Transaction,
        CHANNEL,
        txid,
        &ChaincodeInput::from_strings(args),
    )
    .expect("encode input")
}

pub fn init(txid: &str, args: &[&str]) -> ChaincodeMessage {
    ChaincodeMessage::with_payload(
        MessageType::Init,
        CHANNEL,
        txid,
        &ChaincodeInput::from_strings(args),
    )
    .expect("encode input")
}

pub fn response_to(request: &ChaincodeMessage, payload: Vec<u8>) -> ChaincodeMessage {
    let mut reply = ChaincodeMessage::new(
        MessageType::Response,
        request.channel_id.clone(),
        request.txid.clone(),
        payload,
    );
    reply.correlation_id = request.correlation_id;
    reply
}

pub fn error_to(request: &ChaincodeMessage, message: &str) -> ChaincodeMessage {
    let mut reply = ChaincodeMessage::new(
        MessageType::Error,
        request.channel_id.clone(),
        request.txid.clone(),
        message.as_bytes().to_vec(),
    );
    reply.correlation_id = request.correlation_id;
    reply
}

/// Polls `condition` until it holds or a few seconds pass.
pub async fn eventually<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn terminal_response(msg: &ChaincodeMessage) -> Response {
    msg.decode_payload().expect("terminal payload is a Response")
}

/// Peer-side state the shim reads and writes through its requests.
#[derive(Default)]
pub struct Ledger {
    pub state: BTreeMap<String, Vec<u8>>,
    pub history: HashMap<String, Vec<KeyModification>>,
    cursors: HashMap<String, VecDeque<QueryResultBytes>>,
    next_cursor: u64,
    pub page_size: usize,
    pub closed_cursors: Vec<String>,
}

impl Ledger {
    pub fn new() -> Self {
        Self {
            page_size: 2,
            ..Self::default()
        }
    }

    pub fn with(entries: &[(&str, &str)]) -> Self {
        let mut ledger = Self::new();
        for (key, value) in entries {
            ledger
                .state
                .insert(key.to_string(), value.as_bytes().to_vec());
        }
        ledger
    }

    /// Builds the peer's reply to a state request from the shim.
    pub fn answer(&mut self, request: &ChaincodeMessage) -> ChaincodeMessage {
        match request.msg_type {
            MessageType::GetState => {
                let body: GetState = request.decode_payload().expect("GetState");
                let value = self.state.get(&body.key).cloned().unwrap_or_default();
                response_to(request, value)
            }
            MessageType::PutState => {
                let body: PutState = request.decode_payload().expect("PutState");
                self.record(&request.txid, &body.key, body.value.clone(), false);
                self.state.insert(body.key, body.value);
                response_to(request, Vec::new())
            }
            MessageType::DelState => {
                let body: DelState = request.decode_payload().expect("DelState");
                self.record(&request.txid, &body.key, Vec::new(), true);
                self.state.remove(&body.key);
                response_to(request, Vec::new())
            }
            MessageType::GetStateByRange => {
                let body: GetStateByRange = request.decode_payload().expect("GetStateByRange");
                let rows: VecDeque<QueryResultBytes> = self
                    .state
                    .iter()
                    .filter(|(key, _)| {
                        key.as_str() >= body.start_key.as_str()
                            && (body.end_key.is_empty() || key.as_str() < body.end_key.as_str())
                    })
                    .map(|(key, value)| KeyValue {
                        namespace: "testcc".into(),
                        key: key.clone(),
                        value: value.clone(),
                    })
                    .map(|kv| QueryResultBytes {
                        result_bytes: serde_json::to_vec(&kv).expect("encode kv"),
                    })
                    .collect();
                self.open_cursor(request, rows)
            }
            MessageType::GetHistoryForKey => {
                let body: GetHistoryForKey = request.decode_payload().expect("GetHistoryForKey");
                let rows = self
                    .history
                    .get(&body.key)
                    .cloned()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|entry| QueryResultBytes {
                        result_bytes: serde_json::to_vec(&entry).expect("encode history"),
                    })
                    .collect();
                self.open_cursor(request, rows)
            }
            MessageType::QueryStateNext => {
                let body: QueryStateNext = request.decode_payload().expect("QueryStateNext");
                match self.cursors.remove(&body.id) {
                    Some(rows) => self.page(request, body.id, rows),
                    None => error_to(request, "unknown cursor"),
                }
            }
            MessageType::QueryStateClose => {
                let body: QueryStateClose = request.decode_payload().expect("QueryStateClose");
                self.cursors.remove(&body.id);
                self.closed_cursors.push(body.id.clone());
                let page = QueryResponse {
                    id: body.id,
                    ..QueryResponse::default()
                };
                response_to(request, serde_json::to_vec(&page).expect("encode page"))
            }
            other => error_to(request, &format!("ledger does not serve {other}")),
        }
    }

    fn record(&mut self, txid: &str, key: &str, value: Vec<u8>, is_delete: bool) {
        self.history
            .entry(key.to_string())
            .or_default()
            .push(KeyModification {
                tx_id: txid.to_string(),
                value,
                timestamp: Utc::now(),
                is_delete,
            });
    }

    fn open_cursor(
        &mut self,
        request: &ChaincodeMessage,
        rows: VecDeque<QueryResultBytes>,
    ) -> ChaincodeMessage {
        self.next_cursor += 1;
        let id = format!("cursor-{}", self.next_cursor);
        self.page(request, id, rows)
    }

    fn page(
        &mut self,
        request: &ChaincodeMessage,
        id: String,
        mut rows: VecDeque<QueryResultBytes>,
    ) -> ChaincodeMessage {
        let take = self.page_size.max(1).min(rows.len());
        let results: Vec<QueryResultBytes> = rows.drain(..take).collect();
        let has_more = !rows.is_empty();
        if has_more {
            self.cursors.insert(id.clone(), rows);
        }
        let page = QueryResponse {
            results,
            has_more,
            id,
        };
        response_to(request, serde_json::to_vec(&page).expect("encode page"))
    }
}

/// Answers state requests until the shim reports a terminal result for
/// `txid`, which is returned.
pub async fn drive_to_terminal(
    peer: &mut PeerEnd,
    ledger: &mut Ledger,
    txid: &str,
) -> ChaincodeMessage {
    loop {
        let msg = recv(peer).await;
        match msg.msg_type {
            MessageType::Completed | MessageType::Error if msg.txid == txid => return msg,
            kind if kind.is_state_request() => {
                let reply = ledger.answer(&msg);
                send(peer, reply).await;
            }
            other => panic!("unexpected {other} from shim while driving {txid}"),
        }
    }
}

/// Chaincode whose behaviour is chosen by the first argument.
pub struct TestChaincode;

#[async_trait]
impl Chaincode for TestChaincode {
    async fn init(&self, stub: &mut ChaincodeStub) -> Response {
        assert!(stub.is_init());
        Response::success(b"initialised".to_vec())
    }

    async fn invoke(&self, stub: &mut ChaincodeStub) -> Response {
        let (function, params) = stub.function_and_parameters();
        let arg = |index: usize| params.get(index).cloned().unwrap_or_default();
        match function.as_str() {
            "get" => match stub.get_state(&arg(0)).await {
                Ok(value) => Response::success(value),
                Err(err) => err.to_response(),
            },
            "put" => match stub.put_state(&arg(0), arg(1).into_bytes()).await {
                Ok(()) => Response::success(Vec::new()),
                Err(err) => err.to_response(),
            },
            "range" => {
                let iter = match stub.get_state_by_range(&arg(0), &arg(1)).await {
                    Ok(iter) => iter,
                    Err(err) => return err.to_response(),
                };
                match iter.collect_all().await {
                    Ok(rows) => {
                        let keys: Vec<String> = rows.into_iter().map(|kv| kv.key).collect();
                        Response::success(keys.join(",").into_bytes())
                    }
                    Err(err) => err.to_response(),
                }
            }
            "peek" => {
                let mut iter = match stub.get_state_by_range(&arg(0), &arg(1)).await {
                    Ok(iter) => iter,
                    Err(err) => return err.to_response(),
                };
                match iter.next().await {
                    Ok(first) => {
                        let key = first.map(|kv| kv.key).unwrap_or_default();
                        Response::success(key.into_bytes())
                    }
                    Err(err) => err.to_response(),
                }
            }
            "swallow" => {
                let _ = stub.get_state(&arg(0)).await;
                Response::success(b"swallowed".to_vec())
            }
            "sleep" => {
                let millis = arg(0).parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Response::success(b"slept".to_vec())
            }
            "event" => match stub.set_event(&arg(0), arg(1).into_bytes()) {
                Ok(()) => Response::success(Vec::new()),
                Err(err) => err.to_response(),
            },
            "panic" => panic!("business logic exploded"),
            "fail" => Response::error_with_status(404, "asset missing"),
            _ => Response::success(function.into_bytes()),
        }
    }
}
