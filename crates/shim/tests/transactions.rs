mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chaincode_protocol::{ChaincodeMessage, MessageType, Response};
use chaincode_shim::{
    ShimConfig, ShimError, TransactionInfo, TransactionObserver, TransactionOutcome,
};
use common::{
    drive_to_terminal, error_to, eventually, handshake, recv, response_to, send, spawn_session,
    spawn_observed_session, terminal_response, test_config, transaction, Ledger, Session,
    TestChaincode, CHANNEL,
};

async fn ready_session(config: ShimConfig) -> Session {
    let mut session = spawn_session(config, Arc::new(TestChaincode));
    handshake(&mut session.peer).await;
    session
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn interleaved_transactions_each_finish_once_without_leaking() {
    let mut session = ready_session(test_config()).await;
    let mut ledger = Ledger::new();

    for i in 0..10 {
        let key = format!("k{i}");
        let value = format!("v{i}");
        send(
            &session.peer,
            transaction(&format!("tx{i}"), &["put", &key, &value]),
        )
        .await;
    }

    let mut terminals: HashMap<String, usize> = HashMap::new();
    while terminals.values().sum::<usize>() < 10 {
        let msg = recv(&mut session.peer).await;
        match msg.msg_type {
            MessageType::Completed => *terminals.entry(msg.txid).or_default() += 1,
            MessageType::PutState => {
                let reply = ledger.answer(&msg);
                send(&session.peer, reply).await;
            }
            other => panic!("unexpected {other}"),
        }
    }

    assert_eq!(terminals.len(), 10);
    assert!(terminals.values().all(|count| *count == 1));
    assert_eq!(ledger.state.len(), 10);
    let manager = session.manager.clone();
    assert!(eventually(|| manager.active_transactions() == 0).await);
    assert!(eventually(|| manager.metrics().transactions_completed == 10).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocked_transaction_does_not_hold_up_others() {
    let mut session = ready_session(test_config()).await;
    send(&session.peer, transaction("tx1", &["get", "a"])).await;
    send(&session.peer, transaction("tx2", &["get", "b"])).await;

    let mut requests: HashMap<String, ChaincodeMessage> = HashMap::new();
    for _ in 0..2 {
        let request = recv(&mut session.peer).await;
        assert_eq!(request.msg_type, MessageType::GetState);
        requests.insert(request.txid.clone(), request);
    }

    send(&session.peer, response_to(&requests["tx2"], b"B".to_vec())).await;
    let done = recv(&mut session.peer).await;
    assert_eq!(done.txid, "tx2");
    assert_eq!(done.msg_type, MessageType::Completed);
    assert!(session.manager.is_active(CHANNEL, "tx1"));

    send(&session.peer, response_to(&requests["tx1"], b"A".to_vec())).await;
    let done = recv(&mut session.peer).await;
    assert_eq!(done.txid, "tx1");
    assert_eq!(terminal_response(&done).payload, b"A".to_vec());
}

#[tokio::test]
async fn request_timeout_fails_only_its_own_transaction() {
    let config = ShimConfig {
        request_timeout_ms: 100,
        ..test_config()
    };
    let mut session = ready_session(config).await;
    send(&session.peer, transaction("slow", &["get", "a"])).await;
    send(&session.peer, transaction("fast", &["get", "b"])).await;

    let mut requests: HashMap<String, ChaincodeMessage> = HashMap::new();
    for _ in 0..2 {
        let request = recv(&mut session.peer).await;
        requests.insert(request.txid.clone(), request);
    }
    send(&session.peer, response_to(&requests["fast"], b"B".to_vec())).await;

    let fast = recv(&mut session.peer).await;
    assert_eq!((fast.txid.as_str(), fast.msg_type), ("fast", MessageType::Completed));

    let slow = recv(&mut session.peer).await;
    assert_eq!((slow.txid.as_str(), slow.msg_type), ("slow", MessageType::Error));
    let response = terminal_response(&slow);
    assert_eq!(response.status, Response::ERROR);
    assert!(response.message.contains("timed out"), "{}", response.message);

    // The reply finally shows up: it is dropped without counting as a violation.
    send(&session.peer, response_to(&requests["slow"], b"A".to_vec())).await;
    let manager = session.manager.clone();
    assert!(eventually(|| manager.metrics().dropped_messages >= 1).await);
    assert_eq!(manager.metrics().protocol_violations, 0);
    assert_eq!(manager.metrics().request_timeouts, 1);

    send(&session.peer, transaction("after", &["echo"])).await;
    let after = recv(&mut session.peer).await;
    assert_eq!((after.txid.as_str(), after.msg_type), ("after", MessageType::Completed));
}

#[tokio::test]
async fn swallowed_timeout_still_fails_the_transaction() {
    let config = ShimConfig {
        request_timeout_ms: 50,
        ..test_config()
    };
    let mut session = ready_session(config).await;
    send(&session.peer, transaction("tx1", &["swallow", "a"])).await;
    assert_eq!(recv(&mut session.peer).await.msg_type, MessageType::GetState);

    let done = recv(&mut session.peer).await;
    assert_eq!(done.msg_type, MessageType::Error);
    assert!(terminal_response(&done).message.contains("timed out"));
}

#[tokio::test]
async fn duplicate_reply_is_discarded_and_first_wins() {
    let mut session = ready_session(test_config()).await;
    let mut ledger = Ledger::with(&[("a1", "1"), ("a2", "2"), ("a3", "3")]);
    send(&session.peer, transaction("tx1", &["range", "a", "b"])).await;

    let request = recv(&mut session.peer).await;
    assert_eq!(request.msg_type, MessageType::GetStateByRange);
    let first = ledger.answer(&request);
    let second = response_to(&request, b"not a page".to_vec());
    send(&session.peer, first).await;
    send(&session.peer, second).await;

    let done = drive_to_terminal(&mut session.peer, &mut ledger, "tx1").await;
    assert_eq!(done.msg_type, MessageType::Completed);
    assert_eq!(terminal_response(&done).payload, b"a1,a2,a3".to_vec());

    let manager = session.manager.clone();
    assert!(eventually(|| manager.metrics().protocol_violations == 1).await);
}

#[tokio::test]
async fn range_iterator_pages_through_results_and_closes() {
    let mut session = ready_session(test_config()).await;
    let mut ledger = Ledger::with(&[
        ("b1", "1"),
        ("b2", "2"),
        ("b3", "3"),
        ("b4", "4"),
        ("b5", "5"),
        ("c1", "x"),
    ]);
    send(&session.peer, transaction("tx1", &["range", "b", "c"])).await;

    let done = drive_to_terminal(&mut session.peer, &mut ledger, "tx1").await;
    assert_eq!(terminal_response(&done).payload, b"b1,b2,b3,b4,b5".to_vec());
    assert_eq!(ledger.closed_cursors.len(), 1);
}

#[tokio::test]
async fn iterator_left_open_is_closed_before_the_result_is_sent() {
    let mut session = ready_session(test_config()).await;
    let mut ledger = Ledger::with(&[("k1", "1"), ("k2", "2"), ("k3", "3")]);
    send(&session.peer, transaction("tx1", &["peek", "k", "l"])).await;

    let done = drive_to_terminal(&mut session.peer, &mut ledger, "tx1").await;
    assert_eq!(done.msg_type, MessageType::Completed);
    assert_eq!(terminal_response(&done).payload, b"k1".to_vec());
    assert_eq!(ledger.closed_cursors, vec!["cursor-1".to_string()]);
}

#[tokio::test]
async fn open_ended_range_starts_from_first_key() {
    let mut session = ready_session(test_config()).await;
    let mut ledger = Ledger::with(&[("a", "1"), ("b", "2")]);
    send(&session.peer, transaction("tx1", &["range", "", ""])).await;

    let done = drive_to_terminal(&mut session.peer, &mut ledger, "tx1").await;
    assert_eq!(terminal_response(&done).payload, b"a,b".to_vec());
}

#[tokio::test]
async fn panicking_chaincode_fails_only_that_transaction() {
    let mut session = ready_session(test_config()).await;
    send(&session.peer, transaction("boom", &["panic"])).await;

    let done = recv(&mut session.peer).await;
    assert_eq!((done.txid.as_str(), done.msg_type), ("boom", MessageType::Error));
    assert!(terminal_response(&done).message.contains("business logic exploded"));

    send(&session.peer, transaction("next", &["still-alive"])).await;
    let next = recv(&mut session.peer).await;
    assert_eq!(next.msg_type, MessageType::Completed);
    assert_eq!(terminal_response(&next).payload, b"still-alive".to_vec());
}

#[tokio::test]
async fn business_failure_status_is_forwarded() {
    let mut session = ready_session(test_config()).await;
    send(&session.peer, transaction("tx1", &["fail"])).await;

    let done = recv(&mut session.peer).await;
    assert_eq!(done.msg_type, MessageType::Error);
    let response = terminal_response(&done);
    assert_eq!(response.status, 404);
    assert_eq!(response.message, "asset missing");
}

#[tokio::test]
async fn peer_error_reply_is_an_application_error() {
    let mut session = ready_session(test_config()).await;
    send(&session.peer, transaction("tx1", &["get", "secret"])).await;
    let request = recv(&mut session.peer).await;
    send(&session.peer, error_to(&request, "access denied")).await;

    let done = recv(&mut session.peer).await;
    assert_eq!(done.msg_type, MessageType::Error);
    let response = terminal_response(&done);
    assert_eq!(response.status, Response::ERROR);
    assert_eq!(response.message, "access denied");
}

#[tokio::test]
async fn event_is_attached_to_completed_message() {
    let mut session = ready_session(test_config()).await;
    send(&session.peer, transaction("tx1", &["event", "Minted", "42"])).await;

    let done = recv(&mut session.peer).await;
    assert_eq!(done.msg_type, MessageType::Completed);
    let event = done.chaincode_event.expect("event");
    assert_eq!(event.event_name, "Minted");
    assert_eq!(event.tx_id, "tx1");
    assert_eq!(event.chaincode_id, "testcc:1.0");
    assert_eq!(event.payload, b"42".to_vec());
}

#[tokio::test]
async fn duplicate_transaction_start_is_dropped() {
    let mut session = ready_session(test_config()).await;
    let mut ledger = Ledger::with(&[("a", "A")]);
    send(&session.peer, transaction("tx1", &["get", "a"])).await;
    let request = recv(&mut session.peer).await;
    send(&session.peer, transaction("tx1", &["get", "a"])).await;

    let manager = session.manager.clone();
    assert!(eventually(|| manager.metrics().protocol_violations == 1).await);
    send(&session.peer, ledger.answer(&request)).await;

    let done = recv(&mut session.peer).await;
    assert_eq!(done.msg_type, MessageType::Completed);
    assert_eq!(terminal_response(&done).payload, b"A".to_vec());
    assert_eq!(manager.metrics().transactions_started, 1);
}

#[tokio::test]
async fn reply_for_unknown_transaction_is_ignored() {
    let mut session = ready_session(test_config()).await;
    let stray = ChaincodeMessage::new(MessageType::Response, CHANNEL, "ghost", Vec::new())
        .with_correlation(7);
    send(&session.peer, stray).await;

    send(&session.peer, transaction("tx1", &["ok"])).await;
    let done = recv(&mut session.peer).await;
    assert_eq!(done.msg_type, MessageType::Completed);
    assert_eq!(session.manager.metrics().protocol_violations, 0);
    assert_eq!(session.manager.metrics().dropped_messages, 1);
}

#[tokio::test]
async fn same_txid_on_different_channels_is_independent() {
    let mut session = ready_session(test_config()).await;
    let mut other = transaction("tx1", &["one"]);
    other.channel_id = "otherchannel".into();
    send(&session.peer, transaction("tx1", &["two"])).await;
    send(&session.peer, other).await;

    let mut channels = vec![
        recv(&mut session.peer).await.channel_id,
        recv(&mut session.peer).await.channel_id,
    ];
    channels.sort();
    assert_eq!(channels, vec![CHANNEL.to_string(), "otherchannel".to_string()]);
    assert_eq!(session.manager.metrics().protocol_violations, 0);
}

#[tokio::test]
async fn repeated_violations_end_the_session() {
    let config = ShimConfig {
        protocol_violation_threshold: 2,
        ..test_config()
    };
    let session = ready_session(config).await;
    for _ in 0..3 {
        let bogus = ChaincodeMessage::new(MessageType::GetState, CHANNEL, "tx1", Vec::new());
        send(&session.peer, bogus).await;
    }

    let err = session.task.await.expect("join").unwrap_err();
    assert!(matches!(err, ShimError::Transport(_)));
    assert_eq!(session.manager.metrics().protocol_violations, 3);
}

#[tokio::test]
async fn undecodable_input_is_refused() {
    let mut session = ready_session(test_config()).await;
    let garbage =
        ChaincodeMessage::new(MessageType::Transaction, CHANNEL, "tx1", b"{not json".to_vec());
    send(&session.peer, garbage).await;

    let reply = recv(&mut session.peer).await;
    assert_eq!(reply.msg_type, MessageType::Error);
    assert_eq!(terminal_response(&reply).status, Response::ERROR_THRESHOLD);
    assert_eq!(session.manager.active_transactions(), 0);
}

#[derive(Default)]
struct Recorder {
    started: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
}

impl TransactionObserver for Recorder {
    fn on_transaction_start(&self, _info: &TransactionInfo) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn on_transaction_end(&self, _info: &TransactionInfo, outcome: &TransactionOutcome) {
        let counter = if outcome.is_success() {
            &self.succeeded
        } else {
            &self.failed
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn observer_sees_every_transaction_boundary() {
    let recorder = Arc::new(Recorder::default());
    let mut session =
        spawn_observed_session(test_config(), Arc::new(TestChaincode), recorder.clone());
    handshake(&mut session.peer).await;

    send(&session.peer, transaction("ok", &["echo"])).await;
    send(&session.peer, transaction("bad", &["fail"])).await;
    recv(&mut session.peer).await;
    recv(&mut session.peer).await;

    assert!(eventually(|| recorder.failed.load(Ordering::SeqCst) == 1).await);
    assert!(eventually(|| recorder.succeeded.load(Ordering::SeqCst) == 1).await);
    assert_eq!(recorder.started.load(Ordering::SeqCst), 2);
}
