//! Classification of inbound messages. Pure: no state, no side effects.

use chaincode_protocol::{ChaincodeMessage, MessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Session control: REGISTERED, READY, KEEPALIVE.
    Lifecycle,
    /// INIT or TRANSACTION opening a new transaction.
    TransactionStart,
    /// RESPONSE or ERROR answering a pending state operation.
    CorrelatedReply,
    /// Session-scoped ERROR raised by the peer.
    Event,
    Unroutable(Unroutable),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unroutable {
    /// A lifecycle type carrying a transaction id; never produced by a
    /// well-formed peer, so neither interpretation is trusted.
    LifecycleWithTxid,
    MissingTxid,
    /// A kind the peer never sends to a chaincode.
    UnexpectedType,
}

impl Unroutable {
    pub fn describe(&self) -> &'static str {
        match self {
            Unroutable::LifecycleWithTxid => "lifecycle message carries a transaction id",
            Unroutable::MissingTxid => "transaction-scoped message without transaction id",
            Unroutable::UnexpectedType => "message type is never sent to a chaincode",
        }
    }
}

pub fn classify(msg: &ChaincodeMessage) -> Route {
    let kind = msg.msg_type;
    let scoped = msg.has_txid();

    if kind.is_lifecycle() {
        return if scoped {
            Route::Unroutable(Unroutable::LifecycleWithTxid)
        } else {
            Route::Lifecycle
        };
    }

    if kind.starts_transaction() {
        return if scoped {
            Route::TransactionStart
        } else {
            Route::Unroutable(Unroutable::MissingTxid)
        };
    }

    match (kind, scoped) {
        (MessageType::Response | MessageType::Error, true) => Route::CorrelatedReply,
        (MessageType::Error, false) => Route::Event,
        (MessageType::Response, false) => Route::Unroutable(Unroutable::MissingTxid),
        _ => Route::Unroutable(Unroutable::UnexpectedType),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(kind: MessageType, txid: &str) -> ChaincodeMessage {
        ChaincodeMessage::new(kind, "ch", txid, Vec::new())
    }

    #[test]
    fn classification_table() {
        let cases = [
            (MessageType::Registered, "", Route::Lifecycle),
            (MessageType::Ready, "", Route::Lifecycle),
            (MessageType::Keepalive, "", Route::Lifecycle),
            (MessageType::Init, "tx1", Route::TransactionStart),
            (MessageType::Transaction, "tx1", Route::TransactionStart),
            (MessageType::Response, "tx1", Route::CorrelatedReply),
            (MessageType::Error, "tx1", Route::CorrelatedReply),
            (MessageType::Error, "", Route::Event),
            (
                MessageType::Ready,
                "tx1",
                Route::Unroutable(Unroutable::LifecycleWithTxid),
            ),
            (
                MessageType::Transaction,
                "",
                Route::Unroutable(Unroutable::MissingTxid),
            ),
            (
                MessageType::Response,
                "",
                Route::Unroutable(Unroutable::MissingTxid),
            ),
            (
                MessageType::GetState,
                "tx1",
                Route::Unroutable(Unroutable::UnexpectedType),
            ),
            (
                MessageType::Completed,
                "tx1",
                Route::Unroutable(Unroutable::UnexpectedType),
            ),
            (
                MessageType::Register,
                "",
                Route::Unroutable(Unroutable::UnexpectedType),
            ),
            (
                MessageType::Undefined,
                "",
                Route::Unroutable(Unroutable::UnexpectedType),
            ),
        ];

        for (kind, txid, expected) in cases {
            assert_eq!(classify(&msg(kind, txid)), expected, "{kind} txid={txid:?}");
        }
    }
}
