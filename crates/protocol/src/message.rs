use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;
use crate::payload::ChaincodeEvent;

/// Every kind of message that may travel on the peer stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Undefined,
    Register,
    Registered,
    Init,
    Ready,
    Transaction,
    Completed,
    Error,
    GetState,
    PutState,
    DelState,
    InvokeChaincode,
    Response,
    GetStateByRange,
    GetQueryResult,
    QueryStateNext,
    QueryStateClose,
    Keepalive,
    GetHistoryForKey,
    GetStateMetadata,
    PutStateMetadata,
    GetPrivateDataHash,
    PurgePrivateData,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Undefined => "UNDEFINED",
            MessageType::Register => "REGISTER",
            MessageType::Registered => "REGISTERED",
            MessageType::Init => "INIT",
            MessageType::Ready => "READY",
            MessageType::Transaction => "TRANSACTION",
            MessageType::Completed => "COMPLETED",
            MessageType::Error => "ERROR",
            MessageType::GetState => "GET_STATE",
            MessageType::PutState => "PUT_STATE",
            MessageType::DelState => "DEL_STATE",
            MessageType::InvokeChaincode => "INVOKE_CHAINCODE",
            MessageType::Response => "RESPONSE",
            MessageType::GetStateByRange => "GET_STATE_BY_RANGE",
            MessageType::GetQueryResult => "GET_QUERY_RESULT",
            MessageType::QueryStateNext => "QUERY_STATE_NEXT",
            MessageType::QueryStateClose => "QUERY_STATE_CLOSE",
            MessageType::Keepalive => "KEEPALIVE",
            MessageType::GetHistoryForKey => "GET_HISTORY_FOR_KEY",
            MessageType::GetStateMetadata => "GET_STATE_METADATA",
            MessageType::PutStateMetadata => "PUT_STATE_METADATA",
            MessageType::GetPrivateDataHash => "GET_PRIVATE_DATA_HASH",
            MessageType::PurgePrivateData => "PURGE_PRIVATE_DATA",
        }
    }

    /// Session-level control messages. These never carry a transaction id.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            MessageType::Registered | MessageType::Ready | MessageType::Keepalive
        )
    }

    /// Messages that open a new transaction on the shim.
    pub fn starts_transaction(&self) -> bool {
        matches!(self, MessageType::Init | MessageType::Transaction)
    }

    /// Messages the peer sends in answer to a shim request.
    pub fn is_reply(&self) -> bool {
        matches!(self, MessageType::Response | MessageType::Error)
    }

    /// Requests the shim issues on behalf of business logic.
    pub fn is_state_request(&self) -> bool {
        matches!(
            self,
            MessageType::GetState
                | MessageType::PutState
                | MessageType::DelState
                | MessageType::InvokeChaincode
                | MessageType::GetStateByRange
                | MessageType::GetQueryResult
                | MessageType::QueryStateNext
                | MessageType::QueryStateClose
                | MessageType::GetHistoryForKey
                | MessageType::GetStateMetadata
                | MessageType::PutStateMetadata
                | MessageType::GetPrivateDataHash
                | MessageType::PurgePrivateData
        )
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The envelope carried on the stream in both directions.
///
/// `payload` holds the JSON encoding of the typed payload matching
/// `msg_type`; the envelope itself does not interpret it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChaincodeMessage {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    pub timestamp: DateTime<Utc>,
    #[serde(default, with = "crate::bytes_serde", skip_serializing_if = "Vec::is_empty")]
    pub payload: Vec<u8>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub txid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chaincode_event: Option<ChaincodeEvent>,
}

impl ChaincodeMessage {
    pub fn new(
        msg_type: MessageType,
        channel_id: impl Into<String>,
        txid: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            msg_type,
            timestamp: Utc::now(),
            payload,
            txid: txid.into(),
            channel_id: channel_id.into(),
            correlation_id: None,
            chaincode_event: None,
        }
    }

    /// A session-level message with no transaction scope.
    pub fn session(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self::new(msg_type, String::new(), String::new(), payload)
    }

    pub fn with_payload<T: Serialize>(
        msg_type: MessageType,
        channel_id: impl Into<String>,
        txid: impl Into<String>,
        payload: &T,
    ) -> Result<Self, CodecError> {
        Ok(Self::new(
            msg_type,
            channel_id,
            txid,
            serde_json::to_vec(payload)?,
        ))
    }

    pub fn with_correlation(mut self, correlation_id: u64) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_event(mut self, event: Option<ChaincodeEvent>) -> Self {
        self.chaincode_event = event;
        self
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn has_txid(&self) -> bool {
        !self.txid.is_empty()
    }

    /// Payload rendered as text, for error messages carried as raw bytes.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
