use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity the shim announces in its REGISTER message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeId {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl ChaincodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: String::new(),
        }
    }
}

/// Arguments delivered with INIT and TRANSACTION messages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeInput {
    #[serde(default, with = "crate::bytes_serde::list")]
    pub args: Vec<Vec<u8>>,
    #[serde(default, with = "crate::bytes_serde::map")]
    pub transient: HashMap<String, Vec<u8>>,
    #[serde(default)]
    pub is_init: bool,
}

impl ChaincodeInput {
    pub fn from_strings<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            args: args
                .into_iter()
                .map(|arg| arg.as_ref().as_bytes().to_vec())
                .collect(),
            ..Self::default()
        }
    }
}

/// Target and input of a cross-contract INVOKE_CHAINCODE request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeSpec {
    pub chaincode_id: ChaincodeId,
    pub input: ChaincodeInput,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetState {
    pub key: String,
    #[serde(default)]
    pub collection: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutState {
    pub key: String,
    #[serde(default, with = "crate::bytes_serde")]
    pub value: Vec<u8>,
    #[serde(default)]
    pub collection: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelState {
    pub key: String,
    #[serde(default)]
    pub collection: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgePrivateState {
    pub key: String,
    pub collection: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStateMetadata {
    pub key: String,
    #[serde(default)]
    pub collection: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMetadata {
    pub metakey: String,
    #[serde(default, with = "crate::bytes_serde")]
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutStateMetadata {
    pub key: String,
    #[serde(default)]
    pub collection: String,
    pub metadata: StateMetadata,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateMetadataResult {
    #[serde(default)]
    pub entries: Vec<StateMetadata>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetStateByRange {
    pub start_key: String,
    pub end_key: String,
    #[serde(default)]
    pub collection: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetQueryResult {
    pub query: String,
    #[serde(default)]
    pub collection: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetHistoryForKey {
    pub key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStateNext {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryStateClose {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResultBytes {
    #[serde(default, with = "crate::bytes_serde")]
    pub result_bytes: Vec<u8>,
}

/// One page of a peer-side query; `id` names the cursor for NEXT/CLOSE.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub results: Vec<QueryResultBytes>,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub id: String,
}

/// A ledger record returned by range and rich queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    #[serde(default)]
    pub namespace: String,
    pub key: String,
    #[serde(default, with = "crate::bytes_serde")]
    pub value: Vec<u8>,
}

/// A historic write to a key returned by history queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyModification {
    pub tx_id: String,
    #[serde(default, with = "crate::bytes_serde")]
    pub value: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_delete: bool,
}

/// Outcome of a chaincode call, as reported to the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub status: i32,
    #[serde(default)]
    pub message: String,
    #[serde(default, with = "crate::bytes_serde")]
    pub payload: Vec<u8>,
}

impl Response {
    pub const OK: i32 = 200;
    pub const ERROR_THRESHOLD: i32 = 400;
    pub const ERROR: i32 = 500;

    pub fn success(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            status: Self::OK,
            message: String::new(),
            payload: payload.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::error_with_status(Self::ERROR, message)
    }

    pub fn error_with_status(status: i32, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            payload: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status < Self::ERROR_THRESHOLD
    }
}

/// Event emitted by a transaction; delivered with its COMPLETED message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeEvent {
    pub chaincode_id: String,
    pub tx_id: String,
    pub event_name: String,
    #[serde(default, with = "crate::bytes_serde")]
    pub payload: Vec<u8>,
}
