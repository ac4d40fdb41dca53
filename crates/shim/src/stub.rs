//! The API business logic uses to reach the ledger during one transaction.

use std::collections::{HashMap, VecDeque};
use std::marker::PhantomData;
use std::sync::Arc;

use chaincode_protocol::{
    ChaincodeEvent, ChaincodeId, ChaincodeInput, ChaincodeMessage, ChaincodeSpec, DelState,
    GetHistoryForKey, GetQueryResult, GetState, GetStateByRange, GetStateMetadata,
    KeyModification, KeyValue, MessageType, PurgePrivateState, PutState, PutStateMetadata,
    QueryResponse, QueryResultBytes, QueryStateClose, QueryStateNext, Response, StateMetadata,
    StateMetadataResult,
};
use serde::de::DeserializeOwned;

use crate::context::TransactionContext;
use crate::error::{ShimError, ShimResult};

/// Sentinel the peer interprets as "from the first key" in range queries.
pub const UNSPECIFIED_START_KEY: &str = "\u{1}";
pub const VALIDATION_PARAMETER: &str = "VALIDATION_PARAMETER";

pub type StateQueryIterator = QueryIterator<KeyValue>;
pub type HistoryQueryIterator = QueryIterator<KeyModification>;

pub struct ChaincodeStub {
    ctx: Arc<TransactionContext>,
    input: ChaincodeInput,
    chaincode_id: String,
    event: Option<ChaincodeEvent>,
}

impl ChaincodeStub {
    pub(crate) fn new(
        ctx: Arc<TransactionContext>,
        input: ChaincodeInput,
        chaincode_id: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            input,
            chaincode_id: chaincode_id.into(),
            event: None,
        }
    }

    pub fn tx_id(&self) -> &str {
        self.ctx.txid()
    }

    pub fn channel_id(&self) -> &str {
        self.ctx.channel_id()
    }

    pub fn is_init(&self) -> bool {
        self.input.is_init
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.input.args
    }

    pub fn string_args(&self) -> Vec<String> {
        self.input
            .args
            .iter()
            .map(|arg| String::from_utf8_lossy(arg).into_owned())
            .collect()
    }

    /// First argument as the function name, the rest as its parameters.
    pub fn function_and_parameters(&self) -> (String, Vec<String>) {
        let mut args = self.string_args().into_iter();
        let function = args.next().unwrap_or_default();
        (function, args.collect())
    }

    pub fn transient(&self) -> &HashMap<String, Vec<u8>> {
        &self.input.transient
    }

    pub fn event(&self) -> Option<&ChaincodeEvent> {
        self.event.as_ref()
    }

    pub(crate) fn take_event(&mut self) -> Option<ChaincodeEvent> {
        self.event.take()
    }

    /// Attaches an event to the transaction's COMPLETED message. A later
    /// call replaces the earlier event.
    pub fn set_event(&mut self, name: &str, payload: impl Into<Vec<u8>>) -> ShimResult<()> {
        if name.is_empty() {
            return Err(ShimError::InvalidArgument(
                "event name must not be empty".into(),
            ));
        }
        self.event = Some(ChaincodeEvent {
            chaincode_id: self.chaincode_id.clone(),
            tx_id: self.tx_id().to_string(),
            event_name: name.to_string(),
            payload: payload.into(),
        });
        Ok(())
    }

    /// Value stored under `key`; empty when the key does not exist.
    pub async fn get_state(&self, key: &str) -> ShimResult<Vec<u8>> {
        self.get(key, "").await
    }

    pub async fn put_state(&self, key: &str, value: impl Into<Vec<u8>>) -> ShimResult<()> {
        validate_key(key)?;
        self.put(key, value.into(), "").await
    }

    pub async fn del_state(&self, key: &str) -> ShimResult<()> {
        validate_key(key)?;
        self.del(key, "").await
    }

    pub async fn get_state_by_range(
        &self,
        start_key: &str,
        end_key: &str,
    ) -> ShimResult<StateQueryIterator> {
        self.range(start_key, end_key, "").await
    }

    /// Rich query, interpreted by the peer's state database.
    pub async fn get_query_result(&self, query: &str) -> ShimResult<StateQueryIterator> {
        self.query(query, "").await
    }

    pub async fn get_history_for_key(&self, key: &str) -> ShimResult<HistoryQueryIterator> {
        validate_key(key)?;
        let payload = GetHistoryForKey {
            key: key.to_string(),
        };
        let bytes = self
            .ctx
            .request(MessageType::GetHistoryForKey, &payload)
            .await?;
        QueryIterator::from_bytes(self.ctx.clone(), &bytes)
    }

    pub async fn get_private_data(&self, collection: &str, key: &str) -> ShimResult<Vec<u8>> {
        validate_collection(collection)?;
        self.get(key, collection).await
    }

    pub async fn get_private_data_hash(&self, collection: &str, key: &str) -> ShimResult<Vec<u8>> {
        validate_collection(collection)?;
        let payload = GetState {
            key: key.to_string(),
            collection: collection.to_string(),
        };
        self.ctx
            .request(MessageType::GetPrivateDataHash, &payload)
            .await
    }

    pub async fn put_private_data(
        &self,
        collection: &str,
        key: &str,
        value: impl Into<Vec<u8>>,
    ) -> ShimResult<()> {
        validate_collection(collection)?;
        validate_key(key)?;
        self.put(key, value.into(), collection).await
    }

    pub async fn del_private_data(&self, collection: &str, key: &str) -> ShimResult<()> {
        validate_collection(collection)?;
        validate_key(key)?;
        self.del(key, collection).await
    }

    pub async fn purge_private_data(&self, collection: &str, key: &str) -> ShimResult<()> {
        validate_collection(collection)?;
        validate_key(key)?;
        let payload = PurgePrivateState {
            key: key.to_string(),
            collection: collection.to_string(),
        };
        self.ctx
            .request(MessageType::PurgePrivateData, &payload)
            .await
            .map(drop)
    }

    pub async fn get_private_data_by_range(
        &self,
        collection: &str,
        start_key: &str,
        end_key: &str,
    ) -> ShimResult<StateQueryIterator> {
        validate_collection(collection)?;
        self.range(start_key, end_key, collection).await
    }

    pub async fn get_private_data_query_result(
        &self,
        collection: &str,
        query: &str,
    ) -> ShimResult<StateQueryIterator> {
        validate_collection(collection)?;
        self.query(query, collection).await
    }

    /// Key-level endorsement policy; empty when none is set.
    pub async fn get_state_validation_parameter(&self, key: &str) -> ShimResult<Vec<u8>> {
        self.validation_parameter(key, "").await
    }

    pub async fn set_state_validation_parameter(
        &self,
        key: &str,
        policy: impl Into<Vec<u8>>,
    ) -> ShimResult<()> {
        self.set_validation_parameter(key, policy.into(), "").await
    }

    pub async fn get_private_data_validation_parameter(
        &self,
        collection: &str,
        key: &str,
    ) -> ShimResult<Vec<u8>> {
        validate_collection(collection)?;
        self.validation_parameter(key, collection).await
    }

    pub async fn set_private_data_validation_parameter(
        &self,
        collection: &str,
        key: &str,
        policy: impl Into<Vec<u8>>,
    ) -> ShimResult<()> {
        validate_collection(collection)?;
        self.set_validation_parameter(key, policy.into(), collection)
            .await
    }

    /// Calls another chaincode within this transaction. `channel` may be
    /// empty to stay on the current channel.
    pub async fn invoke_chaincode(
        &self,
        chaincode_name: &str,
        args: &[Vec<u8>],
        channel: &str,
    ) -> ShimResult<Response> {
        if chaincode_name.is_empty() {
            return Err(ShimError::InvalidArgument(
                "chaincode name must not be empty".into(),
            ));
        }
        let target = if channel.is_empty() {
            chaincode_name.to_string()
        } else {
            format!("{chaincode_name}/{channel}")
        };
        let call = ChaincodeSpec {
            chaincode_id: ChaincodeId::new(target),
            input: ChaincodeInput {
                args: args.to_vec(),
                ..ChaincodeInput::default()
            },
        };
        let bytes = self
            .ctx
            .request(MessageType::InvokeChaincode, &call)
            .await?;

        let inner: ChaincodeMessage = serde_json::from_slice(&bytes)?;
        match inner.msg_type {
            MessageType::Completed => Ok(inner.decode_payload::<Response>()?),
            _ => Err(ShimError::Application(inner.payload_text())),
        }
    }

    async fn get(&self, key: &str, collection: &str) -> ShimResult<Vec<u8>> {
        let payload = GetState {
            key: key.to_string(),
            collection: collection.to_string(),
        };
        self.ctx.request(MessageType::GetState, &payload).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, collection: &str) -> ShimResult<()> {
        let payload = PutState {
            key: key.to_string(),
            value,
            collection: collection.to_string(),
        };
        self.ctx
            .request(MessageType::PutState, &payload)
            .await
            .map(drop)
    }

    async fn del(&self, key: &str, collection: &str) -> ShimResult<()> {
        let payload = DelState {
            key: key.to_string(),
            collection: collection.to_string(),
        };
        self.ctx
            .request(MessageType::DelState, &payload)
            .await
            .map(drop)
    }

    async fn range(
        &self,
        start_key: &str,
        end_key: &str,
        collection: &str,
    ) -> ShimResult<StateQueryIterator> {
        let start_key = if start_key.is_empty() {
            UNSPECIFIED_START_KEY
        } else {
            start_key
        };
        let payload = GetStateByRange {
            start_key: start_key.to_string(),
            end_key: end_key.to_string(),
            collection: collection.to_string(),
        };
        let bytes = self
            .ctx
            .request(MessageType::GetStateByRange, &payload)
            .await?;
        QueryIterator::from_bytes(self.ctx.clone(), &bytes)
    }

    async fn query(&self, query: &str, collection: &str) -> ShimResult<StateQueryIterator> {
        let payload = GetQueryResult {
            query: query.to_string(),
            collection: collection.to_string(),
        };
        let bytes = self
            .ctx
            .request(MessageType::GetQueryResult, &payload)
            .await?;
        QueryIterator::from_bytes(self.ctx.clone(), &bytes)
    }

    async fn validation_parameter(&self, key: &str, collection: &str) -> ShimResult<Vec<u8>> {
        let payload = GetStateMetadata {
            key: key.to_string(),
            collection: collection.to_string(),
        };
        let bytes = self
            .ctx
            .request(MessageType::GetStateMetadata, &payload)
            .await?;
        let result: StateMetadataResult = serde_json::from_slice(&bytes)?;
        Ok(result
            .entries
            .into_iter()
            .find(|entry| entry.metakey == VALIDATION_PARAMETER)
            .map(|entry| entry.value)
            .unwrap_or_default())
    }

    async fn set_validation_parameter(
        &self,
        key: &str,
        policy: Vec<u8>,
        collection: &str,
    ) -> ShimResult<()> {
        validate_key(key)?;
        let payload = PutStateMetadata {
            key: key.to_string(),
            collection: collection.to_string(),
            metadata: StateMetadata {
                metakey: VALIDATION_PARAMETER.to_string(),
                value: policy,
            },
        };
        self.ctx
            .request(MessageType::PutStateMetadata, &payload)
            .await
            .map(drop)
    }
}

fn validate_key(key: &str) -> ShimResult<()> {
    if key.is_empty() {
        return Err(ShimError::InvalidArgument("key must not be empty".into()));
    }
    Ok(())
}

fn validate_collection(collection: &str) -> ShimResult<()> {
    if collection.is_empty() {
        return Err(ShimError::InvalidArgument(
            "collection must not be empty".into(),
        ));
    }
    Ok(())
}

/// Cursor over a peer-side query. Results arrive a page at a time; the next
/// page is requested only when the buffered one is exhausted.
///
/// A cursor dropped without [`close`](Self::close) is closed on the peer
/// when the transaction's business logic returns.
pub struct QueryIterator<T> {
    ctx: Arc<TransactionContext>,
    id: String,
    buffer: VecDeque<QueryResultBytes>,
    has_more: bool,
    closed: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> QueryIterator<T> {
    fn from_bytes(ctx: Arc<TransactionContext>, bytes: &[u8]) -> ShimResult<Self> {
        let page: QueryResponse = serde_json::from_slice(bytes)?;
        if !page.id.is_empty() {
            ctx.track_query(&page.id);
        }
        Ok(Self {
            ctx,
            id: page.id,
            buffer: page.results.into(),
            has_more: page.has_more,
            closed: false,
            _item: PhantomData,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn next(&mut self) -> ShimResult<Option<T>> {
        loop {
            if let Some(raw) = self.buffer.pop_front() {
                return Ok(Some(serde_json::from_slice(&raw.result_bytes)?));
            }
            if self.closed || !self.has_more {
                return Ok(None);
            }

            let payload = QueryStateNext {
                id: self.id.clone(),
            };
            let bytes = self
                .ctx
                .request(MessageType::QueryStateNext, &payload)
                .await?;
            let page: QueryResponse = serde_json::from_slice(&bytes)?;
            self.has_more = page.has_more && !page.results.is_empty();
            self.buffer.extend(page.results);
        }
    }

    /// Drains the cursor and closes it.
    pub async fn collect_all(mut self) -> ShimResult<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await? {
            items.push(item);
        }
        self.close().await?;
        Ok(items)
    }

    pub async fn close(&mut self) -> ShimResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.buffer.clear();
        if self.id.is_empty() {
            return Ok(());
        }
        self.ctx.forget_query(&self.id);
        let payload = QueryStateClose {
            id: self.id.clone(),
        };
        self.ctx
            .request(MessageType::QueryStateClose, &payload)
            .await
            .map(drop)
    }
}
