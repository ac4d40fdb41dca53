//! A small asset registry used as the runner's bundled chaincode.
//!
//! Functions: `create <id> <owner> <value>`, `read <id>`,
//! `transfer <id> <owner>`, `delete <id>`, `list [start] [end]`,
//! `history <id>`.

use async_trait::async_trait;
use chaincode_shim::{Chaincode, ChaincodeStub, Response, ShimError, ShimResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const ASSET_CREATED_EVENT: &str = "AssetCreated";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub owner: String,
    pub value: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AssetChaincode;

#[async_trait]
impl Chaincode for AssetChaincode {
    /// `init` optionally seeds one asset from `<id> <owner> <value>`.
    async fn init(&self, stub: &mut ChaincodeStub) -> Response {
        let (_, params) = stub.function_and_parameters();
        if params.is_empty() {
            return Response::success(Vec::new());
        }
        respond(create(stub, &params).await)
    }

    async fn invoke(&self, stub: &mut ChaincodeStub) -> Response {
        let (function, params) = stub.function_and_parameters();
        debug!(tx_id = stub.tx_id(), %function, "Asset invoke");
        let result = match function.as_str() {
            "create" => create(stub, &params).await,
            "read" => read(stub, &params).await,
            "transfer" => transfer(stub, &params).await,
            "delete" => delete(stub, &params).await,
            "list" => list(stub, &params).await,
            "history" => history(stub, &params).await,
            other => Err(ShimError::InvalidArgument(format!("unknown function '{other}'"))),
        };
        respond(result)
    }
}

fn respond(result: ShimResult<Vec<u8>>) -> Response {
    match result {
        Ok(payload) => Response::success(payload),
        Err(err) => err.to_response(),
    }
}

fn expect_params<'a>(params: &'a [String], count: usize, usage: &str) -> ShimResult<&'a [String]> {
    if params.len() != count {
        return Err(ShimError::InvalidArgument(format!("usage: {usage}")));
    }
    Ok(params)
}

async fn load(stub: &ChaincodeStub, id: &str) -> ShimResult<Asset> {
    let raw = stub.get_state(id).await?;
    if raw.is_empty() {
        return Err(ShimError::Application(format!("asset {id} does not exist")));
    }
    Ok(serde_json::from_slice(&raw)?)
}

async fn store(stub: &ChaincodeStub, asset: &Asset) -> ShimResult<Vec<u8>> {
    let bytes = serde_json::to_vec(asset)?;
    stub.put_state(&asset.id, bytes.clone()).await?;
    Ok(bytes)
}

async fn create(stub: &mut ChaincodeStub, params: &[String]) -> ShimResult<Vec<u8>> {
    let params = expect_params(params, 3, "create <id> <owner> <value>")?;
    let value = params[2]
        .parse::<u64>()
        .map_err(|err| ShimError::InvalidArgument(format!("value: {err}")))?;
    if !stub.get_state(&params[0]).await?.is_empty() {
        return Err(ShimError::Application(format!("asset {} already exists", params[0])));
    }

    let asset = Asset {
        id: params[0].clone(),
        owner: params[1].clone(),
        value,
    };
    let bytes = store(stub, &asset).await?;
    stub.set_event(ASSET_CREATED_EVENT, bytes.clone())?;
    Ok(bytes)
}

async fn read(stub: &mut ChaincodeStub, params: &[String]) -> ShimResult<Vec<u8>> {
    let params = expect_params(params, 1, "read <id>")?;
    let asset = load(stub, &params[0]).await?;
    Ok(serde_json::to_vec(&asset)?)
}

async fn transfer(stub: &mut ChaincodeStub, params: &[String]) -> ShimResult<Vec<u8>> {
    let params = expect_params(params, 2, "transfer <id> <owner>")?;
    let mut asset = load(stub, &params[0]).await?;
    asset.owner = params[1].clone();
    store(stub, &asset).await
}

async fn delete(stub: &mut ChaincodeStub, params: &[String]) -> ShimResult<Vec<u8>> {
    let params = expect_params(params, 1, "delete <id>")?;
    load(stub, &params[0]).await?;
    stub.del_state(&params[0]).await?;
    Ok(Vec::new())
}

async fn list(stub: &mut ChaincodeStub, params: &[String]) -> ShimResult<Vec<u8>> {
    let start = params.first().map(String::as_str).unwrap_or("");
    let end = params.get(1).map(String::as_str).unwrap_or("");
    let entries = stub.get_state_by_range(start, end).await?.collect_all().await?;

    let assets = entries
        .into_iter()
        .map(|kv| serde_json::from_slice::<Asset>(&kv.value))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(serde_json::to_vec(&assets)?)
}

async fn history(stub: &mut ChaincodeStub, params: &[String]) -> ShimResult<Vec<u8>> {
    let params = expect_params(params, 1, "history <id>")?;
    let entries = stub.get_history_for_key(&params[0]).await?.collect_all().await?;
    Ok(serde_json::to_vec(&entries)?)
}
