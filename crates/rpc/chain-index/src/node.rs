//! Node client for the chain's Ethereum-style JSON-RPC interface.
//!
//! [`NodeClient`] is the capability the repository reads live and not yet
//! stored data through. [`JsonRpcNodeClient`] implements it over HTTP with
//! `jsonrpsee`; request timeouts surface as [`RepositoryError::Upstream`].

use std::time::Duration;

use alloy_primitives::{Address, Bytes, FixedBytes, B256, U256, U64};
use alloy_sol_types::{sol, SolCall};
use async_trait::async_trait;
use jsonrpsee::core::RpcResult;
use jsonrpsee::http_client::{HttpClient, HttpClientBuilder};
use jsonrpsee::proc_macros::rpc;
use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, RepositoryResult};
use crate::types::{BlockLink, GasEstimateRequest, RawLog, StoredBlock, StoredTransaction};

/// Block tag used for state reads.
const LATEST: &str = "latest";

sol! {
    interface IErc20 {
        function name() external view returns (string);
        function symbol() external view returns (string);
        function decimals() external view returns (uint8);
        function totalSupply() external view returns (uint256);
        function balanceOf(address owner) external view returns (uint256);
        function allowance(address owner, address spender) external view returns (uint256);
    }

    interface IErc721 {
        function name() external view returns (string);
        function symbol() external view returns (string);
        function totalSupply() external view returns (uint256);
        function balanceOf(address owner) external view returns (uint256);
        function ownerOf(uint256 tokenId) external view returns (address);
        function tokenURI(uint256 tokenId) external view returns (string);
        function getApproved(uint256 tokenId) external view returns (address);
        function isApprovedForAll(address owner, address operator) external view returns (bool);
    }

    interface IErc1155 {
        function uri(uint256 id) external view returns (string);
        function balanceOf(address account, uint256 id) external view returns (uint256);
        function balanceOfBatch(address[] accounts, uint256[] ids) external view returns (uint256[]);
        function isApprovedForAll(address account, address operator) external view returns (bool);
    }

    interface IErc165 {
        function supportsInterface(bytes4 interfaceId) external view returns (bool);
    }
}

/// Read and submit capability of the chain node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Current head block number.
    async fn block_height(&self) -> RepositoryResult<u64>;

    /// Native balance at the head block.
    async fn balance(&self, address: Address) -> RepositoryResult<U256>;

    /// Transaction count at the head block.
    async fn nonce(&self, address: Address) -> RepositoryResult<u64>;

    async fn block_by_number(&self, number: u64) -> RepositoryResult<Option<StoredBlock>>;

    async fn block_by_hash(&self, hash: B256) -> RepositoryResult<Option<StoredBlock>>;

    /// Transaction merged with its receipt when mined.
    async fn transaction(&self, hash: B256) -> RepositoryResult<Option<StoredTransaction>>;

    /// All log records emitted in a block, in log index order.
    async fn block_logs(&self, block_hash: B256) -> RepositoryResult<Vec<RawLog>>;

    /// Submit a signed transaction, returning its hash.
    async fn send_raw_transaction(&self, raw: Bytes) -> RepositoryResult<B256>;

    async fn gas_price(&self) -> RepositoryResult<U256>;

    async fn estimate_gas(&self, request: &GasEstimateRequest) -> RepositoryResult<u64>;

    /// Read-only contract call at the head block.
    async fn call(&self, to: Address, data: Bytes) -> RepositoryResult<Bytes>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireBlock {
    pub number: U64,
    pub hash: B256,
    pub parent_hash: B256,
    pub timestamp: U64,
    pub gas_limit: U64,
    pub gas_used: U64,
    #[serde(default)]
    pub transactions: Vec<B256>,
}

/// Narrow a node quantity to the field's type.
fn quantity<T: TryFrom<U64>>(field: &'static str, value: U64) -> RepositoryResult<T> {
    T::try_from(value).map_err(|_| RepositoryError::Decode(format!("{field} {value} out of range")))
}

impl TryFrom<WireBlock> for StoredBlock {
    type Error = RepositoryError;

    fn try_from(block: WireBlock) -> RepositoryResult<Self> {
        Ok(StoredBlock {
            number: quantity("block number", block.number)?,
            hash: block.hash,
            parent_hash: block.parent_hash,
            timestamp: quantity("block timestamp", block.timestamp)?,
            gas_limit: quantity("gas limit", block.gas_limit)?,
            gas_used: quantity("gas used", block.gas_used)?,
            transactions: block.transactions,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireTransaction {
    pub hash: B256,
    pub from: Address,
    pub to: Option<Address>,
    pub nonce: U64,
    pub value: U256,
    pub gas: U64,
    #[serde(default)]
    pub gas_price: Option<U256>,
    pub input: Bytes,
    pub block_hash: Option<B256>,
    pub block_number: Option<U64>,
    pub transaction_index: Option<U64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireReceipt {
    pub block_hash: B256,
    pub block_number: U64,
    pub transaction_index: U64,
    pub gas_used: U64,
    #[serde(default)]
    pub status: Option<U64>,
    #[serde(default)]
    pub contract_address: Option<Address>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: U64,
    pub block_hash: B256,
    pub transaction_hash: B256,
    pub transaction_index: U64,
    pub log_index: U64,
}

impl TryFrom<WireLog> for RawLog {
    type Error = RepositoryError;

    fn try_from(log: WireLog) -> RepositoryResult<Self> {
        Ok(RawLog {
            address: log.address,
            topics: log.topics,
            data: log.data,
            block_number: quantity("log block number", log.block_number)?,
            block_hash: log.block_hash,
            transaction_hash: log.transaction_hash,
            transaction_index: quantity("log transaction index", log.transaction_index)?,
            log_index: quantity("log index", log.log_index)?,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogFilter {
    pub block_hash: B256,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallRequest {
    pub to: Address,
    pub data: Bytes,
}

/// The `eth` namespace methods the repository uses.
#[rpc(client, namespace = "eth")]
pub trait EthApi {
    #[method(name = "blockNumber")]
    async fn block_number(&self) -> RpcResult<U64>;

    #[method(name = "getBalance")]
    async fn get_balance(&self, address: Address, tag: String) -> RpcResult<U256>;

    #[method(name = "getTransactionCount")]
    async fn get_transaction_count(&self, address: Address, tag: String) -> RpcResult<U64>;

    #[method(name = "getBlockByNumber")]
    async fn get_block_by_number(&self, number: U64, full: bool) -> RpcResult<Option<WireBlock>>;

    #[method(name = "getBlockByHash")]
    async fn get_block_by_hash(&self, hash: B256, full: bool) -> RpcResult<Option<WireBlock>>;

    #[method(name = "getTransactionByHash")]
    async fn get_transaction_by_hash(&self, hash: B256) -> RpcResult<Option<WireTransaction>>;

    #[method(name = "getTransactionReceipt")]
    async fn get_transaction_receipt(&self, hash: B256) -> RpcResult<Option<WireReceipt>>;

    #[method(name = "getLogs")]
    async fn get_logs(&self, filter: LogFilter) -> RpcResult<Vec<WireLog>>;

    #[method(name = "sendRawTransaction")]
    async fn send_raw_transaction(&self, raw: Bytes) -> RpcResult<B256>;

    #[method(name = "gasPrice")]
    async fn gas_price(&self) -> RpcResult<U256>;

    #[method(name = "estimateGas")]
    async fn estimate_gas(&self, request: GasEstimateRequest) -> RpcResult<U64>;

    #[method(name = "call")]
    async fn call(&self, request: CallRequest, tag: String) -> RpcResult<Bytes>;
}

/// Node client over HTTP JSON-RPC.
pub struct JsonRpcNodeClient {
    client: HttpClient,
}

impl JsonRpcNodeClient {
    /// Build a client for `url`; every request is bounded by `request_timeout`.
    pub fn connect(url: &str, request_timeout: Duration) -> RepositoryResult<Self> {
        let client = HttpClientBuilder::default()
            .request_timeout(request_timeout)
            .build(url)
            .map_err(|e| RepositoryError::Configuration(format!("node client for {url}: {e}")))?;
        tracing::info!(url, timeout_ms = request_timeout.as_millis() as u64, "node client ready");
        Ok(Self { client })
    }
}

fn upstream(method: &'static str) -> impl FnOnce(jsonrpsee::core::client::Error) -> RepositoryError {
    move |err| {
        tracing::debug!(method, error = %err, "node request failed");
        RepositoryError::Upstream(format!("{method}: {err}"))
    }
}

#[async_trait]
impl NodeClient for JsonRpcNodeClient {
    async fn block_height(&self) -> RepositoryResult<u64> {
        let height = EthApiClient::block_number(&self.client)
            .await
            .map_err(upstream("eth_blockNumber"))?;
        quantity("block height", height)
    }

    async fn balance(&self, address: Address) -> RepositoryResult<U256> {
        self.client
            .get_balance(address, LATEST.to_string())
            .await
            .map_err(upstream("eth_getBalance"))
    }

    async fn nonce(&self, address: Address) -> RepositoryResult<u64> {
        let nonce = self
            .client
            .get_transaction_count(address, LATEST.to_string())
            .await
            .map_err(upstream("eth_getTransactionCount"))?;
        quantity("nonce", nonce)
    }

    async fn block_by_number(&self, number: u64) -> RepositoryResult<Option<StoredBlock>> {
        let block = self
            .client
            .get_block_by_number(U64::from(number), false)
            .await
            .map_err(upstream("eth_getBlockByNumber"))?;
        block.map(StoredBlock::try_from).transpose()
    }

    async fn block_by_hash(&self, hash: B256) -> RepositoryResult<Option<StoredBlock>> {
        let block = self
            .client
            .get_block_by_hash(hash, false)
            .await
            .map_err(upstream("eth_getBlockByHash"))?;
        block.map(StoredBlock::try_from).transpose()
    }

    async fn transaction(&self, hash: B256) -> RepositoryResult<Option<StoredTransaction>> {
        let Some(tx) = self
            .client
            .get_transaction_by_hash(hash)
            .await
            .map_err(upstream("eth_getTransactionByHash"))?
        else {
            return Ok(None);
        };

        let mut stored = StoredTransaction {
            hash: tx.hash,
            from: tx.from,
            to: tx.to,
            contract_address: None,
            nonce: quantity("nonce", tx.nonce)?,
            value: tx.value,
            gas: quantity("gas", tx.gas)?,
            gas_price: tx.gas_price.unwrap_or_default(),
            input: tx.input,
            block: None,
        };

        if tx.block_hash.is_none() {
            return Ok(Some(stored));
        }

        // a mined transaction without a receipt yet is still reported pending
        let Some(receipt) = self
            .client
            .get_transaction_receipt(hash)
            .await
            .map_err(upstream("eth_getTransactionReceipt"))?
        else {
            return Ok(Some(stored));
        };

        let block = self
            .client
            .get_block_by_hash(receipt.block_hash, false)
            .await
            .map_err(upstream("eth_getBlockByHash"))?
            .ok_or_else(|| {
                RepositoryError::Upstream(format!(
                    "block {} of transaction {hash} is unknown to the node",
                    receipt.block_hash
                ))
            })?;

        stored.contract_address = receipt.contract_address;
        stored.block = Some(receipt_link(&receipt, block.timestamp)?);
        Ok(Some(stored))
    }

    async fn block_logs(&self, block_hash: B256) -> RepositoryResult<Vec<RawLog>> {
        let mut logs = self
            .client
            .get_logs(LogFilter { block_hash })
            .await
            .map_err(upstream("eth_getLogs"))?
            .into_iter()
            .map(RawLog::try_from)
            .collect::<RepositoryResult<Vec<_>>>()?;
        logs.sort_by_key(|log| log.log_index);
        Ok(logs)
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> RepositoryResult<B256> {
        EthApiClient::send_raw_transaction(&self.client, raw)
            .await
            .map_err(upstream("eth_sendRawTransaction"))
    }

    async fn gas_price(&self) -> RepositoryResult<U256> {
        EthApiClient::gas_price(&self.client)
            .await
            .map_err(upstream("eth_gasPrice"))
    }

    async fn estimate_gas(&self, request: &GasEstimateRequest) -> RepositoryResult<u64> {
        let gas = EthApiClient::estimate_gas(&self.client, request.clone())
            .await
            .map_err(upstream("eth_estimateGas"))?;
        quantity("gas estimate", gas)
    }

    async fn call(&self, to: Address, data: Bytes) -> RepositoryResult<Bytes> {
        EthApiClient::call(&self.client, CallRequest { to, data }, LATEST.to_string())
            .await
            .map_err(upstream("eth_call"))
    }
}

/// Block linkage of a mined transaction from its receipt.
fn receipt_link(receipt: &WireReceipt, timestamp: U64) -> RepositoryResult<BlockLink> {
    Ok(BlockLink {
        number: quantity("receipt block number", receipt.block_number)?,
        hash: receipt.block_hash,
        index: quantity("receipt transaction index", receipt.transaction_index)?,
        timestamp: quantity("block timestamp", timestamp)?,
        gas_used: quantity("receipt gas used", receipt.gas_used)?,
        status: match receipt.status {
            Some(status) => quantity("receipt status", status)?,
            None => 1,
        },
    })
}

fn decode_error<C: SolCall>(err: alloy_sol_types::Error) -> RepositoryError {
    RepositoryError::Decode(format!("{} result: {err}", C::SIGNATURE))
}

/// Run a read-only contract call and decode its return values.
async fn contract_call<C: SolCall>(
    node: &dyn NodeClient,
    contract: Address,
    call: C,
) -> RepositoryResult<C::Return> {
    let raw = node.call(contract, Bytes::from(call.abi_encode())).await?;
    C::abi_decode_returns(&raw, true).map_err(decode_error::<C>)
}

/// `balanceOf(owner)` of an ERC-20 token.
pub async fn erc20_balance_of(
    node: &dyn NodeClient,
    token: Address,
    owner: Address,
) -> RepositoryResult<U256> {
    Ok(contract_call(node, token, IErc20::balanceOfCall { owner }).await?._0)
}

/// `allowance(owner, spender)` of an ERC-20 token.
pub async fn erc20_allowance(
    node: &dyn NodeClient,
    token: Address,
    owner: Address,
    spender: Address,
) -> RepositoryResult<U256> {
    Ok(contract_call(node, token, IErc20::allowanceCall { owner, spender })
        .await?
        ._0)
}

pub async fn erc20_total_supply(node: &dyn NodeClient, token: Address) -> RepositoryResult<U256> {
    Ok(contract_call(node, token, IErc20::totalSupplyCall {}).await?._0)
}

pub async fn erc20_name(node: &dyn NodeClient, token: Address) -> RepositoryResult<String> {
    Ok(contract_call(node, token, IErc20::nameCall {}).await?._0)
}

pub async fn erc20_symbol(node: &dyn NodeClient, token: Address) -> RepositoryResult<String> {
    Ok(contract_call(node, token, IErc20::symbolCall {}).await?._0)
}

pub async fn erc20_decimals(node: &dyn NodeClient, token: Address) -> RepositoryResult<u8> {
    Ok(contract_call(node, token, IErc20::decimalsCall {}).await?._0)
}

pub async fn erc721_name(node: &dyn NodeClient, token: Address) -> RepositoryResult<String> {
    Ok(contract_call(node, token, IErc721::nameCall {}).await?._0)
}

pub async fn erc721_symbol(node: &dyn NodeClient, token: Address) -> RepositoryResult<String> {
    Ok(contract_call(node, token, IErc721::symbolCall {}).await?._0)
}

pub async fn erc721_total_supply(node: &dyn NodeClient, token: Address) -> RepositoryResult<U256> {
    Ok(contract_call(node, token, IErc721::totalSupplyCall {}).await?._0)
}

/// Number of NFTs `owner` holds in an ERC-721 contract.
pub async fn erc721_balance_of(
    node: &dyn NodeClient,
    token: Address,
    owner: Address,
) -> RepositoryResult<U256> {
    Ok(contract_call(node, token, IErc721::balanceOfCall { owner })
        .await?
        ._0)
}

pub async fn erc721_owner_of(
    node: &dyn NodeClient,
    token: Address,
    token_id: U256,
) -> RepositoryResult<Address> {
    Ok(contract_call(node, token, IErc721::ownerOfCall { tokenId: token_id })
        .await?
        ._0)
}

/// URI of the metadata JSON of one NFT.
pub async fn erc721_token_uri(
    node: &dyn NodeClient,
    token: Address,
    token_id: U256,
) -> RepositoryResult<String> {
    Ok(contract_call(node, token, IErc721::tokenURICall { tokenId: token_id })
        .await?
        ._0)
}

/// Operator approved for one NFT, zero when none.
pub async fn erc721_get_approved(
    node: &dyn NodeClient,
    token: Address,
    token_id: U256,
) -> RepositoryResult<Address> {
    Ok(contract_call(node, token, IErc721::getApprovedCall { tokenId: token_id })
        .await?
        ._0)
}

pub async fn erc721_is_approved_for_all(
    node: &dyn NodeClient,
    token: Address,
    owner: Address,
    operator: Address,
) -> RepositoryResult<bool> {
    Ok(
        contract_call(node, token, IErc721::isApprovedForAllCall { owner, operator })
            .await?
            ._0,
    )
}

pub async fn erc1155_uri(
    node: &dyn NodeClient,
    token: Address,
    token_id: U256,
) -> RepositoryResult<String> {
    Ok(contract_call(node, token, IErc1155::uriCall { id: token_id })
        .await?
        ._0)
}

pub async fn erc1155_balance_of(
    node: &dyn NodeClient,
    token: Address,
    owner: Address,
    token_id: U256,
) -> RepositoryResult<U256> {
    let call = IErc1155::balanceOfCall {
        account: owner,
        id: token_id,
    };
    Ok(contract_call(node, token, call).await?._0)
}

/// Balances of `owners[i]` in `token_ids[i]`, in order.
///
/// Lists of different lengths are rejected before reaching the node.
pub async fn erc1155_balance_of_batch(
    node: &dyn NodeClient,
    token: Address,
    owners: Vec<Address>,
    token_ids: Vec<U256>,
) -> RepositoryResult<Vec<U256>> {
    if owners.len() != token_ids.len() {
        return Err(RepositoryError::Decode(format!(
            "balanceOfBatch of {} owners and {} token ids",
            owners.len(),
            token_ids.len()
        )));
    }
    let expected = owners.len();
    let call = IErc1155::balanceOfBatchCall {
        accounts: owners,
        ids: token_ids,
    };
    let balances = contract_call(node, token, call).await?._0;
    if balances.len() != expected {
        return Err(RepositoryError::Decode(format!(
            "balanceOfBatch returned {} balances for {expected} pairs",
            balances.len()
        )));
    }
    Ok(balances)
}

pub async fn erc1155_is_approved_for_all(
    node: &dyn NodeClient,
    token: Address,
    owner: Address,
    operator: Address,
) -> RepositoryResult<bool> {
    let call = IErc1155::isApprovedForAllCall {
        account: owner,
        operator,
    };
    Ok(contract_call(node, token, call).await?._0)
}

/// ERC-165 interface probe of a contract.
pub async fn erc165_supports_interface(
    node: &dyn NodeClient,
    contract: Address,
    interface_id: FixedBytes<4>,
) -> RepositoryResult<bool> {
    let call = IErc165::supportsInterfaceCall {
        interfaceId: interface_id,
    };
    Ok(contract_call(node, contract, call).await?._0)
}
