use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{RepositoryError, RepositoryResult};
use crate::node::NodeClient;
use crate::types::{GasEstimateRequest, RawLog, StoredBlock, StoredTransaction};

#[derive(Default)]
struct NodeState {
    height: u64,
    gas_price: U256,
    balances: HashMap<Address, U256>,
    nonces: HashMap<Address, u64>,
    blocks: HashMap<u64, StoredBlock>,
    transactions: HashMap<B256, StoredTransaction>,
    logs: HashMap<B256, Vec<RawLog>>,
    call_results: HashMap<(Address, Bytes), Bytes>,
    submitted: Vec<Bytes>,
}

/// Scriptable in-memory node for dev/test runs.
///
/// Counts calls per method, can delay every call, and fails the next calls
/// with injected failures, one call per failure.
#[derive(Default)]
pub struct MockNode {
    state: Mutex<NodeState>,
    calls: Mutex<HashMap<&'static str, usize>>,
    delay: Mutex<Option<Duration>>,
    failures: Mutex<VecDeque<RepositoryError>>,
}

impl MockNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_height(&self, height: u64) {
        self.state.lock().height = height;
    }

    pub fn set_gas_price(&self, price: U256) {
        self.state.lock().gas_price = price;
    }

    pub fn set_balance(&self, address: Address, balance: U256) {
        self.state.lock().balances.insert(address, balance);
    }

    pub fn set_nonce(&self, address: Address, nonce: u64) {
        self.state.lock().nonces.insert(address, nonce);
    }

    /// Add a block; the height follows the highest block added.
    pub fn add_block(&self, block: StoredBlock) {
        let mut state = self.state.lock();
        state.height = state.height.max(block.number);
        state.blocks.insert(block.number, block);
    }

    pub fn add_transaction(&self, tx: StoredTransaction) {
        self.state.lock().transactions.insert(tx.hash, tx);
    }

    pub fn add_logs(&self, block_hash: B256, logs: Vec<RawLog>) {
        self.state.lock().logs.insert(block_hash, logs);
    }

    /// Answer `eth_call(to, data)` with `result`.
    pub fn set_call_result(&self, to: Address, data: Bytes, result: Bytes) {
        self.state.lock().call_results.insert((to, data), result);
    }

    /// Delay every subsequent call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Fail the next call not already claimed by an earlier failure.
    pub fn fail_next(&self, error: RepositoryError) {
        self.failures.lock().push_back(error);
    }

    /// Number of calls made to `method`.
    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().get(method).copied().unwrap_or(0)
    }

    /// Raw transactions submitted so far.
    pub fn submitted(&self) -> Vec<Bytes> {
        self.state.lock().submitted.clone()
    }

    async fn enter(&self, method: &'static str) -> RepositoryResult<()> {
        *self.calls.lock().entry(method).or_default() += 1;
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match self.failures.lock().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl NodeClient for MockNode {
    async fn block_height(&self) -> RepositoryResult<u64> {
        self.enter("block_height").await?;
        Ok(self.state.lock().height)
    }

    async fn balance(&self, address: Address) -> RepositoryResult<U256> {
        self.enter("balance").await?;
        Ok(self
            .state
            .lock()
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn nonce(&self, address: Address) -> RepositoryResult<u64> {
        self.enter("nonce").await?;
        Ok(self
            .state
            .lock()
            .nonces
            .get(&address)
            .copied()
            .unwrap_or_default())
    }

    async fn block_by_number(&self, number: u64) -> RepositoryResult<Option<StoredBlock>> {
        self.enter("block_by_number").await?;
        Ok(self.state.lock().blocks.get(&number).cloned())
    }

    async fn block_by_hash(&self, hash: B256) -> RepositoryResult<Option<StoredBlock>> {
        self.enter("block_by_hash").await?;
        Ok(self
            .state
            .lock()
            .blocks
            .values()
            .find(|block| block.hash == hash)
            .cloned())
    }

    async fn transaction(&self, hash: B256) -> RepositoryResult<Option<StoredTransaction>> {
        self.enter("transaction").await?;
        Ok(self.state.lock().transactions.get(&hash).cloned())
    }

    async fn block_logs(&self, block_hash: B256) -> RepositoryResult<Vec<RawLog>> {
        self.enter("block_logs").await?;
        Ok(self
            .state
            .lock()
            .logs
            .get(&block_hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> RepositoryResult<B256> {
        self.enter("send_raw_transaction").await?;
        let hash = keccak256(&raw);
        self.state.lock().submitted.push(raw);
        Ok(hash)
    }

    async fn gas_price(&self) -> RepositoryResult<U256> {
        self.enter("gas_price").await?;
        Ok(self.state.lock().gas_price)
    }

    async fn estimate_gas(&self, request: &GasEstimateRequest) -> RepositoryResult<u64> {
        self.enter("estimate_gas").await?;
        let calldata = request.data.as_ref().map_or(0, |data| data.len() as u64);
        Ok(21_000 + 16 * calldata)
    }

    async fn call(&self, to: Address, data: Bytes) -> RepositoryResult<Bytes> {
        self.enter("call").await?;
        self.state
            .lock()
            .call_results
            .get(&(to, data))
            .cloned()
            .ok_or_else(|| RepositoryError::Upstream(format!("execution reverted at {to}")))
    }
}
