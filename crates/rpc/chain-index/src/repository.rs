//! Repository: the single entry point of the data layer.
//!
//! Reads resolve through provider chains (ring cache, persistent store, node)
//! or, for live values, through a request collapser straight to the node.
//! Writes go to the store first and then replace or invalidate the ring cache
//! entry under one write lock, so a cache hit never returns a value older than
//! the last successful write.

use std::sync::Arc;

use alloy_primitives::{Address, Bytes, FixedBytes, B256, U256};
use parking_lot::Mutex;

use crate::cache::{CacheConfig, ChainCache};
use crate::collapser::{LiveQuery, RequestCollapser};
use crate::cursor::{paginate, Cursor, OrderedList, Ordinal, Page, ScanRange};
use crate::error::{Entity, RepositoryError, RepositoryResult};
use crate::node::{self, NodeClient};
use crate::provider::{BlockKey, CacheProvider, NodeProvider, ProviderChain, StoreProvider};
use crate::store::{
    ListKey, ListQuery, PersistentStore, TokenContractsQuery, TokenTransactionFilter, WriteOutcome,
};
use crate::types::{
    Account, Contract, GasEstimateRequest, RawLog, StoredBlock, StoredTransaction,
    TokenStandard, TokenTransaction, TokenTxKey,
};

/// Default maximum page size of every list.
const DEFAULT_LIST_LIMIT: u32 = 250;

/// Maximum page size per list kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListLimits {
    pub transactions: u32,
    pub blocks: u32,
    pub contracts: u32,
    pub token_transactions: u32,
}

impl Default for ListLimits {
    fn default() -> Self {
        Self {
            transactions: DEFAULT_LIST_LIMIT,
            blocks: DEFAULT_LIST_LIMIT,
            contracts: DEFAULT_LIST_LIMIT,
            token_transactions: DEFAULT_LIST_LIMIT,
        }
    }
}

/// Repository configuration.
#[derive(Debug, Clone, Default)]
pub struct RepositoryConfig {
    pub cache: CacheConfig,
    pub limits: ListLimits,
}

/// A store list bound to one query.
struct StoreList<'a> {
    store: &'a dyn PersistentStore,
    query: ListQuery,
}

impl OrderedList for StoreList<'_> {
    type Key = ListKey;

    fn scan(&self, range: ScanRange) -> RepositoryResult<Vec<(Ordinal, ListKey)>> {
        self.store.scan(&self.query, range)
    }

    fn contains(&self, ordinal: Ordinal) -> RepositoryResult<bool> {
        self.store.contains(&self.query, ordinal)
    }

    fn total(&self) -> RepositoryResult<u64> {
        self.store.count(&self.query)
    }
}

fn unexpected_key(key: &ListKey) -> RepositoryError {
    RepositoryError::Storage(format!("unexpected list key {key:?}"))
}

fn block_is_final(_: &Arc<StoredBlock>) -> bool {
    true
}

fn transaction_is_final(tx: &Arc<StoredTransaction>) -> bool {
    tx.is_final()
}

/// Data layer facade used by the query layer and the ingestion services.
pub struct Repository {
    store: Arc<dyn PersistentStore>,
    node: Arc<dyn NodeClient>,
    cache: Arc<ChainCache>,
    blocks: ProviderChain<BlockKey, Arc<StoredBlock>>,
    transactions: ProviderChain<B256, Arc<StoredTransaction>>,
    live_amounts: RequestCollapser<LiveQuery, RepositoryResult<U256>>,
    live_counters: RequestCollapser<LiveQuery, RepositoryResult<u64>>,
    live_addresses: RequestCollapser<LiveQuery, RepositoryResult<Address>>,
    live_flags: RequestCollapser<LiveQuery, RepositoryResult<bool>>,
    live_texts: RequestCollapser<LiveQuery, RepositoryResult<String>>,
    live_amount_lists: RequestCollapser<LiveQuery, RepositoryResult<Vec<U256>>>,
    limits: ListLimits,
    /// Serializes store writes with their cache update.
    write_lock: Mutex<()>,
}

impl Repository {
    pub fn new(
        store: Arc<dyn PersistentStore>,
        node: Arc<dyn NodeClient>,
        config: RepositoryConfig,
    ) -> Self {
        let cache = Arc::new(ChainCache::new(config.cache));
        let cache_tier = Arc::new(CacheProvider::new(Arc::clone(&cache)));
        let store_tier = Arc::new(StoreProvider::new(Arc::clone(&store)));
        let node_tier = Arc::new(NodeProvider::new(Arc::clone(&node)));

        let blocks: ProviderChain<BlockKey, Arc<StoredBlock>> =
            ProviderChain::new(Entity::Block, block_is_final)
                .with(cache_tier.clone())
                .with(store_tier.clone())
                .with(node_tier.clone());
        let transactions: ProviderChain<B256, Arc<StoredTransaction>> =
            ProviderChain::new(Entity::Transaction, transaction_is_final)
                .with(cache_tier)
                .with(store_tier)
                .with(node_tier);

        Self {
            store,
            node,
            cache,
            blocks,
            transactions,
            live_amounts: RequestCollapser::new(),
            live_counters: RequestCollapser::new(),
            live_addresses: RequestCollapser::new(),
            live_flags: RequestCollapser::new(),
            live_texts: RequestCollapser::new(),
            live_amount_lists: RequestCollapser::new(),
            limits: config.limits,
            write_lock: Mutex::new(()),
        }
    }

    pub fn limits(&self) -> ListLimits {
        self.limits
    }

    pub fn cache(&self) -> &ChainCache {
        &self.cache
    }

    fn list(&self, query: ListQuery) -> StoreList<'_> {
        StoreList {
            store: self.store.as_ref(),
            query,
        }
    }

    async fn live_amount<F, Fut>(&self, query: LiveQuery, call: F) -> RepositoryResult<U256>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = RepositoryResult<U256>>,
    {
        self.live_amounts.run(query, call).await
    }

    async fn live_counter<F, Fut>(&self, query: LiveQuery, call: F) -> RepositoryResult<u64>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = RepositoryResult<u64>>,
    {
        self.live_counters.run(query, call).await
    }

    // ==================== Accounts ====================

    /// Stored account, or a plain wallet when the address was never seen.
    pub fn account(&self, address: Address) -> RepositoryResult<Account> {
        Ok(self
            .store
            .account(address)?
            .unwrap_or_else(|| Account::wallet(address)))
    }

    pub fn account_is_known(&self, address: Address) -> RepositoryResult<bool> {
        Ok(self.store.account(address)?.is_some())
    }

    pub fn accounts_active(&self) -> RepositoryResult<u64> {
        self.store.account_count()
    }

    pub fn store_account(&self, account: &Account) -> RepositoryResult<WriteOutcome> {
        let _guard = self.write_lock.lock();
        self.store.store_account(account)
    }

    /// Move the account's last activity forward to `block`.
    pub fn account_mark_activity(
        &self,
        address: Address,
        block: u64,
    ) -> RepositoryResult<WriteOutcome> {
        let _guard = self.write_lock.lock();
        self.store.mark_account_activity(address, block)
    }

    pub async fn account_balance(&self, address: Address) -> RepositoryResult<U256> {
        let node = Arc::clone(&self.node);
        self.live_amount(LiveQuery::Balance(address), || async move {
            node.balance(address).await
        })
        .await
    }

    pub async fn account_nonce(&self, address: Address) -> RepositoryResult<u64> {
        let node = Arc::clone(&self.node);
        self.live_counter(LiveQuery::Nonce(address), || async move {
            node.nonce(address).await
        })
        .await
    }

    /// Transactions sent or received by `address`; with `recipient`, only
    /// those it sent to `recipient`.
    pub async fn account_transactions(
        &self,
        address: Address,
        recipient: Option<Address>,
        cursor: Option<&Cursor>,
        count: i32,
    ) -> RepositoryResult<Page<Arc<StoredTransaction>>> {
        let query = ListQuery::Transactions {
            account: Some(address),
            recipient,
        };
        self.transaction_page(query, cursor, count).await
    }

    // ==================== Blocks ====================

    pub async fn block_height(&self) -> RepositoryResult<u64> {
        let node = Arc::clone(&self.node);
        self.live_counter(LiveQuery::BlockHeight, || async move {
            node.block_height().await
        })
        .await
    }

    /// Last block fully processed by ingestion.
    pub fn last_known_block(&self) -> RepositoryResult<Option<u64>> {
        self.store.last_known_block()
    }

    pub fn update_last_known_block(&self, number: u64) -> RepositoryResult<()> {
        let _guard = self.write_lock.lock();
        self.store.set_last_known_block(number)
    }

    /// Block by number, or the head block when `number` is `None`.
    pub async fn block_by_number(&self, number: Option<u64>) -> RepositoryResult<Arc<StoredBlock>> {
        let number = match number {
            Some(number) => number,
            None => self.block_height().await?,
        };
        self.blocks
            .resolve(&BlockKey::Number(number))
            .await?
            .ok_or_else(|| RepositoryError::not_found(Entity::Block, number))
    }

    pub async fn block_by_hash(&self, hash: B256) -> RepositoryResult<Arc<StoredBlock>> {
        self.blocks
            .resolve(&BlockKey::Hash(hash))
            .await?
            .ok_or_else(|| RepositoryError::not_found(Entity::Block, hash))
    }

    pub async fn blocks(
        &self,
        cursor: Option<&Cursor>,
        count: i32,
    ) -> RepositoryResult<Page<Arc<StoredBlock>>> {
        let page = paginate(&self.list(ListQuery::Blocks), cursor, count, self.limits.blocks)?;
        let mut nodes = Vec::with_capacity(page.edges.len());
        for key in page.nodes() {
            let ListKey::Block(number) = key else {
                return Err(unexpected_key(key));
            };
            nodes.push(self.block_by_number(Some(*number)).await?);
        }
        page.with_nodes(nodes)
    }

    /// Store a block and replace its cache entry.
    pub fn store_block(&self, block: &StoredBlock) -> RepositoryResult<WriteOutcome> {
        let _guard = self.write_lock.lock();
        let outcome = self.store.store_block(block)?;
        if outcome.changed() {
            self.cache.insert_block(Arc::new(block.clone()));
        }
        Ok(outcome)
    }

    /// Put a block into the ring cache only.
    pub fn cache_block(&self, block: Arc<StoredBlock>) {
        self.cache.insert_block(block);
    }

    // ==================== Transactions ====================

    /// Transaction by hash through cache, store and node.
    pub async fn transaction(&self, hash: B256) -> RepositoryResult<Arc<StoredTransaction>> {
        self.transactions
            .resolve(&hash)
            .await?
            .ok_or_else(|| RepositoryError::not_found(Entity::Transaction, hash))
    }

    /// Transaction straight from the node, without touching store or cache.
    pub async fn load_transaction(&self, hash: B256) -> RepositoryResult<StoredTransaction> {
        self.node
            .transaction(hash)
            .await?
            .ok_or_else(|| RepositoryError::not_found(Entity::Transaction, hash))
    }

    /// Log records of a block from the node, in log index order.
    pub async fn block_logs(&self, block_hash: B256) -> RepositoryResult<Vec<RawLog>> {
        self.node.block_logs(block_hash).await
    }

    pub async fn transactions(
        &self,
        cursor: Option<&Cursor>,
        count: i32,
    ) -> RepositoryResult<Page<Arc<StoredTransaction>>> {
        let query = ListQuery::Transactions {
            account: None,
            recipient: None,
        };
        self.transaction_page(query, cursor, count).await
    }

    pub fn transactions_count(&self) -> RepositoryResult<u64> {
        self.store.count(&ListQuery::Transactions {
            account: None,
            recipient: None,
        })
    }

    async fn transaction_page(
        &self,
        query: ListQuery,
        cursor: Option<&Cursor>,
        count: i32,
    ) -> RepositoryResult<Page<Arc<StoredTransaction>>> {
        let page = paginate(&self.list(query), cursor, count, self.limits.transactions)?;
        let mut nodes = Vec::with_capacity(page.edges.len());
        for key in page.nodes() {
            let ListKey::Transaction(hash) = key else {
                return Err(unexpected_key(key));
            };
            nodes.push(self.transaction(*hash).await?);
        }
        page.with_nodes(nodes)
    }

    /// Store a transaction and bring its cache entry in line with the store.
    pub fn store_transaction(&self, tx: &StoredTransaction) -> RepositoryResult<WriteOutcome> {
        let _guard = self.write_lock.lock();
        let outcome = self.store.store_transaction(tx)?;
        if outcome.changed() {
            match self.store.transaction(tx.hash)? {
                Some(stored) if stored.is_final() => {
                    self.cache.transactions.insert(tx.hash, Arc::new(stored));
                }
                _ => self.cache.transactions.invalidate(&tx.hash),
            }
        }
        Ok(outcome)
    }

    /// Put a final transaction into the ring cache only.
    pub fn cache_transaction(&self, tx: Arc<StoredTransaction>) {
        if tx.is_final() {
            self.cache.transactions.insert(tx.hash, tx);
        }
    }

    /// Submit a signed transaction and return the node's view of it.
    pub async fn send_transaction(&self, raw: Bytes) -> RepositoryResult<StoredTransaction> {
        let hash = self.node.send_raw_transaction(raw).await?;
        tracing::debug!(%hash, "transaction submitted");
        self.load_transaction(hash).await
    }

    pub async fn gas_price(&self) -> RepositoryResult<U256> {
        let node = Arc::clone(&self.node);
        self.live_amount(LiveQuery::GasPrice, || async move {
            node.gas_price().await
        })
        .await
    }

    pub async fn gas_estimate(&self, request: &GasEstimateRequest) -> RepositoryResult<u64> {
        self.node.estimate_gas(request).await
    }

    // ==================== Contracts ====================

    pub fn contract(&self, address: Address) -> RepositoryResult<Contract> {
        self.store
            .contract(address)?
            .ok_or_else(|| RepositoryError::not_found(Entity::Contract, address))
    }

    pub fn contracts(
        &self,
        validated_only: bool,
        cursor: Option<&Cursor>,
        count: i32,
    ) -> RepositoryResult<Page<Contract>> {
        let page = paginate(
            &self.list(ListQuery::Contracts { validated_only }),
            cursor,
            count,
            self.limits.contracts,
        )?;
        page.try_map(|key| {
            let ListKey::Contract(address) = key else {
                return Err(unexpected_key(&key));
            };
            self.contract(address)
        })
    }

    pub fn store_contract(&self, contract: &Contract) -> RepositoryResult<WriteOutcome> {
        let _guard = self.write_lock.lock();
        self.store.store_contract(contract)
    }

    // ==================== Token transactions ====================

    pub fn token_transaction(&self, key: &TokenTxKey) -> RepositoryResult<TokenTransaction> {
        self.store
            .token_transaction(key)?
            .ok_or_else(|| RepositoryError::not_found(Entity::TokenTransaction, key))
    }

    pub fn token_transactions(
        &self,
        filter: TokenTransactionFilter,
        cursor: Option<&Cursor>,
        count: i32,
    ) -> RepositoryResult<Page<TokenTransaction>> {
        let page = paginate(
            &self.list(ListQuery::TokenTransactions(filter)),
            cursor,
            count,
            self.limits.token_transactions,
        )?;
        page.try_map(|key| {
            let ListKey::TokenTransaction(key) = key else {
                return Err(unexpected_key(&key));
            };
            self.token_transaction(&key)
        })
    }

    /// Token transactions of one transaction in log order.
    pub fn token_transactions_by_call(&self, hash: B256) -> RepositoryResult<Vec<TokenTransaction>> {
        self.store.token_transactions_by_call(hash)
    }

    pub fn store_token_transaction(&self, ttx: &TokenTransaction) -> RepositoryResult<WriteOutcome> {
        let _guard = self.write_lock.lock();
        self.store.store_token_transaction(ttx)
    }

    /// Standard of a token contract as seen in its stored transfers.
    pub fn token_standard(&self, token: Address) -> RepositoryResult<Option<TokenStandard>> {
        self.store.token_standard(token)
    }

    // ==================== ERC-20 views ====================

    pub async fn erc20_balance_of(&self, token: Address, owner: Address) -> RepositoryResult<U256> {
        let node = Arc::clone(&self.node);
        self.live_amount(LiveQuery::Erc20BalanceOf { token, owner }, || async move {
            node::erc20_balance_of(node.as_ref(), token, owner).await
        })
        .await
    }

    pub async fn erc20_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
    ) -> RepositoryResult<U256> {
        let node = Arc::clone(&self.node);
        let query = LiveQuery::Erc20Allowance {
            token,
            owner,
            spender,
        };
        self.live_amount(query, || async move {
            node::erc20_allowance(node.as_ref(), token, owner, spender).await
        })
        .await
    }

    pub async fn erc20_total_supply(&self, token: Address) -> RepositoryResult<U256> {
        let node = Arc::clone(&self.node);
        self.live_amount(LiveQuery::Erc20TotalSupply(token), || async move {
            node::erc20_total_supply(node.as_ref(), token).await
        })
        .await
    }

    pub async fn erc20_name(&self, token: Address) -> RepositoryResult<String> {
        node::erc20_name(self.node.as_ref(), token).await
    }

    pub async fn erc20_symbol(&self, token: Address) -> RepositoryResult<String> {
        node::erc20_symbol(self.node.as_ref(), token).await
    }

    pub async fn erc20_decimals(&self, token: Address) -> RepositoryResult<u8> {
        node::erc20_decimals(self.node.as_ref(), token).await
    }

    // ==================== Token contract lists ====================

    fn token_contracts(
        &self,
        query: TokenContractsQuery,
        count: i32,
    ) -> RepositoryResult<Vec<Address>> {
        let max = i32::try_from(self.limits.token_transactions).unwrap_or(i32::MAX);
        let limit = count.clamp(0, max) as u32;
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.store.token_contracts(&query, limit)
    }

    /// Known ERC-20 tokens, most active first.
    pub fn erc20_tokens(&self, count: i32) -> RepositoryResult<Vec<Address>> {
        self.token_contracts(TokenContractsQuery::ByActivity(TokenStandard::Erc20), count)
    }

    /// ERC-20 tokens `owner` sent or received, most recent first.
    pub fn erc20_assets(&self, owner: Address, count: i32) -> RepositoryResult<Vec<Address>> {
        let query = TokenContractsQuery::Assets {
            standard: TokenStandard::Erc20,
            owner,
        };
        self.token_contracts(query, count)
    }

    pub fn erc721_contracts(&self, count: i32) -> RepositoryResult<Vec<Address>> {
        self.token_contracts(TokenContractsQuery::ByActivity(TokenStandard::Erc721), count)
    }

    pub fn erc1155_contracts(&self, count: i32) -> RepositoryResult<Vec<Address>> {
        self.token_contracts(TokenContractsQuery::ByActivity(TokenStandard::Erc1155), count)
    }

    // ==================== ERC-721 views ====================

    pub async fn erc721_name(&self, token: Address) -> RepositoryResult<String> {
        let node = Arc::clone(&self.node);
        self.live_texts
            .run(LiveQuery::Erc721Name(token), || async move {
                node::erc721_name(node.as_ref(), token).await
            })
            .await
    }

    pub async fn erc721_symbol(&self, token: Address) -> RepositoryResult<String> {
        let node = Arc::clone(&self.node);
        self.live_texts
            .run(LiveQuery::Erc721Symbol(token), || async move {
                node::erc721_symbol(node.as_ref(), token).await
            })
            .await
    }

    pub async fn erc721_total_supply(&self, token: Address) -> RepositoryResult<U256> {
        let node = Arc::clone(&self.node);
        self.live_amount(LiveQuery::Erc721TotalSupply(token), || async move {
            node::erc721_total_supply(node.as_ref(), token).await
        })
        .await
    }

    pub async fn erc721_balance_of(&self, token: Address, owner: Address) -> RepositoryResult<U256> {
        let node = Arc::clone(&self.node);
        self.live_amount(LiveQuery::Erc721BalanceOf { token, owner }, || async move {
            node::erc721_balance_of(node.as_ref(), token, owner).await
        })
        .await
    }

    pub async fn erc721_owner_of(&self, token: Address, token_id: U256) -> RepositoryResult<Address> {
        let node = Arc::clone(&self.node);
        self.live_addresses
            .run(LiveQuery::Erc721OwnerOf { token, token_id }, || async move {
                node::erc721_owner_of(node.as_ref(), token, token_id).await
            })
            .await
    }

    pub async fn erc721_token_uri(&self, token: Address, token_id: U256) -> RepositoryResult<String> {
        let node = Arc::clone(&self.node);
        self.live_texts
            .run(LiveQuery::Erc721TokenUri { token, token_id }, || async move {
                node::erc721_token_uri(node.as_ref(), token, token_id).await
            })
            .await
    }

    pub async fn erc721_get_approved(
        &self,
        token: Address,
        token_id: U256,
    ) -> RepositoryResult<Address> {
        let node = Arc::clone(&self.node);
        self.live_addresses
            .run(LiveQuery::Erc721GetApproved { token, token_id }, || async move {
                node::erc721_get_approved(node.as_ref(), token, token_id).await
            })
            .await
    }

    pub async fn erc721_is_approved_for_all(
        &self,
        token: Address,
        owner: Address,
        operator: Address,
    ) -> RepositoryResult<bool> {
        let node = Arc::clone(&self.node);
        let query = LiveQuery::Erc721IsApprovedForAll {
            token,
            owner,
            operator,
        };
        self.live_flags
            .run(query, || async move {
                node::erc721_is_approved_for_all(node.as_ref(), token, owner, operator).await
            })
            .await
    }

    // ==================== ERC-1155 views ====================

    pub async fn erc1155_uri(&self, token: Address, token_id: U256) -> RepositoryResult<String> {
        let node = Arc::clone(&self.node);
        self.live_texts
            .run(LiveQuery::Erc1155Uri { token, token_id }, || async move {
                node::erc1155_uri(node.as_ref(), token, token_id).await
            })
            .await
    }

    pub async fn erc1155_balance_of(
        &self,
        token: Address,
        owner: Address,
        token_id: U256,
    ) -> RepositoryResult<U256> {
        let node = Arc::clone(&self.node);
        let query = LiveQuery::Erc1155BalanceOf {
            token,
            owner,
            token_id,
        };
        self.live_amount(query, || async move {
            node::erc1155_balance_of(node.as_ref(), token, owner, token_id).await
        })
        .await
    }

    /// Balances of each `(owners[i], token_ids[i])` pair, in order.
    pub async fn erc1155_balance_of_batch(
        &self,
        token: Address,
        owners: Vec<Address>,
        token_ids: Vec<U256>,
    ) -> RepositoryResult<Vec<U256>> {
        let node = Arc::clone(&self.node);
        let query = LiveQuery::Erc1155BalanceOfBatch {
            token,
            owners: owners.clone(),
            token_ids: token_ids.clone(),
        };
        self.live_amount_lists
            .run(query, || async move {
                node::erc1155_balance_of_batch(node.as_ref(), token, owners, token_ids).await
            })
            .await
    }

    pub async fn erc1155_is_approved_for_all(
        &self,
        token: Address,
        owner: Address,
        operator: Address,
    ) -> RepositoryResult<bool> {
        let node = Arc::clone(&self.node);
        let query = LiveQuery::Erc1155IsApprovedForAll {
            token,
            owner,
            operator,
        };
        self.live_flags
            .run(query, || async move {
                node::erc1155_is_approved_for_all(node.as_ref(), token, owner, operator).await
            })
            .await
    }

    // ==================== ERC-165 ====================

    pub async fn erc165_supports_interface(
        &self,
        contract: Address,
        interface_id: FixedBytes<4>,
    ) -> RepositoryResult<bool> {
        let node = Arc::clone(&self.node);
        let query = LiveQuery::Erc165SupportsInterface {
            contract,
            interface_id,
        };
        self.live_flags
            .run(query, || async move {
                node::erc165_supports_interface(node.as_ref(), contract, interface_id).await
            })
            .await
    }
}
