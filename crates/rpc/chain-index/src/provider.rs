//! Ordered fallback chain for entity lookups.
//!
//! A [`ProviderChain`] tries its providers in order (cache, store, node) and
//! returns the first hit. Final values found in a later tier are filled back
//! into every earlier tier, nearest to the hit first, so the next lookup is
//! answered closer to the caller. Providers can be added, removed or
//! reordered without touching call sites.

use std::fmt;
use std::sync::Arc;

use alloy_primitives::B256;
use async_trait::async_trait;

use crate::cache::{ChainCache, FillTicket};
use crate::error::{Entity, RepositoryError, RepositoryResult};
use crate::node::NodeClient;
use crate::store::PersistentStore;
use crate::types::{StoredBlock, StoredTransaction};

/// Outcome of a single tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<V> {
    Found(V),
    Missing,
}

impl<V> From<Option<V>> for Lookup<V> {
    fn from(value: Option<V>) -> Self {
        match value {
            Some(value) => Lookup::Found(value),
            None => Lookup::Missing,
        }
    }
}

/// One tier of a lookup chain.
#[async_trait]
pub trait Provider<K, V>: Send + Sync
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn name(&self) -> &'static str;

    async fn lookup(&self, key: &K) -> RepositoryResult<Lookup<V>>;

    /// Taken before the chain starts; handed back to [`Provider::fill`].
    fn fill_ticket(&self) -> Option<FillTicket> {
        None
    }

    /// Accept a final value found in a later tier.
    fn fill(&self, _key: &K, _value: &V, _ticket: Option<FillTicket>) -> RepositoryResult<()> {
        Ok(())
    }
}

/// Providers tried in sequence for one entity kind.
pub struct ProviderChain<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    entity: Entity,
    providers: Vec<Arc<dyn Provider<K, V>>>,
    is_final: fn(&V) -> bool,
}

impl<K, V> ProviderChain<K, V>
where
    K: fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Empty chain; only values passing `is_final` are filled back.
    pub fn new(entity: Entity, is_final: fn(&V) -> bool) -> Self {
        Self {
            entity,
            providers: Vec::new(),
            is_final,
        }
    }

    /// Append a tier after the existing ones.
    pub fn with(mut self, provider: Arc<dyn Provider<K, V>>) -> Self {
        self.providers.push(provider);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    /// Resolve `key` through the chain.
    ///
    /// A tier error ends the lookup; fill failures are logged and ignored.
    pub async fn resolve(&self, key: &K) -> RepositoryResult<Option<V>> {
        if self.providers.is_empty() {
            return Err(RepositoryError::Configuration(format!(
                "no providers configured for {}",
                self.entity
            )));
        }

        let tickets: Vec<Option<FillTicket>> =
            self.providers.iter().map(|p| p.fill_ticket()).collect();

        for (tier, provider) in self.providers.iter().enumerate() {
            let value = match provider.lookup(key).await? {
                Lookup::Found(value) => value,
                Lookup::Missing => continue,
            };
            tracing::trace!(
                entity = %self.entity,
                provider = provider.name(),
                ?key,
                "lookup resolved"
            );

            if (self.is_final)(&value) {
                for earlier in (0..tier).rev() {
                    let target = &self.providers[earlier];
                    if let Err(err) = target.fill(key, &value, tickets[earlier]) {
                        tracing::warn!(
                            entity = %self.entity,
                            provider = target.name(),
                            ?key,
                            error = %err,
                            "back-fill failed"
                        );
                    }
                }
            }
            return Ok(Some(value));
        }

        Ok(None)
    }
}

/// Block lookup key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockKey {
    Number(u64),
    Hash(B256),
}

/// Ring cache tier.
pub struct CacheProvider {
    cache: Arc<ChainCache>,
}

impl CacheProvider {
    pub fn new(cache: Arc<ChainCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Provider<BlockKey, Arc<StoredBlock>> for CacheProvider {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn lookup(&self, key: &BlockKey) -> RepositoryResult<Lookup<Arc<StoredBlock>>> {
        Ok(match key {
            BlockKey::Number(number) => self.cache.blocks.get(number),
            BlockKey::Hash(hash) => self.cache.block_by_hash(*hash),
        }
        .into())
    }

    fn fill_ticket(&self) -> Option<FillTicket> {
        Some(self.cache.blocks.fill_ticket())
    }

    fn fill(
        &self,
        _key: &BlockKey,
        block: &Arc<StoredBlock>,
        ticket: Option<FillTicket>,
    ) -> RepositoryResult<()> {
        let Some(ticket) = ticket else {
            return Ok(());
        };
        if self
            .cache
            .blocks
            .fill(ticket, block.number, Arc::clone(block))
        {
            self.cache.block_numbers.insert(block.hash, block.number);
        }
        Ok(())
    }
}

#[async_trait]
impl Provider<B256, Arc<StoredTransaction>> for CacheProvider {
    fn name(&self) -> &'static str {
        "cache"
    }

    async fn lookup(&self, hash: &B256) -> RepositoryResult<Lookup<Arc<StoredTransaction>>> {
        Ok(self.cache.transactions.get(hash).into())
    }

    fn fill_ticket(&self) -> Option<FillTicket> {
        Some(self.cache.transactions.fill_ticket())
    }

    fn fill(
        &self,
        hash: &B256,
        tx: &Arc<StoredTransaction>,
        ticket: Option<FillTicket>,
    ) -> RepositoryResult<()> {
        if let Some(ticket) = ticket {
            self.cache.transactions.fill(ticket, *hash, Arc::clone(tx));
        }
        Ok(())
    }
}

/// Persistent store tier.
pub struct StoreProvider {
    store: Arc<dyn PersistentStore>,
}

impl StoreProvider {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Provider<BlockKey, Arc<StoredBlock>> for StoreProvider {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn lookup(&self, key: &BlockKey) -> RepositoryResult<Lookup<Arc<StoredBlock>>> {
        let block = match key {
            BlockKey::Number(number) => self.store.block(*number)?,
            BlockKey::Hash(hash) => self.store.block_by_hash(*hash)?,
        };
        Ok(block.map(Arc::new).into())
    }

    fn fill(
        &self,
        _key: &BlockKey,
        block: &Arc<StoredBlock>,
        _ticket: Option<FillTicket>,
    ) -> RepositoryResult<()> {
        self.store.store_block(block).map(|_| ())
    }
}

#[async_trait]
impl Provider<B256, Arc<StoredTransaction>> for StoreProvider {
    fn name(&self) -> &'static str {
        "store"
    }

    async fn lookup(&self, hash: &B256) -> RepositoryResult<Lookup<Arc<StoredTransaction>>> {
        Ok(self.store.transaction(*hash)?.map(Arc::new).into())
    }

    fn fill(
        &self,
        _hash: &B256,
        tx: &Arc<StoredTransaction>,
        _ticket: Option<FillTicket>,
    ) -> RepositoryResult<()> {
        self.store.store_transaction(tx).map(|_| ())
    }
}

/// Node tier. Never filled.
pub struct NodeProvider {
    node: Arc<dyn NodeClient>,
}

impl NodeProvider {
    pub fn new(node: Arc<dyn NodeClient>) -> Self {
        Self { node }
    }
}

#[async_trait]
impl Provider<BlockKey, Arc<StoredBlock>> for NodeProvider {
    fn name(&self) -> &'static str {
        "node"
    }

    async fn lookup(&self, key: &BlockKey) -> RepositoryResult<Lookup<Arc<StoredBlock>>> {
        let block = match key {
            BlockKey::Number(number) => self.node.block_by_number(*number).await?,
            BlockKey::Hash(hash) => self.node.block_by_hash(*hash).await?,
        };
        Ok(block.map(Arc::new).into())
    }
}

#[async_trait]
impl Provider<B256, Arc<StoredTransaction>> for NodeProvider {
    fn name(&self) -> &'static str {
        "node"
    }

    async fn lookup(&self, hash: &B256) -> RepositoryResult<Lookup<Arc<StoredTransaction>>> {
        Ok(self.node.transaction(*hash).await?.map(Arc::new).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Map-backed tier recording every fill it receives.
    struct MapProvider {
        name: &'static str,
        values: Mutex<HashMap<u64, u64>>,
        lookups: Mutex<usize>,
        fills: Arc<Mutex<Vec<&'static str>>>,
        failure: Mutex<Option<RepositoryError>>,
    }

    impl MapProvider {
        fn new(name: &'static str, fills: &Arc<Mutex<Vec<&'static str>>>) -> Self {
            Self {
                name,
                values: Mutex::new(HashMap::new()),
                lookups: Mutex::new(0),
                fills: Arc::clone(fills),
                failure: Mutex::new(None),
            }
        }

        fn with_value(self, key: u64, value: u64) -> Self {
            self.values.lock().insert(key, value);
            self
        }
    }

    #[async_trait]
    impl Provider<u64, u64> for MapProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn lookup(&self, key: &u64) -> RepositoryResult<Lookup<u64>> {
            *self.lookups.lock() += 1;
            if let Some(err) = self.failure.lock().take() {
                return Err(err);
            }
            Ok(self.values.lock().get(key).copied().into())
        }

        fn fill(&self, key: &u64, value: &u64, _ticket: Option<FillTicket>) -> RepositoryResult<()> {
            self.fills.lock().push(self.name);
            self.values.lock().insert(*key, *value);
            Ok(())
        }
    }

    fn always_final(_: &u64) -> bool {
        true
    }

    fn even_is_final(value: &u64) -> bool {
        value % 2 == 0
    }

    #[tokio::test]
    async fn first_hit_stops_the_chain() {
        let fills = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::new(MapProvider::new("first", &fills).with_value(1, 10));
        let second = Arc::new(MapProvider::new("second", &fills).with_value(1, 20));
        let chain = ProviderChain::new(Entity::Block, always_final)
            .with(first.clone())
            .with(second.clone());

        assert_eq!(chain.resolve(&1).await.unwrap(), Some(10));
        assert_eq!(*second.lookups.lock(), 0);
        assert!(fills.lock().is_empty());
    }

    #[tokio::test]
    async fn later_hit_fills_earlier_tiers_nearest_first() {
        let fills = Arc::new(Mutex::new(Vec::new()));
        let cache = Arc::new(MapProvider::new("cache", &fills));
        let store = Arc::new(MapProvider::new("store", &fills));
        let node = Arc::new(MapProvider::new("node", &fills).with_value(7, 70));
        let chain = ProviderChain::new(Entity::Transaction, always_final)
            .with(cache.clone())
            .with(store.clone())
            .with(node.clone());

        assert_eq!(chain.names(), vec!["cache", "store", "node"]);
        assert_eq!(chain.resolve(&7).await.unwrap(), Some(70));
        assert_eq!(*fills.lock(), vec!["store", "cache"]);

        // second lookup is served by the first tier
        assert_eq!(chain.resolve(&7).await.unwrap(), Some(70));
        assert_eq!(*node.lookups.lock(), 1);
    }

    #[tokio::test]
    async fn non_final_values_are_not_filled() {
        let fills = Arc::new(Mutex::new(Vec::new()));
        let cache = Arc::new(MapProvider::new("cache", &fills));
        let node = Arc::new(MapProvider::new("node", &fills).with_value(3, 31));
        let chain = ProviderChain::new(Entity::Transaction, even_is_final)
            .with(cache.clone())
            .with(node);

        assert_eq!(chain.resolve(&3).await.unwrap(), Some(31));
        assert!(fills.lock().is_empty());
        assert!(cache.values.lock().is_empty());
    }

    #[tokio::test]
    async fn miss_everywhere_is_none() {
        let fills = Arc::new(Mutex::new(Vec::new()));
        let chain = ProviderChain::new(Entity::Block, always_final)
            .with(Arc::new(MapProvider::new("cache", &fills)))
            .with(Arc::new(MapProvider::new("store", &fills)));

        assert_eq!(chain.resolve(&99).await.unwrap(), None);
    }

    #[tokio::test]
    async fn tier_error_ends_lookup() {
        let fills = Arc::new(Mutex::new(Vec::new()));
        let store = Arc::new(MapProvider::new("store", &fills));
        *store.failure.lock() = Some(RepositoryError::Storage("disk gone".into()));
        let node = Arc::new(MapProvider::new("node", &fills).with_value(1, 2));
        let chain = ProviderChain::new(Entity::Block, always_final)
            .with(store)
            .with(node.clone());

        let err = chain.resolve(&1).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Storage(_)));
        assert_eq!(*node.lookups.lock(), 0);
    }

    #[tokio::test]
    async fn empty_chain_is_a_configuration_error() {
        let chain: ProviderChain<u64, u64> = ProviderChain::new(Entity::Block, always_final);
        let err = chain.resolve(&1).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Configuration(_)));
    }

    #[tokio::test]
    async fn cache_tier_drops_fill_after_concurrent_write() {
        let cache = Arc::new(ChainCache::new(CacheConfig::default()));
        let provider = CacheProvider::new(Arc::clone(&cache));
        let hash = B256::repeat_byte(0x01);

        let ticket = Provider::<B256, Arc<StoredTransaction>>::fill_ticket(&provider);
        let stale = Arc::new(crate::store::tests::make_test_transaction(hash, Some((1, 0))));
        let fresh = Arc::new(crate::store::tests::make_test_transaction(hash, Some((1, 0))));
        cache.transactions.insert(hash, Arc::clone(&fresh));

        Provider::<B256, Arc<StoredTransaction>>::fill(&provider, &hash, &stale, ticket).unwrap();
        let cached = cache.transactions.get(&hash).unwrap();
        assert!(Arc::ptr_eq(&cached, &fresh));
    }
}
