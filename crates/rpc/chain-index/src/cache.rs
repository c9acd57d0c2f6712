//! In-memory ring caches for recent chain data.
//!
//! Blocks and transactions are queried with strong temporal locality, so each
//! entity kind gets a fixed-capacity ring: inserting into a full ring evicts
//! the least recently inserted entry and lookups never change the order.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use alloy_primitives::B256;
use lru::LruCache;
use parking_lot::RwLock;

use crate::types::{StoredBlock, StoredTransaction};

/// Default number of blocks to cache.
const DEFAULT_BLOCK_CACHE_SIZE: usize = 1024;
/// Default number of transactions to cache.
const DEFAULT_TX_CACHE_SIZE: usize = 8192;

/// Version stamp taken before a lower tier is consulted.
///
/// A fill carrying a stamp older than the last write to the ring is dropped,
/// so a slow reader can never put back a value a writer already replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTicket(u64);

struct Ring<K: Hash + Eq, V> {
    entries: LruCache<K, V>,
    writes: u64,
}

impl<K: Hash + Eq, V> Ring<K, V> {
    // lookups only ever `peek`, so the LRU order is the insertion order
    fn put(&mut self, key: K, value: V) {
        if let Some(slot) = self.entries.peek_mut(&key) {
            *slot = value;
            return;
        }
        self.entries.push(key, value);
    }
}

/// Fixed-capacity cache with insertion-order eviction.
///
/// Replacing an existing key keeps its slot. All methods take `&self`.
pub struct RingCache<K: Hash + Eq, V> {
    inner: RwLock<Ring<K, V>>,
}

impl<K: Hash + Eq, V: Clone> RingCache<K, V> {
    /// Create a ring holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: RwLock::new(Ring {
                entries: LruCache::new(capacity),
                writes: 0,
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().entries.peek(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.read().entries.contains(key)
    }

    /// Insert or replace an entry on behalf of a writer.
    pub fn insert(&self, key: K, value: V) {
        let mut ring = self.inner.write();
        ring.writes += 1;
        ring.put(key, value);
    }

    /// Drop an entry on behalf of a writer.
    pub fn invalidate(&self, key: &K) {
        let mut ring = self.inner.write();
        ring.writes += 1;
        ring.entries.pop(key);
    }

    /// Stamp the current write version before reading a lower tier.
    pub fn fill_ticket(&self) -> FillTicket {
        FillTicket(self.inner.read().writes)
    }

    /// Insert a value read from a lower tier, unless a write happened since
    /// the ticket was taken. Returns whether the value was inserted.
    pub fn fill(&self, ticket: FillTicket, key: K, value: V) -> bool {
        let mut ring = self.inner.write();
        if ring.writes != ticket.0 {
            return false;
        }
        ring.put(key, value);
        true
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.read().entries.cap().get()
    }

    pub fn clear(&self) {
        let mut ring = self.inner.write();
        ring.writes += 1;
        ring.entries.clear();
    }
}

/// Configuration for the chain cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of blocks to cache.
    pub block_capacity: usize,
    /// Number of transactions to cache.
    pub transaction_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            block_capacity: DEFAULT_BLOCK_CACHE_SIZE,
            transaction_capacity: DEFAULT_TX_CACHE_SIZE,
        }
    }
}

/// Per-entity ring caches used by the repository.
pub struct ChainCache {
    /// Blocks by number.
    pub blocks: RingCache<u64, Arc<StoredBlock>>,
    /// Block number by hash.
    pub block_numbers: RingCache<B256, u64>,
    /// Final transactions by hash.
    pub transactions: RingCache<B256, Arc<StoredTransaction>>,
}

impl ChainCache {
    /// Create a cache with the given configuration.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            blocks: RingCache::new(config.block_capacity),
            block_numbers: RingCache::new(config.block_capacity),
            transactions: RingCache::new(config.transaction_capacity),
        }
    }

    /// Create a cache with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(CacheConfig::default())
    }

    /// Get a block by hash through the hash index.
    pub fn block_by_hash(&self, hash: B256) -> Option<Arc<StoredBlock>> {
        let number = self.block_numbers.get(&hash)?;
        self.blocks
            .get(&number)
            .filter(|block| block.hash == hash)
    }

    /// Insert a block under both of its keys.
    pub fn insert_block(&self, block: Arc<StoredBlock>) {
        self.block_numbers.insert(block.hash, block.number);
        self.blocks.insert(block.number, block);
    }

    /// Clear all cached data.
    pub fn clear(&self) {
        self.blocks.clear();
        self.block_numbers.clear();
        self.transactions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_test_block(number: u64) -> StoredBlock {
        StoredBlock {
            number,
            hash: B256::from([number as u8; 32]),
            parent_hash: B256::from([(number.saturating_sub(1)) as u8; 32]),
            timestamp: 1000 + number,
            gas_limit: 30_000_000,
            gas_used: 21000 * number,
            transactions: vec![],
        }
    }

    #[test]
    fn test_ring_evicts_oldest_insert() {
        let ring = RingCache::new(3);
        for i in 0..3u64 {
            ring.insert(i, i * 10);
        }
        // reads never promote
        assert_eq!(ring.get(&0), Some(0));

        ring.insert(3, 30);
        assert_eq!(ring.get(&0), None);
        assert_eq!(ring.get(&1), Some(10));
        assert_eq!(ring.get(&3), Some(30));
        assert_eq!(ring.len(), 3);
    }

    #[test]
    fn test_replace_keeps_slot() {
        let ring = RingCache::new(2);
        ring.insert("a", 1);
        ring.insert("b", 2);
        ring.insert("a", 3);
        assert_eq!(ring.get(&"a"), Some(3));

        ring.insert("c", 4);
        assert_eq!(ring.get(&"a"), None);
        assert_eq!(ring.get(&"b"), Some(2));
    }

    #[test]
    fn test_zero_capacity_holds_one_entry() {
        let ring = RingCache::new(0);
        ring.insert(1u8, 1u8);
        ring.insert(2u8, 2u8);
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.get(&2), Some(2));
        assert_eq!(ring.get(&1), None);
    }

    #[test]
    fn test_stale_fill_is_dropped() {
        let ring = RingCache::new(4);
        let ticket = ring.fill_ticket();

        // a writer lands between the reader's ticket and its fill
        ring.insert(1u64, "new");
        assert!(!ring.fill(ticket, 1u64, "old"));
        assert_eq!(ring.get(&1), Some("new"));

        let ticket = ring.fill_ticket();
        assert!(ring.fill(ticket, 2u64, "fresh"));
        assert_eq!(ring.get(&2), Some("fresh"));
    }

    #[test]
    fn test_invalidate_removes_entry_and_slot() {
        let ring = RingCache::new(2);
        ring.insert(1u64, 1u64);
        ring.insert(2u64, 2u64);
        ring.invalidate(&1);
        assert!(!ring.contains(&1));

        ring.insert(3u64, 3u64);
        assert_eq!(ring.get(&2), Some(2));
        assert_eq!(ring.get(&3), Some(3));
    }

    #[test]
    fn test_invalidate_middle_keeps_insertion_order() {
        let ring = RingCache::new(3);
        for i in 1..=3u64 {
            ring.insert(i, i);
        }
        ring.invalidate(&2);
        assert_eq!(ring.len(), 2);

        // 1 is still the oldest entry and goes first
        ring.insert(4u64, 4u64);
        ring.insert(5u64, 5u64);
        assert!(!ring.contains(&1));
        assert_eq!(ring.get(&3), Some(3));
        assert_eq!(ring.get(&4), Some(4));
        assert_eq!(ring.get(&5), Some(5));
    }

    #[test]
    fn test_block_cache_by_number_and_hash() {
        let cache = ChainCache::with_defaults();

        let block = make_test_block(1);
        let hash = block.hash;
        cache.insert_block(Arc::new(block));

        assert_eq!(cache.blocks.get(&1).map(|b| b.number), Some(1));
        assert_eq!(cache.block_by_hash(hash).map(|b| b.number), Some(1));
        assert!(cache.block_by_hash(B256::repeat_byte(0xee)).is_none());
    }

    #[test]
    fn test_cache_eviction_across_blocks() {
        let cache = ChainCache::new(CacheConfig {
            block_capacity: 2,
            transaction_capacity: 2,
        });

        for i in 1..=3 {
            cache.insert_block(Arc::new(make_test_block(i)));
        }

        assert!(cache.blocks.get(&1).is_none());
        assert!(cache.blocks.get(&2).is_some());
        assert!(cache.blocks.get(&3).is_some());
    }

    #[test]
    fn test_concurrent_inserts_stay_bounded() {
        let ring = Arc::new(RingCache::new(64));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let ring = Arc::clone(&ring);
                std::thread::spawn(move || {
                    for i in 0..500u64 {
                        ring.insert(t * 1000 + i, i);
                        let _ = ring.get(&(t * 1000));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ring.len(), 64);
    }
}
