//! Single-flight collapsing of concurrent identical reads.
//!
//! Callers asking for the same [`LiveQuery`] while a call for it is in flight
//! share that call's result. Once the call completes its result is dropped;
//! the next caller starts a fresh upstream call.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use alloy_primitives::{Address, FixedBytes, U256};
use parking_lot::Mutex;
use tokio::sync::OnceCell;

/// Typed identity of a live node read.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LiveQuery {
    Balance(Address),
    Nonce(Address),
    BlockHeight,
    GasPrice,
    Erc20BalanceOf {
        token: Address,
        owner: Address,
    },
    Erc20Allowance {
        token: Address,
        owner: Address,
        spender: Address,
    },
    Erc20TotalSupply(Address),
    Erc721Name(Address),
    Erc721Symbol(Address),
    Erc721TotalSupply(Address),
    Erc721BalanceOf {
        token: Address,
        owner: Address,
    },
    Erc721OwnerOf {
        token: Address,
        token_id: U256,
    },
    Erc721TokenUri {
        token: Address,
        token_id: U256,
    },
    Erc721GetApproved {
        token: Address,
        token_id: U256,
    },
    Erc721IsApprovedForAll {
        token: Address,
        owner: Address,
        operator: Address,
    },
    Erc1155Uri {
        token: Address,
        token_id: U256,
    },
    Erc1155BalanceOf {
        token: Address,
        owner: Address,
        token_id: U256,
    },
    Erc1155BalanceOfBatch {
        token: Address,
        owners: Vec<Address>,
        token_ids: Vec<U256>,
    },
    Erc1155IsApprovedForAll {
        token: Address,
        owner: Address,
        operator: Address,
    },
    Erc165SupportsInterface {
        contract: Address,
        interface_id: FixedBytes<4>,
    },
}

/// Deduplicates concurrent calls per key.
pub struct RequestCollapser<K, V> {
    inflight: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for RequestCollapser<K, V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Hash + Eq + Clone, V: Clone> RequestCollapser<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `call` unless a call for `key` is already in flight, in which case
    /// wait for that one and return its result.
    ///
    /// If the caller driving the call is cancelled, one of the waiters takes
    /// over with its own `call`.
    pub async fn run<F, Fut>(&self, key: K, call: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(cell) if !cell.initialized() => Arc::clone(cell),
                _ => {
                    let cell = Arc::new(OnceCell::new());
                    inflight.insert(key.clone(), Arc::clone(&cell));
                    cell
                }
            }
        };

        let value = cell.get_or_init(call).await.clone();

        let mut inflight = self.inflight.lock();
        if inflight
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &cell))
        {
            inflight.remove(&key);
        }
        value
    }

    /// Number of keys with a call in flight.
    pub fn inflight(&self) -> usize {
        self.inflight.lock().len()
    }
}
