//! Data layer of the Opera API server.
//!
//! The [`Repository`] is the single entry point for chain data. It combines
//! three tiers of decreasing speed and increasing authority:
//!
//! - Fixed-capacity ring caches of recent blocks and transactions
//! - The persistent store (SQLite) holding canonical, durable records
//! - The chain node (JSON-RPC) for live state and not yet stored data
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │             Query layer / ingestion services        │
//! └───────────────────────┬─────────────────────────────┘
//!                         │
//!           ┌─────────────▼─────────────┐
//!           │        Repository         │
//!           │ provider chains, collapser│
//!           └─────────────┬─────────────┘
//!                         │
//!         ┌───────────────┼───────────────┐
//!         │               │               │
//!         ▼               ▼               ▼
//! ┌───────────────┐ ┌───────────┐ ┌───────────────┐
//! │  ChainCache   │ │   Store   │ │  NodeClient   │
//! │ (ring caches) │ │ (SQLite)  │ │  (JSON-RPC)   │
//! └───────────────┘ └───────────┘ └───────────────┘
//! ```
//!
//! Sequential lists (blocks, transactions, token transactions, contracts)
//! are paged with opaque cursors, see [`cursor`].

pub mod cache;
pub mod collapser;
pub mod cursor;
pub mod error;
pub mod mock;
pub mod node;
pub mod provider;
pub mod repository;
pub mod store;
pub mod types;

pub use cache::{CacheConfig, ChainCache, RingCache};
pub use collapser::{LiveQuery, RequestCollapser};
pub use cursor::{paginate, Cursor, Edge, OrderedList, Ordinal, Page, PageInfo};
pub use error::{Entity, RepositoryError, RepositoryResult};
pub use node::{JsonRpcNodeClient, NodeClient};
pub use repository::{ListLimits, Repository, RepositoryConfig};
pub use store::{
    ListKey, ListQuery, PersistentStore, SqliteStore, TokenContractsQuery, TokenTransactionFilter,
    WriteOutcome,
};
pub use types::*;
