//! Configuration types for the API server.

use std::time::Duration;

use opera_chain_index::{CacheConfig, ListLimits, RepositoryConfig};
use serde::Deserialize;

/// Root configuration for the API server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    /// Upstream chain node.
    pub node: NodeConfig,

    /// Persistent store.
    pub store: StoreConfig,

    /// Ring cache sizes.
    #[serde(default)]
    pub cache: CacheSection,

    /// Page size caps per list type.
    #[serde(default)]
    pub lists: ListsConfig,

    /// Block and log ingestion.
    #[serde(default)]
    pub indexer: IndexerConfig,

    /// Operations configuration.
    #[serde(default)]
    pub operations: OperationsConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl ApiConfig {
    /// Repository settings derived from the cache and list sections.
    pub fn to_repository_config(&self) -> RepositoryConfig {
        RepositoryConfig {
            cache: self.cache.to_cache_config(),
            limits: self.lists.to_list_limits(),
        }
    }
}

/// Chain node connection.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    /// JSON-RPC endpoint, `http://` or `https://`.
    pub url: String,

    /// Per request timeout in milliseconds. Default: 5000.
    #[serde(default = "NodeConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl NodeConfig {
    const fn default_request_timeout_ms() -> u64 {
        5_000
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// SQLite store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// Path to the database file.
    pub path: String,

    /// Number of pooled read connections. Default: 4.
    #[serde(default = "StoreConfig::default_read_pool_size")]
    pub read_pool_size: u32,
}

impl StoreConfig {
    const fn default_read_pool_size() -> u32 {
        4
    }
}

/// Ring cache capacities.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    #[serde(default = "CacheSection::default_block_capacity")]
    pub block_capacity: usize,

    #[serde(default = "CacheSection::default_transaction_capacity")]
    pub transaction_capacity: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            block_capacity: Self::default_block_capacity(),
            transaction_capacity: Self::default_transaction_capacity(),
        }
    }
}

impl CacheSection {
    const fn default_block_capacity() -> usize {
        1024
    }

    const fn default_transaction_capacity() -> usize {
        8192
    }

    pub fn to_cache_config(&self) -> CacheConfig {
        CacheConfig {
            block_capacity: self.block_capacity,
            transaction_capacity: self.transaction_capacity,
        }
    }
}

/// Largest page each list query may return.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListsConfig {
    #[serde(default = "ListsConfig::default_max")]
    pub max_transactions: u32,

    #[serde(default = "ListsConfig::default_max")]
    pub max_blocks: u32,

    #[serde(default = "ListsConfig::default_max")]
    pub max_contracts: u32,

    #[serde(default = "ListsConfig::default_max")]
    pub max_token_transactions: u32,
}

impl Default for ListsConfig {
    fn default() -> Self {
        Self {
            max_transactions: Self::default_max(),
            max_blocks: Self::default_max(),
            max_contracts: Self::default_max(),
            max_token_transactions: Self::default_max(),
        }
    }
}

impl ListsConfig {
    const fn default_max() -> u32 {
        250
    }

    pub fn to_list_limits(&self) -> ListLimits {
        ListLimits {
            transactions: self.max_transactions,
            blocks: self.max_blocks,
            contracts: self.max_contracts,
            token_transactions: self.max_token_transactions,
        }
    }
}

/// Block and log ingestion.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IndexerConfig {
    /// Run the block observer and dispatchers. Default: true.
    #[serde(default = "IndexerConfig::default_enabled")]
    pub enabled: bool,

    /// Interval between block height polls in milliseconds. Default: 1000.
    #[serde(default = "IndexerConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Capacity of the block and log queues. Default: 1024.
    #[serde(default = "IndexerConfig::default_log_queue_capacity")]
    pub log_queue_capacity: usize,

    /// First block to ingest when the store has no resume point.
    #[serde(default)]
    pub start_block: Option<u64>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            log_queue_capacity: Self::default_log_queue_capacity(),
            start_block: None,
        }
    }
}

impl IndexerConfig {
    const fn default_enabled() -> bool {
        true
    }

    const fn default_poll_interval_ms() -> u64 {
        1_000
    }

    const fn default_log_queue_capacity() -> usize {
        1024
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Operations configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OperationsConfig {
    /// Graceful shutdown timeout in seconds. Default: 30.
    #[serde(default = "OperationsConfig::default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Check the store location before opening it. Default: true.
    #[serde(default = "OperationsConfig::default_startup_checks")]
    pub startup_checks: bool,
}

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: Self::default_shutdown_timeout_secs(),
            startup_checks: Self::default_startup_checks(),
        }
    }
}

impl OperationsConfig {
    const fn default_shutdown_timeout_secs() -> u64 {
        30
    }

    const fn default_startup_checks() -> bool {
        true
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ObservabilityConfig {
    /// Log level: trace, debug, info, warn, error. Default: "info".
    #[serde(default = "ObservabilityConfig::default_log_level")]
    pub log_level: String,

    /// Log format: json or pretty. Default: "json".
    #[serde(default = "ObservabilityConfig::default_log_format")]
    pub log_format: String,

    /// Collect Prometheus metrics. Default: true.
    #[serde(default = "ObservabilityConfig::default_metrics_enabled")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            log_format: Self::default_log_format(),
            metrics_enabled: Self::default_metrics_enabled(),
        }
    }
}

impl ObservabilityConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_log_format() -> String {
        "json".to_string()
    }

    const fn default_metrics_enabled() -> bool {
        true
    }
}
