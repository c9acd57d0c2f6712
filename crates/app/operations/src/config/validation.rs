//! Configuration validation.
//!
//! Validates configuration and collects all errors before returning,
//! enabling users to fix multiple issues in a single iteration.

use crate::config::types::{
    ApiConfig, CacheSection, IndexerConfig, ListsConfig, NodeConfig, ObservabilityConfig,
    OperationsConfig, StoreConfig,
};
use crate::errors::ConfigError;

const MIN_REQUEST_TIMEOUT_MS: u64 = 100;
const MAX_REQUEST_TIMEOUT_MS: u64 = 120_000;

const MIN_READ_POOL_SIZE: u32 = 1;
const MAX_READ_POOL_SIZE: u32 = 64;

const MAX_CACHE_CAPACITY: usize = 1_000_000;

const MAX_LIST_LIMIT: u32 = 1000;

const MIN_POLL_INTERVAL_MS: u64 = 100;
const MAX_POLL_INTERVAL_MS: u64 = 60_000;

/// Minimum shutdown timeout: 1 second.
const MIN_SHUTDOWN_TIMEOUT: u64 = 1;
/// Maximum shutdown timeout: 300 seconds (5 minutes).
const MAX_SHUTDOWN_TIMEOUT: u64 = 300;

/// Validate the entire API server configuration.
///
/// Collects all validation errors and returns them together, allowing users
/// to fix multiple issues at once.
pub fn validate_config(config: &ApiConfig) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    validate_node_config(&config.node, &mut errors);
    validate_store_config(&config.store, &mut errors);
    validate_cache_config(&config.cache, &mut errors);
    validate_lists_config(&config.lists, &mut errors);
    validate_indexer_config(&config.indexer, &mut errors);
    validate_operations_config(&config.operations, &mut errors);
    validate_observability_config(&config.observability, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationFailed(errors))
    }
}

fn validate_node_config(config: &NodeConfig, errors: &mut Vec<String>) {
    if config.url.is_empty() {
        errors.push("node.url cannot be empty".to_string());
    } else if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
        errors.push(format!(
            "node.url '{}' must use the http:// or https:// scheme",
            config.url
        ));
    }

    if !(MIN_REQUEST_TIMEOUT_MS..=MAX_REQUEST_TIMEOUT_MS).contains(&config.request_timeout_ms) {
        errors.push(format!(
            "node.request_timeout_ms must be between {} and {}",
            MIN_REQUEST_TIMEOUT_MS, MAX_REQUEST_TIMEOUT_MS
        ));
    }
}

fn validate_store_config(config: &StoreConfig, errors: &mut Vec<String>) {
    if config.path.is_empty() {
        errors.push("store.path cannot be empty".to_string());
    }

    if !(MIN_READ_POOL_SIZE..=MAX_READ_POOL_SIZE).contains(&config.read_pool_size) {
        errors.push(format!(
            "store.read_pool_size must be between {} and {}",
            MIN_READ_POOL_SIZE, MAX_READ_POOL_SIZE
        ));
    }
}

fn validate_cache_config(config: &CacheSection, errors: &mut Vec<String>) {
    for (name, value) in [
        ("block_capacity", config.block_capacity),
        ("transaction_capacity", config.transaction_capacity),
    ] {
        if !(1..=MAX_CACHE_CAPACITY).contains(&value) {
            errors.push(format!(
                "cache.{} must be between 1 and {}",
                name, MAX_CACHE_CAPACITY
            ));
        }
    }
}

fn validate_lists_config(config: &ListsConfig, errors: &mut Vec<String>) {
    for (name, value) in [
        ("max_transactions", config.max_transactions),
        ("max_blocks", config.max_blocks),
        ("max_contracts", config.max_contracts),
        ("max_token_transactions", config.max_token_transactions),
    ] {
        if !(1..=MAX_LIST_LIMIT).contains(&value) {
            errors.push(format!(
                "lists.{} must be between 1 and {}",
                name, MAX_LIST_LIMIT
            ));
        }
    }
}

fn validate_indexer_config(config: &IndexerConfig, errors: &mut Vec<String>) {
    if !(MIN_POLL_INTERVAL_MS..=MAX_POLL_INTERVAL_MS).contains(&config.poll_interval_ms) {
        errors.push(format!(
            "indexer.poll_interval_ms must be between {} and {}",
            MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS
        ));
    }

    if config.log_queue_capacity == 0 {
        errors.push("indexer.log_queue_capacity must be at least 1".to_string());
    }
}

fn validate_operations_config(config: &OperationsConfig, errors: &mut Vec<String>) {
    if config.shutdown_timeout_secs < MIN_SHUTDOWN_TIMEOUT {
        errors.push(format!(
            "operations.shutdown_timeout_secs must be at least {} second(s)",
            MIN_SHUTDOWN_TIMEOUT
        ));
    }

    if config.shutdown_timeout_secs > MAX_SHUTDOWN_TIMEOUT {
        errors.push(format!(
            "operations.shutdown_timeout_secs must be at most {} seconds",
            MAX_SHUTDOWN_TIMEOUT
        ));
    }
}

fn validate_observability_config(config: &ObservabilityConfig, errors: &mut Vec<String>) {
    let valid_levels = [
        "trace", "debug", "info", "warn", "warning", "error", "critical", "crit",
    ];
    if !valid_levels.contains(&config.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "observability.log_level '{}' is invalid. Valid levels: trace, debug, info, warn, error, critical",
            config.log_level
        ));
    }

    let valid_formats = ["json", "pretty", "text", "human"];
    if !valid_formats.contains(&config.log_format.to_lowercase().as_str()) {
        errors.push(format!(
            "observability.log_format '{}' is invalid. Valid formats: json, pretty",
            config.log_format
        ));
    }
}
