//! Prometheus-compatible metrics collection.
//!
//! This module provides a metrics registry for tracking ingestion progress
//! and exporting to Prometheus format.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

/// Block and log ingestion metrics.
pub struct IndexerMetrics {
    /// Total blocks fully processed.
    pub blocks_processed: Counter,
    /// Log records received by the log dispatcher.
    pub logs_received: Counter,
    /// Log records acknowledged without a handler or context.
    pub logs_ignored: Counter,
    /// Log records whose decode or store failed.
    pub logs_failed: Counter,
    /// Token transactions written to the store.
    pub token_transactions_stored: Counter,
    /// Last block recorded as fully processed.
    pub last_known_block: Gauge,
    /// Time to process one block in seconds.
    pub block_duration_seconds: Histogram,
}

impl Default for IndexerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexerMetrics {
    pub fn new() -> Self {
        // 1ms to ~16s
        let duration_buckets = exponential_buckets(0.001, 2.0, 15);

        Self {
            blocks_processed: Counter::default(),
            logs_received: Counter::default(),
            logs_ignored: Counter::default(),
            logs_failed: Counter::default(),
            token_transactions_stored: Counter::default(),
            last_known_block: Gauge::<i64, AtomicI64>::default(),
            block_duration_seconds: Histogram::new(duration_buckets),
        }
    }

    /// Record a block whose logs have all been acknowledged.
    pub fn record_block(&self, number: u64, duration_secs: f64) {
        self.blocks_processed.inc();
        self.last_known_block.set(number as i64);
        self.block_duration_seconds.observe(duration_secs);
    }
}

/// Central metrics registry for the API server.
pub struct MetricsRegistry {
    registry: Registry,
    /// Ingestion metrics, shared with the services recording them.
    pub indexer: Arc<IndexerMetrics>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let indexer = Arc::new(IndexerMetrics::new());

        registry.register(
            "opera_blocks_processed",
            "Total number of blocks fully processed",
            indexer.blocks_processed.clone(),
        );
        registry.register(
            "opera_logs_received",
            "Total number of log records received",
            indexer.logs_received.clone(),
        );
        registry.register(
            "opera_logs_ignored",
            "Log records acknowledged without storage",
            indexer.logs_ignored.clone(),
        );
        registry.register(
            "opera_logs_failed",
            "Log records that failed to decode or store",
            indexer.logs_failed.clone(),
        );
        registry.register(
            "opera_token_transactions_stored",
            "Token transactions written to the store",
            indexer.token_transactions_stored.clone(),
        );
        registry.register(
            "opera_last_known_block",
            "Last block recorded as fully processed",
            indexer.last_known_block.clone(),
        );
        registry.register(
            "opera_block_duration_seconds",
            "Block processing duration in seconds",
            indexer.block_duration_seconds.clone(),
        );

        Self { registry, indexer }
    }

    /// Encode all metrics in Prometheus text format.
    pub fn encode_prometheus(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            return String::from("# Error encoding metrics\n");
        }
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry_creation() {
        let registry = MetricsRegistry::new();
        let encoded = registry.encode_prometheus();

        assert!(encoded.contains("opera_blocks_processed"));
        assert!(encoded.contains("opera_logs_ignored"));
        assert!(encoded.contains("opera_last_known_block"));
    }

    #[test]
    fn test_record_block() {
        let registry = MetricsRegistry::new();
        registry.indexer.record_block(4_200_117, 0.02);
        registry.indexer.logs_received.inc_by(5);

        assert_eq!(registry.indexer.blocks_processed.get(), 1);
        assert_eq!(registry.indexer.last_known_block.get(), 4_200_117);

        let encoded = registry.encode_prometheus();
        assert!(encoded.contains("4200117"));
        assert!(encoded.contains("opera_logs_received_total 5"));
    }
}
