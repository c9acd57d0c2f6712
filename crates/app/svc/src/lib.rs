//! Block and log ingestion services.
//!
//! Three long-running services connected by bounded channels:
//!
//! ```text
//! BlockObserver --u64--> BlockDispatcher --LogRecord--> LogDispatcher
//!  (head polling)        (blocks, txs, accounts)        (token transactions)
//! ```
//!
//! A block is recorded as the last known block only after every one of its
//! log records was acknowledged, see [`work`].

pub mod blocks;
pub mod dispatcher;
pub mod observer;
pub mod topics;
pub mod work;

use std::sync::Arc;

use opera_chain_index::Repository;
use opera_operations::config::IndexerConfig;
use opera_operations::{IndexerMetrics, ServiceError, ServiceManager};
use tokio::sync::mpsc;

pub use blocks::BlockDispatcher;
pub use dispatcher::{Disposition, LogDispatcher, LogRecord};
pub use observer::BlockObserver;
pub use topics::{LogContext, LogHandler, TopicTable, TopicTableBuilder};
pub use work::{BlockWork, PendingTicket, WorkOutcome};

/// Build the ingestion pipeline and register its services with `manager`.
///
/// Services are registered downstream first, so closing the manager stops
/// the observer before the dispatchers it feeds.
pub fn register_ingestion(
    manager: &ServiceManager,
    repo: Arc<Repository>,
    metrics: Arc<IndexerMetrics>,
    table: TopicTable,
    config: &IndexerConfig,
) -> Result<(), ServiceError> {
    let capacity = config.log_queue_capacity.max(1);
    let (block_tx, block_rx) = mpsc::channel(capacity);
    let (log_tx, log_rx) = mpsc::channel(capacity);

    manager.register(Arc::new(LogDispatcher::new(
        repo.clone(),
        table,
        metrics.clone(),
        log_rx,
    )))?;
    manager.register(Arc::new(BlockDispatcher::new(
        repo.clone(),
        metrics,
        block_rx,
        log_tx,
    )))?;
    manager.register(Arc::new(BlockObserver::new(
        repo,
        block_tx,
        config.poll_interval(),
        config.start_block,
    )))?;

    tracing::info!(
        queue_capacity = capacity,
        poll_interval_ms = config.poll_interval_ms,
        "ingestion services registered"
    );
    Ok(())
}
