//! Log dispatcher: classifies log records and stores token transactions.
//!
//! Every record pulled off the input channel moves through
//! `received -> classified -> handled | ignored -> acknowledged`. Failures
//! while decoding or storing are logged and the record is still
//! acknowledged, so a single bad log never stalls its block.

use std::sync::Arc;

use async_trait::async_trait;
use opera_chain_index::{RawLog, Repository, StoredBlock, StoredTransaction};
use opera_operations::{IndexerMetrics, Service, ServiceBase};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::topics::{LogContext, TopicTable};
use crate::work::PendingTicket;

/// A log record queued for the dispatcher.
#[derive(Debug)]
pub struct LogRecord {
    pub log: RawLog,
    pub block: Option<Arc<StoredBlock>>,
    pub transaction: Option<Arc<StoredTransaction>>,
    pub ticket: PendingTicket,
}

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Decoded and stored this many token transactions.
    Handled(usize),
    /// Unknown topic or missing block/transaction context.
    Ignored,
    /// Decode or store failed.
    Failed,
}

pub struct LogDispatcher {
    base: ServiceBase,
    repo: Arc<Repository>,
    table: TopicTable,
    metrics: Arc<IndexerMetrics>,
    input: Mutex<Option<mpsc::Receiver<LogRecord>>>,
}

impl LogDispatcher {
    pub fn new(
        repo: Arc<Repository>,
        table: TopicTable,
        metrics: Arc<IndexerMetrics>,
        input: mpsc::Receiver<LogRecord>,
    ) -> Self {
        Self {
            base: ServiceBase::new(),
            repo,
            table,
            metrics,
            input: Mutex::new(Some(input)),
        }
    }

    /// Process one record and acknowledge it.
    pub fn dispatch(&self, record: LogRecord) -> Disposition {
        let LogRecord {
            log,
            block,
            transaction,
            ticket,
        } = record;
        self.metrics.logs_received.inc();

        let disposition = match (block.as_deref(), transaction.as_deref()) {
            (Some(block), Some(transaction)) => self.handle(&LogContext {
                log: &log,
                block,
                transaction,
            }),
            _ => {
                tracing::debug!(
                    tx = %log.transaction_hash,
                    log_index = log.log_index,
                    "log without block or transaction context"
                );
                Disposition::Ignored
            }
        };

        match disposition {
            Disposition::Handled(stored) => {
                self.metrics.token_transactions_stored.inc_by(stored as u64);
            }
            Disposition::Ignored => {
                self.metrics.logs_ignored.inc();
            }
            Disposition::Failed => {
                self.metrics.logs_failed.inc();
            }
        };

        ticket.ack();
        disposition
    }

    fn handle(&self, ctx: &LogContext<'_>) -> Disposition {
        let Some(handler) = ctx.log.topics.first().and_then(|t| self.table.handler(t)) else {
            return Disposition::Ignored;
        };

        let decoded = match handler.decode(ctx, &self.repo) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(
                    tx = %ctx.transaction.hash,
                    log_index = ctx.log.log_index,
                    error = %e,
                    "failed to decode token log"
                );
                return Disposition::Failed;
            }
        };

        let mut stored = 0;
        for ttx in &decoded {
            match self.repo.store_token_transaction(ttx) {
                Ok(outcome) if outcome.changed() => stored += 1,
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(
                        tx = %ttx.transaction_hash,
                        log_index = ttx.log_index,
                        position = ttx.position,
                        error = %e,
                        "failed to store token transaction"
                    );
                    return Disposition::Failed;
                }
            }
        }
        Disposition::Handled(stored)
    }

    async fn execute(self: Arc<Self>, mut input: mpsc::Receiver<LogRecord>) {
        let mut stop = self.base.stop_signal();
        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => {
                    // buffered records are dropped, their blocks end abandoned
                    tracing::debug!("log dispatcher stopping");
                    return;
                }
                record = input.recv() => match record {
                    Some(record) => {
                        self.dispatch(record);
                    }
                    None => {
                        tracing::info!("log channel closed, terminating log dispatcher");
                        return;
                    }
                },
            }
        }
    }
}

#[async_trait]
impl Service for LogDispatcher {
    fn name(&self) -> &str {
        "log dispatcher"
    }

    fn base(&self) -> &ServiceBase {
        &self.base
    }

    fn run(self: Arc<Self>) {
        let Some(input) = self.input.lock().take() else {
            tracing::warn!("log dispatcher already ran");
            return;
        };
        let this = Arc::clone(&self);
        self.base.launch(self.name(), this.execute(input));
    }
}
