//! Block dispatcher: stores a block with its transactions and accounts, then
//! feeds its log records to the log dispatcher and waits for all of them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use alloy_primitives::B256;
use async_trait::async_trait;
use opera_chain_index::{Account, Contract, Repository, RepositoryResult, StoredTransaction};
use opera_operations::{IndexerMetrics, Service, ServiceBase, StopSignal};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::dispatcher::LogRecord;
use crate::work::{BlockWork, WorkOutcome};

const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_secs(60);
/// Failed attempts at one block after which failures are logged as errors.
const ESCALATE_AFTER_ATTEMPTS: u32 = 5;

/// Delay before retry `attempt` (1-based): doubles from `base` up to `max`.
fn retry_backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// How processing of one block ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockProgress {
    /// Every log record was acknowledged and the block is recorded.
    Done,
    /// Processing stopped before the block was complete.
    Interrupted,
}

pub struct BlockDispatcher {
    base: ServiceBase,
    repo: Arc<Repository>,
    metrics: Arc<IndexerMetrics>,
    logs: mpsc::Sender<LogRecord>,
    input: Mutex<Option<mpsc::Receiver<u64>>>,
    retry_delay: Duration,
    max_retry_delay: Duration,
}

impl BlockDispatcher {
    pub fn new(
        repo: Arc<Repository>,
        metrics: Arc<IndexerMetrics>,
        input: mpsc::Receiver<u64>,
        logs: mpsc::Sender<LogRecord>,
    ) -> Self {
        Self {
            base: ServiceBase::new(),
            repo,
            metrics,
            logs,
            input: Mutex::new(Some(input)),
            retry_delay: DEFAULT_RETRY_DELAY,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
        }
    }

    /// Delay before the first retry of a failed block.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Cap of the doubling retry delay.
    pub fn with_max_retry_delay(mut self, delay: Duration) -> Self {
        self.max_retry_delay = delay;
        self
    }

    async fn execute(self: Arc<Self>, mut input: mpsc::Receiver<u64>) {
        let mut stop = self.base.stop_signal();
        loop {
            let number = tokio::select! {
                biased;
                _ = stop.stopped() => return,
                number = input.recv() => match number {
                    Some(number) => number,
                    None => {
                        tracing::info!("block channel closed, terminating block dispatcher");
                        return;
                    }
                },
            };

            // a block is retried until it completes, later blocks wait for it
            let mut attempt = 0u32;
            loop {
                match self.process_block(number, &mut stop).await {
                    Ok(BlockProgress::Done) => break,
                    Ok(BlockProgress::Interrupted) => return,
                    Err(e) => {
                        attempt = attempt.saturating_add(1);
                        let delay = retry_backoff(self.retry_delay, self.max_retry_delay, attempt);
                        if attempt >= ESCALATE_AFTER_ATTEMPTS {
                            tracing::error!(
                                block = number,
                                attempt,
                                retry_in_ms = delay.as_millis() as u64,
                                error = %e,
                                "block keeps failing, ingestion is stalled"
                            );
                        } else {
                            tracing::warn!(
                                block = number,
                                attempt,
                                retry_in_ms = delay.as_millis() as u64,
                                error = %e,
                                "failed to process block"
                            );
                        }
                        tokio::select! {
                            biased;
                            _ = stop.stopped() => return,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }

    async fn process_block(
        &self,
        number: u64,
        stop: &mut StopSignal,
    ) -> RepositoryResult<BlockProgress> {
        let started = Instant::now();
        let block = self.repo.block_by_number(Some(number)).await?;
        self.repo.store_block(&block)?;

        let mut transactions: HashMap<B256, Arc<StoredTransaction>> =
            HashMap::with_capacity(block.transactions.len());
        for hash in &block.transactions {
            let tx = self.repo.transaction(*hash).await?;
            self.store_transaction(&tx, number)?;
            transactions.insert(*hash, tx);
        }

        let logs = self.repo.block_logs(block.hash).await?;
        let (work, tickets) = BlockWork::new(number, logs.len());
        tracing::debug!(
            block = number,
            transactions = transactions.len(),
            logs = logs.len(),
            "dispatching block logs"
        );

        for (log, ticket) in logs.into_iter().zip(tickets) {
            let record = LogRecord {
                transaction: transactions.get(&log.transaction_hash).cloned(),
                block: Some(Arc::clone(&block)),
                log,
                ticket,
            };
            tokio::select! {
                biased;
                _ = stop.stopped() => return Ok(BlockProgress::Interrupted),
                sent = self.logs.send(record) => {
                    if sent.is_err() {
                        tracing::info!(block = number, "log channel closed");
                        return Ok(BlockProgress::Interrupted);
                    }
                }
            }
        }

        let outcome = tokio::select! {
            biased;
            _ = stop.stopped() => return Ok(BlockProgress::Interrupted),
            outcome = work.wait() => outcome,
        };
        if outcome == WorkOutcome::Abandoned {
            tracing::warn!(block = number, "log records of block were dropped");
            return Ok(BlockProgress::Interrupted);
        }

        self.repo.update_last_known_block(number)?;
        self.metrics
            .record_block(number, started.elapsed().as_secs_f64());
        tracing::info!(block = number, "block processed");
        Ok(BlockProgress::Done)
    }

    /// Store a transaction and the accounts and contract it touches.
    fn store_transaction(&self, tx: &StoredTransaction, block: u64) -> RepositoryResult<()> {
        self.repo.store_transaction(tx)?;

        self.touch_account(&Account::wallet(tx.from), block)?;
        if let Some(to) = tx.to {
            self.touch_account(&Account::wallet(to), block)?;
        }

        if let Some(address) = tx.contract_address {
            self.touch_account(&Account::contract(address, tx.hash), block)?;
            match self.repo.contract(address) {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    if let Some(contract) = Contract::deployed(address, tx) {
                        self.repo.store_contract(&contract)?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn touch_account(&self, account: &Account, block: u64) -> RepositoryResult<()> {
        self.repo.store_account(account)?;
        self.repo.account_mark_activity(account.address, block)?;
        Ok(())
    }
}

#[async_trait]
impl Service for BlockDispatcher {
    fn name(&self) -> &str {
        "block dispatcher"
    }

    fn base(&self) -> &ServiceBase {
        &self.base
    }

    fn run(self: Arc<Self>) {
        let Some(input) = self.input.lock().take() else {
            tracing::warn!("block dispatcher already ran");
            return;
        };
        let this = Arc::clone(&self);
        self.base.launch(self.name(), this.execute(input));
    }
}
