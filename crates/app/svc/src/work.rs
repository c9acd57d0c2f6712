//! Per-block pending work.
//!
//! A block is fully processed once every one of its log records has been
//! acknowledged by the log dispatcher. [`BlockWork`] counts the records still
//! outstanding; each record carries a [`PendingTicket`] that releases exactly
//! one unit of that count when acknowledged or dropped.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// How a block's pending work ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// Every record was acknowledged.
    Completed,
    /// At least one record was dropped without acknowledgment.
    Abandoned,
}

/// Outstanding log records of one block.
#[derive(Debug)]
pub struct BlockWork {
    number: u64,
    pending: AtomicUsize,
    abandoned: AtomicBool,
    completions: AtomicUsize,
    done: Notify,
}

impl BlockWork {
    /// Create the counter for `records` log records and one ticket per record.
    pub fn new(number: u64, records: usize) -> (Arc<Self>, Vec<PendingTicket>) {
        let work = Arc::new(Self {
            number,
            pending: AtomicUsize::new(records),
            abandoned: AtomicBool::new(false),
            completions: AtomicUsize::new(usize::from(records == 0)),
            done: Notify::new(),
        });
        let tickets = (0..records)
            .map(|_| PendingTicket {
                work: Arc::clone(&work),
                acknowledged: false,
            })
            .collect();
        (work, tickets)
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_done(&self) -> bool {
        self.pending() == 0
    }

    /// Number of times the counter reached zero; never more than one.
    pub fn completions(&self) -> usize {
        self.completions.load(Ordering::Acquire)
    }

    /// Wait until no record is outstanding.
    pub async fn wait(&self) -> WorkOutcome {
        loop {
            let notified = self.done.notified();
            if self.is_done() {
                break;
            }
            notified.await;
        }
        if self.abandoned.load(Ordering::Acquire) {
            WorkOutcome::Abandoned
        } else {
            WorkOutcome::Completed
        }
    }

    fn release(&self, acknowledged: bool) {
        if !acknowledged {
            self.abandoned.store(true, Ordering::Release);
        }
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.completions.fetch_add(1, Ordering::AcqRel);
            self.done.notify_waiters();
        }
    }
}

/// One unit of a block's pending work, released exactly once.
#[derive(Debug)]
pub struct PendingTicket {
    work: Arc<BlockWork>,
    acknowledged: bool,
}

impl PendingTicket {
    pub fn block_number(&self) -> u64 {
        self.work.number
    }

    /// Mark the record as processed.
    pub fn ack(mut self) {
        self.acknowledged = true;
    }
}

impl Drop for PendingTicket {
    fn drop(&mut self) {
        self.work.release(self.acknowledged);
    }
}
