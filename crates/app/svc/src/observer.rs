//! Block observer: follows the chain head and emits block numbers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opera_chain_index::Repository;
use opera_operations::{Service, ServiceBase, ServiceError};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

/// Polls the node's block height and sends every block number after the
/// last processed one to the block dispatcher, in order.
pub struct BlockObserver {
    base: ServiceBase,
    repo: Arc<Repository>,
    output: mpsc::Sender<u64>,
    poll_interval: Duration,
    start_block: Option<u64>,
    next: AtomicU64,
}

impl BlockObserver {
    pub fn new(
        repo: Arc<Repository>,
        output: mpsc::Sender<u64>,
        poll_interval: Duration,
        start_block: Option<u64>,
    ) -> Self {
        Self {
            base: ServiceBase::new(),
            repo,
            output,
            poll_interval,
            start_block,
            next: AtomicU64::new(0),
        }
    }

    /// Next block number to emit.
    pub fn next_block(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    async fn execute(self: Arc<Self>) {
        let mut stop = self.base.stop_signal();
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut next = self.next_block();

        loop {
            tokio::select! {
                biased;
                _ = stop.stopped() => return,
                _ = ticker.tick() => {}
            }

            let head = match self.repo.block_height().await {
                Ok(head) => head,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read block height");
                    continue;
                }
            };

            while next <= head {
                tokio::select! {
                    biased;
                    _ = stop.stopped() => return,
                    sent = self.output.send(next) => {
                        if sent.is_err() {
                            tracing::info!("block channel closed, terminating block observer");
                            return;
                        }
                    }
                }
                tracing::trace!(block = next, head, "block observed");
                next += 1;
                self.next.store(next, Ordering::Release);
            }
        }
    }
}

#[async_trait]
impl Service for BlockObserver {
    fn name(&self) -> &str {
        "block observer"
    }

    fn base(&self) -> &ServiceBase {
        &self.base
    }

    /// Resume after the last processed block, else at the configured start
    /// block, else at the current head.
    async fn init(&self) -> Result<(), ServiceError> {
        let init_failed = |reason: String| ServiceError::Init {
            service: self.name().to_string(),
            reason,
        };

        let next = match self.repo.last_known_block() {
            Ok(Some(last)) => last + 1,
            Ok(None) => match self.start_block {
                Some(start) => start,
                None => self
                    .repo
                    .block_height()
                    .await
                    .map_err(|e| init_failed(e.to_string()))?,
            },
            Err(e) => return Err(init_failed(e.to_string())),
        };
        self.next.store(next, Ordering::Release);
        tracing::info!(next_block = next, "block observer initialized");
        Ok(())
    }

    fn run(self: Arc<Self>) {
        let this = Arc::clone(&self);
        self.base.launch(self.name(), this.execute());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::tests::test_block;
    use opera_chain_index::mock::MockNode;
    use opera_chain_index::{RepositoryConfig, SqliteStore};
    use opera_operations::ServiceManager;

    fn setup() -> (Arc<Repository>, Arc<MockNode>) {
        let store = Arc::new(SqliteStore::in_memory().expect("in-memory store should open"));
        let node = Arc::new(MockNode::new());
        let repo = Arc::new(Repository::new(
            store,
            node.clone(),
            RepositoryConfig::default(),
        ));
        (repo, node)
    }

    async fn next_number(rx: &mut mpsc::Receiver<u64>) -> u64 {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("block number should arrive")
            .expect("channel should stay open")
    }

    #[tokio::test]
    async fn emits_blocks_up_to_head_and_follows() {
        let (repo, node) = setup();
        node.set_height(3);
        let (tx, mut rx) = mpsc::channel(16);
        let observer = Arc::new(BlockObserver::new(
            repo,
            tx,
            Duration::from_millis(10),
            Some(1),
        ));

        let manager = ServiceManager::new();
        manager.register(observer.clone()).unwrap();
        manager.run_all().await.unwrap();

        for expected in 1..=3 {
            assert_eq!(next_number(&mut rx).await, expected);
        }

        node.add_block(test_block(5));
        for expected in 4..=5 {
            assert_eq!(next_number(&mut rx).await, expected);
        }

        manager.close().await;
        assert_eq!(observer.next_block(), 6);
    }

    #[tokio::test]
    async fn resumes_after_last_known_block() {
        let (repo, node) = setup();
        node.set_height(10);
        repo.update_last_known_block(7).unwrap();

        let (tx, _rx) = mpsc::channel(1);
        let observer = BlockObserver::new(repo, tx, Duration::from_millis(10), Some(1));
        observer.init().await.unwrap();
        assert_eq!(observer.next_block(), 8);
    }

    #[tokio::test]
    async fn starts_at_head_without_resume_point() {
        let (repo, node) = setup();
        node.set_height(42);

        let (tx, _rx) = mpsc::channel(1);
        let observer = BlockObserver::new(repo, tx, Duration::from_millis(10), None);
        observer.init().await.unwrap();
        assert_eq!(observer.next_block(), 42);
    }

    #[tokio::test]
    async fn init_fails_when_node_is_down() {
        let (repo, node) = setup();
        node.fail_next(opera_chain_index::RepositoryError::Upstream(
            "connection refused".to_string(),
        ));

        let (tx, _rx) = mpsc::channel(1);
        let observer = BlockObserver::new(repo, tx, Duration::from_millis(10), None);
        let err = observer.init().await.unwrap_err();
        assert!(matches!(err, ServiceError::Init { .. }));
    }
}
