//! Signal handling for graceful shutdown.

use tokio::sync::watch;

/// Signal handler that listens for SIGTERM and SIGINT.
///
/// Subscribers observe `true` once a shutdown has been requested.
pub struct SignalHandler {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SignalHandler {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Get a receiver that will be notified when shutdown is requested.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Spawn a task waiting for SIGTERM or SIGINT.
    pub fn start(&self) {
        let tx = self.shutdown_tx.clone();

        tokio::spawn(async move {
            let signal = wait_for_signal().await;
            tracing::info!(signal, "received shutdown signal");
            let _ = tx.send(true);
        });
    }

    /// Request shutdown without a signal.
    pub fn trigger(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Wait until shutdown is requested.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        // the sender lives in self, so changed() only fails after drop
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => tokio::select! {
            _ = sigterm.recv() => "SIGTERM",
            _ = sigint.recv() => "SIGINT",
        },
        (Err(e), _) | (_, Err(e)) => {
            tracing::warn!(error = %e, "failed to register signal handlers, using ctrl-c");
            wait_for_ctrl_c().await
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    wait_for_ctrl_c().await
}

async fn wait_for_ctrl_c() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    "Ctrl+C"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_manual_trigger() {
        let handler = SignalHandler::new();
        let mut rx = handler.subscribe();

        assert!(!handler.is_shutdown_requested());

        handler.trigger();

        rx.changed().await.unwrap();
        assert!(handler.is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let handler = SignalHandler::new();
        let mut rx1 = handler.subscribe();
        let mut rx2 = handler.subscribe();

        handler.trigger();

        rx1.changed().await.unwrap();
        rx2.changed().await.unwrap();

        assert!(*rx1.borrow());
        assert!(*rx2.borrow());
    }

    #[tokio::test]
    async fn test_wait_returns_after_trigger() {
        let handler = SignalHandler::new();
        handler.trigger();
        tokio::time::timeout(Duration::from_secs(1), handler.wait())
            .await
            .unwrap();
    }
}
