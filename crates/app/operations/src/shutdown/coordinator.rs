//! Shutdown coordinator for multi-component shutdown orchestration.

use crate::errors::ShutdownError;
use crate::shutdown::components::ShutdownAware;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Coordinates graceful shutdown across multiple components.
///
/// Components are shut down in LIFO order: whatever was registered last,
/// usually the outermost service, stops first.
pub struct ShutdownCoordinator {
    components: Mutex<Vec<Arc<dyn ShutdownAware>>>,
    default_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            components: Mutex::new(Vec::new()),
            default_timeout,
        }
    }

    /// Register a component for shutdown.
    pub async fn register(&self, component: Arc<dyn ShutdownAware>) {
        let mut components = self.components.lock().await;
        tracing::debug!(component = component.name(), "registered for shutdown");
        components.push(component);
    }

    /// Shut down all registered components in reverse registration order.
    ///
    /// A component that exceeds the timeout is abandoned and the remaining
    /// components are still shut down; the first timeout is reported.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        let components = {
            let mut guard = self.components.lock().await;
            std::mem::take(&mut *guard)
        };

        if components.is_empty() {
            tracing::info!("no components registered for shutdown");
            return Ok(());
        }

        tracing::info!(count = components.len(), "beginning graceful shutdown");

        let mut first_timeout = None;
        for component in components.into_iter().rev() {
            let name = component.name().to_string();
            tracing::info!(component = %name, "shutting down");

            let shutdown_future = component.shutdown(self.default_timeout);
            match tokio::time::timeout(self.default_timeout, shutdown_future).await {
                Ok(()) => tracing::info!(component = %name, "shut down"),
                Err(_) => {
                    tracing::warn!(
                        component = %name,
                        timeout = ?self.default_timeout,
                        "shutdown timed out"
                    );
                    first_timeout.get_or_insert(ShutdownError::Timeout {
                        name,
                        secs: self.default_timeout.as_secs(),
                    });
                }
            }
        }

        tracing::info!("graceful shutdown complete");
        match first_timeout {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn component_count(&self) -> usize {
        self.components.lock().await.len()
    }
}
