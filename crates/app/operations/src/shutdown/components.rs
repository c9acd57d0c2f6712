//! Shutdown-aware component trait.

use async_trait::async_trait;
use std::time::Duration;

/// A component the `ShutdownCoordinator` stops on process exit.
#[async_trait]
pub trait ShutdownAware: Send + Sync {
    fn name(&self) -> &str;

    /// Stop accepting work, finish in-flight work within `timeout` and
    /// release resources.
    async fn shutdown(&self, timeout: Duration);
}

/// Wraps a synchronous closure as a shutdown component.
pub struct FnComponent<F> {
    name: String,
    shutdown_fn: F,
}

impl<F> FnComponent<F>
where
    F: Fn() + Send + Sync,
{
    pub fn new(name: impl Into<String>, shutdown_fn: F) -> Self {
        Self {
            name: name.into(),
            shutdown_fn,
        }
    }
}

#[async_trait]
impl<F> ShutdownAware for FnComponent<F>
where
    F: Fn() + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn shutdown(&self, _timeout: Duration) {
        (self.shutdown_fn)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fn_component_shutdown() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();

        let component = FnComponent::new("metrics-flush", move || {
            flag.store(true, Ordering::SeqCst);
        });

        assert_eq!(component.name(), "metrics-flush");
        component.shutdown(Duration::from_secs(1)).await;
        assert!(called.load(Ordering::SeqCst));
    }
}
