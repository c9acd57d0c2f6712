//! Lifecycle management for long-running services.
//!
//! Every worker implements [`Service`] and embeds a [`ServiceBase`]. The
//! [`ServiceManager`] initializes registered services, starts them in
//! registration order, tracks which are still running and stops them in
//! reverse order on close.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use opera_operations::orchestrator::{Service, ServiceManager};
//! # async fn example(dispatcher: Arc<dyn Service>) -> Result<(), opera_operations::ServiceError> {
//! let manager = ServiceManager::new();
//! manager.register(dispatcher)?;
//! manager.run_all().await?;
//! // ...
//! manager.close().await;
//! # Ok(())
//! # }
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};

use crate::errors::ServiceError;
use crate::shutdown::ShutdownAware;

/// A long-running worker managed by a [`ServiceManager`].
#[async_trait]
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn base(&self) -> &ServiceBase;

    /// Prepare the service before any service is started.
    async fn init(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    /// Start the service.
    ///
    /// Implementations do their startup work and hand the worker loop to
    /// [`ServiceBase::launch`], which reports start and finish to the manager.
    fn run(self: Arc<Self>);
}

/// Receiving side of a service stop request.
#[derive(Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once a stop has been requested.
    pub async fn stopped(&mut self) {
        // the sender is owned by the service, a closed channel means it is gone
        let _ = self.0.wait_for(|stop| *stop).await;
    }
}

#[derive(Default)]
struct ManagerState {
    running: Mutex<HashSet<String>>,
    idle: Notify,
}

impl ManagerState {
    fn started(&self, name: &str) {
        self.running.lock().insert(name.to_string());
        tracing::info!(service = name, "service started");
    }

    fn finished(&self, name: &str) {
        let idle = {
            let mut running = self.running.lock();
            running.remove(name);
            running.is_empty()
        };
        tracing::info!(service = name, "service finished");
        if idle {
            self.idle.notify_waiters();
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.running.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }
}

/// Orchestration state embedded in every service.
pub struct ServiceBase {
    manager: OnceLock<Arc<ManagerState>>,
    stop_tx: watch::Sender<bool>,
}

impl Default for ServiceBase {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceBase {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            manager: OnceLock::new(),
            stop_tx,
        }
    }

    pub fn stop_signal(&self) -> StopSignal {
        StopSignal(self.stop_tx.subscribe())
    }

    /// Ask the service's worker loop to exit.
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn is_registered(&self) -> bool {
        self.manager.get().is_some()
    }

    fn attach(&self, name: &str, state: Arc<ManagerState>) -> Result<(), ServiceError> {
        self.manager
            .set(state)
            .map_err(|_| ServiceError::AlreadyRegistered {
                service: name.to_string(),
            })
    }

    /// Report the service as started and spawn its worker loop.
    ///
    /// The manager is told the service finished when `task` completes.
    ///
    /// Launching a service that was never registered with a manager is a
    /// wiring bug: it is logged as [`ServiceError::Unregistered`] and the
    /// process aborts, since a panic here would only unwind the caller's task.
    pub fn launch<F>(&self, name: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(state) = self.manager.get().cloned() else {
            let err = ServiceError::Unregistered {
                service: name.to_string(),
            };
            tracing::error!(service = name, error = %err, "aborting");
            std::process::abort();
        };

        state.started(name);
        let name = name.to_string();
        tokio::spawn(async move {
            task.await;
            state.finished(&name);
        });
    }
}

/// Starts, tracks and stops registered services.
pub struct ServiceManager {
    services: Mutex<Vec<Arc<dyn Service>>>,
    state: Arc<ManagerState>,
}

impl Default for ServiceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceManager {
    pub fn new() -> Self {
        Self {
            services: Mutex::new(Vec::new()),
            state: Arc::new(ManagerState::default()),
        }
    }

    /// Take ownership of a service's lifecycle.
    pub fn register(&self, service: Arc<dyn Service>) -> Result<(), ServiceError> {
        let mut services = self.services.lock();
        if services.iter().any(|s| s.name() == service.name()) {
            return Err(ServiceError::AlreadyRegistered {
                service: service.name().to_string(),
            });
        }
        service.base().attach(service.name(), self.state.clone())?;
        tracing::debug!(service = service.name(), "service registered");
        services.push(service);
        Ok(())
    }

    /// Initialize every registered service, then run them in registration
    /// order. Nothing runs when any initialization fails.
    pub async fn run_all(&self) -> Result<(), ServiceError> {
        let services = self.services.lock().clone();

        for service in &services {
            service.init().await?;
        }
        for service in services {
            service.run();
        }
        Ok(())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.state.running.lock().contains(name)
    }

    pub fn running(&self) -> usize {
        self.state.running.lock().len()
    }

    /// Stop all services in reverse registration order and wait until every
    /// one has reported finished.
    pub async fn close(&self) {
        let services = self.services.lock().clone();
        for service in services.iter().rev() {
            tracing::debug!(service = service.name(), "stopping service");
            service.base().stop();
        }
        self.state.wait_idle().await;
        tracing::info!("all services finished");
    }
}

#[async_trait]
impl ShutdownAware for ServiceManager {
    fn name(&self) -> &str {
        "service manager"
    }

    async fn shutdown(&self, _timeout: Duration) {
        self.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Ticker {
        name: String,
        base: ServiceBase,
        ticks: Arc<AtomicUsize>,
        fail_init: bool,
    }

    impl Ticker {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                base: ServiceBase::new(),
                ticks: Arc::new(AtomicUsize::new(0)),
                fail_init: false,
            })
        }
    }

    #[async_trait]
    impl Service for Ticker {
        fn name(&self) -> &str {
            &self.name
        }

        fn base(&self) -> &ServiceBase {
            &self.base
        }

        async fn init(&self) -> Result<(), ServiceError> {
            if self.fail_init {
                return Err(ServiceError::Init {
                    service: self.name.clone(),
                    reason: "no upstream".to_string(),
                });
            }
            Ok(())
        }

        fn run(self: Arc<Self>) {
            let mut stop = self.base.stop_signal();
            let ticks = self.ticks.clone();
            self.base.launch(&self.name, async move {
                loop {
                    tokio::select! {
                        _ = stop.stopped() => return,
                        _ = tokio::time::sleep(Duration::from_millis(1)) => {
                            ticks.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                }
            });
        }
    }

    const ORPHAN_CHILD_ENV: &str = "OPERA_ORPHAN_SERVICE_CHILD";

    #[test]
    fn test_run_unregistered_aborts_process() {
        if std::env::var_os(ORPHAN_CHILD_ENV).is_some() {
            Ticker::new("orphan").run();
            return;
        }

        // the abort takes the whole process down, so run it in a child
        let status = std::process::Command::new(std::env::current_exe().unwrap())
            .args([
                "--exact",
                "orchestrator::tests::test_run_unregistered_aborts_process",
                "--test-threads=1",
            ])
            .env(ORPHAN_CHILD_ENV, "1")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .unwrap();

        assert!(!status.success());
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            // SIGABRT
            assert_eq!(status.signal(), Some(6));
        }
    }

    #[tokio::test]
    async fn test_run_and_close() {
        let manager = ServiceManager::new();
        let a = Ticker::new("a");
        let b = Ticker::new("b");
        manager.register(a.clone()).unwrap();
        manager.register(b.clone()).unwrap();

        manager.run_all().await.unwrap();
        assert!(manager.is_running("a"));
        assert!(manager.is_running("b"));
        assert_eq!(manager.running(), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(a.ticks.load(Ordering::SeqCst) > 0);

        tokio::time::timeout(Duration::from_secs(1), manager.close())
            .await
            .unwrap();
        assert_eq!(manager.running(), 0);
        assert!(a.base.stop_signal().is_stopped());
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let manager = ServiceManager::new();
        let a = Ticker::new("a");
        manager.register(a.clone()).unwrap();

        let again = manager.register(a.clone());
        assert!(matches!(again, Err(ServiceError::AlreadyRegistered { .. })));

        let other = ServiceManager::new();
        let moved = other.register(a);
        assert!(matches!(moved, Err(ServiceError::AlreadyRegistered { .. })));
    }

    #[tokio::test]
    async fn test_init_failure_runs_nothing() {
        let manager = ServiceManager::new();
        manager.register(Ticker::new("ok")).unwrap();
        manager
            .register(Arc::new(Ticker {
                name: "broken".to_string(),
                base: ServiceBase::new(),
                ticks: Arc::new(AtomicUsize::new(0)),
                fail_init: true,
            }))
            .unwrap();

        let result = manager.run_all().await;
        assert!(matches!(result, Err(ServiceError::Init { .. })));
        assert_eq!(manager.running(), 0);
    }

    #[tokio::test]
    async fn test_close_without_services() {
        let manager = ServiceManager::new();
        tokio::time::timeout(Duration::from_secs(1), manager.close())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_through_coordinator() {
        let manager = Arc::new(ServiceManager::new());
        manager.register(Ticker::new("a")).unwrap();
        manager.run_all().await.unwrap();

        let coordinator = crate::shutdown::ShutdownCoordinator::new(Duration::from_secs(1));
        coordinator.register(manager.clone()).await;
        coordinator.shutdown().await.unwrap();
        assert_eq!(manager.running(), 0);
    }
}
