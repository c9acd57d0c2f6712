//! Operations infrastructure for the Opera API server.
//!
//! - **Config**: YAML configuration with fail-fast validation
//! - **Observability**: `tracing` logging and Prometheus metrics
//! - **Orchestrator**: lifecycle of long-running services
//! - **Shutdown**: SIGTERM/SIGINT handling and ordered shutdown
//! - **Startup**: store location checks
//!
//! # Example
//!
//! ```no_run
//! use opera_operations::{
//!     config::load_config,
//!     observability::init_logging_from_config,
//!     shutdown::{ShutdownCoordinator, SignalHandler},
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = load_config("config.yaml")?;
//!     let _levels = init_logging_from_config(
//!         &config.observability.log_level,
//!         &config.observability.log_format,
//!     );
//!
//!     let signal_handler = SignalHandler::new();
//!     let coordinator = ShutdownCoordinator::new(config.operations.shutdown_timeout());
//!     signal_handler.start();
//!     signal_handler.wait().await;
//!
//!     coordinator.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod errors;
pub mod observability;
pub mod orchestrator;
pub mod shutdown;
pub mod startup;

pub use config::{load_config, ApiConfig, ObservabilityConfig};
pub use errors::{ConfigError, ServiceError, ShutdownError, StartupError};
pub use observability::{
    init_logging, init_logging_from_config, parse_level, IndexerMetrics, LogFormat,
    LogLevelSwitch, MetricsRegistry,
};
pub use orchestrator::{Service, ServiceBase, ServiceManager, StopSignal};
pub use shutdown::{ShutdownAware, ShutdownCoordinator, SignalHandler};
pub use startup::run_startup_sequence;
