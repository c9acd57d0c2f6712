//! Observability infrastructure for the API server.
//!
//! - **Logging**: structured `tracing` output with runtime-adjustable levels
//! - **Metrics**: Prometheus-compatible ingestion metrics

pub mod logging;
pub mod metrics;

pub use logging::{
    init_logging, init_logging_from_config, parse_level, Level, LogFormat, LogLevelSwitch,
};
pub use metrics::{IndexerMetrics, MetricsRegistry};
