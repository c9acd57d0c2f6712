//! Structured logging with runtime-adjustable log levels.
//!
//! Installs a `tracing-subscriber` registry with a reloadable `EnvFilter`
//! and a JSON or human-readable `fmt` layer. `RUST_LOG`, when set, takes
//! precedence over the configured level at startup.

use std::sync::atomic::{AtomicU8, Ordering};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

pub use tracing::Level;

/// Handle for runtime log level adjustment.
pub struct LogLevelSwitch {
    handle: reload::Handle<EnvFilter, Registry>,
    level: AtomicU8,
}

impl LogLevelSwitch {
    fn new(handle: reload::Handle<EnvFilter, Registry>, level: Level) -> Self {
        Self {
            handle,
            level: AtomicU8::new(level_to_u8(level)),
        }
    }

    /// Set the minimum log level at runtime.
    pub fn set_level(&self, level: Level) {
        if let Err(e) = self.handle.reload(level_filter(level)) {
            tracing::warn!(error = %e, "failed to reload log filter");
            return;
        }
        self.level.store(level_to_u8(level), Ordering::SeqCst);
    }

    /// Get the current log level.
    pub fn level(&self) -> Level {
        u8_to_level(self.level.load(Ordering::SeqCst))
    }
}

/// Log format for output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// JSON format for machine parsing (production).
    #[default]
    Json,
    /// Human-readable format (development).
    Pretty,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    /// Parse from string, case-insensitive. Defaults to Json for unknown values.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" | "text" | "human" => Self::Pretty,
            _ => Self::Json,
        })
    }
}

/// Parse log level from string.
///
/// `critical` has no tracing counterpart and maps to `ERROR`.
pub fn parse_level(s: &str) -> Level {
    match s.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" | "critical" | "crit" => Level::ERROR,
        _ => Level::INFO,
    }
}

fn level_to_u8(level: Level) -> u8 {
    match level {
        Level::ERROR => 1,
        Level::WARN => 2,
        Level::INFO => 3,
        Level::DEBUG => 4,
        _ => 5,
    }
}

fn u8_to_level(val: u8) -> Level {
    match val {
        0 | 1 => Level::ERROR,
        2 => Level::WARN,
        3 => Level::INFO,
        4 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn level_filter(level: Level) -> EnvFilter {
    EnvFilter::new(level.as_str().to_lowercase())
}

fn startup_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(level))
}

/// Initialize the logging system from configuration strings.
///
/// # Example
///
/// ```no_run
/// use opera_operations::observability::logging::init_logging_from_config;
///
/// let level_switch = init_logging_from_config("info", "json");
/// tracing::info!(version = "0.1.0", "api server started");
/// ```
pub fn init_logging_from_config(level: &str, format: &str) -> LogLevelSwitch {
    let level = parse_level(level);
    let format: LogFormat = format.parse().unwrap_or_default();
    init_logging(level, format)
}

/// Initialize the global subscriber.
///
/// Returns a handle to adjust the level at runtime. When a global subscriber
/// is already installed the call keeps it and the returned switch only
/// drives a detached filter.
pub fn init_logging(level: Level, format: LogFormat) -> LogLevelSwitch {
    let (filter, handle) = reload::Layer::new(startup_filter(level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(false))
            .try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().with_target(true)).try_init(),
    };
    if let Err(e) = result {
        eprintln!("Warning: failed to install log subscriber: {}", e);
    }

    LogLevelSwitch::new(handle, level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("trace"), Level::TRACE);
        assert_eq!(parse_level("DEBUG"), Level::DEBUG);
        assert_eq!(parse_level("Info"), Level::INFO);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("warning"), Level::WARN);
        assert_eq!(parse_level("error"), Level::ERROR);
        assert_eq!(parse_level("crit"), Level::ERROR);
        assert_eq!(parse_level("unknown"), Level::INFO);
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("unknown".parse::<LogFormat>().unwrap(), LogFormat::Json);
    }

    #[test]
    fn test_level_roundtrip() {
        for level in [
            Level::ERROR,
            Level::WARN,
            Level::INFO,
            Level::DEBUG,
            Level::TRACE,
        ] {
            assert_eq!(u8_to_level(level_to_u8(level)), level);
        }
    }

    #[test]
    fn test_switch_reloads_filter() {
        let (filter, handle) = reload::Layer::new(EnvFilter::new("info"));
        let _subscriber = tracing_subscriber::registry().with(filter);

        let switch = LogLevelSwitch::new(handle.clone(), Level::INFO);
        switch.set_level(Level::DEBUG);

        assert_eq!(switch.level(), Level::DEBUG);
        let current = handle.with_current(|f| f.to_string()).unwrap();
        assert!(current.eq_ignore_ascii_case("debug"));
    }
}
