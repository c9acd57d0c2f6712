//! Error types for the operations crate.

use thiserror::Error;

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File I/O error when loading config.
    #[error("failed to read config file '{path}': {source}")]
    FileRead {
        path: String,
        source: std::io::Error,
    },

    /// YAML parsing error.
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },

    /// Validation failed with one or more errors.
    #[error("config validation failed:\n{}", .0.join("\n"))]
    ValidationFailed(Vec<String>),
}

/// Startup-related errors.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The directory holding the store is not a directory.
    #[error("store directory is not a directory: {0}")]
    NotADirectory(String),

    /// The directory holding the store is not writable.
    #[error("store directory is not writable: {0}")]
    NotWritable(String),

    /// The store path names a directory instead of a database file.
    #[error("store path is a directory: {0}")]
    StoreIsDirectory(String),

    /// Store integrity check failed.
    #[error("store integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    /// General startup failure.
    #[error("startup failed: {0}")]
    Failed(String),
}

/// Shutdown-related errors.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// A component did not finish within the shutdown timeout.
    #[error("component '{name}' did not shut down within {secs} seconds")]
    Timeout { name: String, secs: u64 },
}

/// Service lifecycle errors.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A service was run before it was registered with a manager.
    #[error("service '{service}' is not registered with a service manager")]
    Unregistered { service: String },

    /// A service was registered twice.
    #[error("service '{service}' is already registered")]
    AlreadyRegistered { service: String },

    /// A service failed to initialize.
    #[error("service '{service}' failed to initialize: {reason}")]
    Init { service: String, reason: String },
}
