//! Startup sequence orchestration.

use crate::config::ApiConfig;
use crate::errors::StartupError;
use crate::startup::checks::{check_store_integrity, check_store_path};

/// Run all startup checks enabled by the configuration.
///
/// `integrity_check` runs after the store location is verified, typically
/// a cheap read against the opened store.
pub fn run_startup_sequence<F, E>(
    config: &ApiConfig,
    integrity_check: Option<F>,
) -> Result<(), StartupError>
where
    F: FnOnce() -> Result<(), E>,
    E: std::fmt::Display,
{
    if !config.operations.startup_checks {
        tracing::info!("startup checks disabled via configuration");
        return Ok(());
    }

    tracing::debug!(path = %config.store.path, "checking store path");
    check_store_path(&config.store.path)?;
    tracing::info!(path = %config.store.path, "store path check passed");

    if let Some(check) = integrity_check {
        check_store_integrity(check)?;
        tracing::info!("store integrity check passed");
    }

    Ok(())
}
