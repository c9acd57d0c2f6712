//! Startup checks run before the store is opened.

pub mod checks;
mod sequence;

pub use checks::{check_store_integrity, check_store_path};
pub use sequence::run_startup_sequence;
