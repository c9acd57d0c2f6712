//! Graceful shutdown: signal handling, the `ShutdownAware` trait and an
//! ordered coordinator.

mod components;
mod coordinator;
mod signals;

pub use components::{FnComponent, ShutdownAware};
pub use coordinator::ShutdownCoordinator;
pub use signals::SignalHandler;
