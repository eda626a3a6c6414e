//! Lifecycle error types returned by the coordinator.

use thiserror::Error;

/// Errors returned by [`ShutdownCoordinator::run`](crate::ShutdownCoordinator::run).
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// SIGINT/SIGTERM handlers could not be registered.
    #[error("failed to install signal handler: {0}")]
    SignalHandler(#[source] std::io::Error),
}
