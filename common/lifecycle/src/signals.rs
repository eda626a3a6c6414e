use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use crate::coordinator::ShutdownHandle;
use crate::error::LifecycleError;

/// Forwards every SIGINT/SIGTERM to the coordinator for the life of the process.
/// Only the first one starts the shutdown sequence; the rest are absorbed.
pub(crate) fn forward_shutdown_signals(
    handle: ShutdownHandle,
) -> Result<JoinHandle<()>, LifecycleError> {
    let mut interrupt = signal(SignalKind::interrupt()).map_err(LifecycleError::SignalHandler)?;
    let mut term = signal(SignalKind::terminate()).map_err(LifecycleError::SignalHandler)?;

    Ok(tokio::spawn(async move {
        loop {
            let source = tokio::select! {
                Some(()) = interrupt.recv() => "SIGINT",
                Some(()) = term.recv() => "SIGTERM",
                else => break,
            };
            tracing::info!(signal = source, "received shutdown signal");
            handle.request_shutdown(source);
        }
    }))
}
