use async_trait::async_trait;

/// The transport side of a shutdown: whatever owns the listener hands one of
/// these to the coordinator, which becomes the only thing allowed to stop it.
#[async_trait]
pub trait GracefulStop: Send {
    /// Stop accepting new connections and calls. Existing calls keep running.
    fn begin_graceful_stop(&mut self);

    /// Resolves once every in-flight call has returned. Must be cancel safe:
    /// the coordinator drops it when the escalation timeout wins the race.
    async fn wait_stopped(&mut self);

    /// Abort everything still running. Safe to call with nothing left, and
    /// safe to call more than once.
    fn force_stop(&mut self);

    /// Calls still running, for logging.
    fn in_flight(&self) -> usize {
        0
    }
}
