//! Shutdown coordinator: waits for the first shutdown request, flips health, gives
//! watchers a drain window, stops the transport and releases parked sessions, then
//! races graceful completion against an escalation timeout.

use std::fmt;
use std::time::{Duration, Instant};

use health::HealthRegistry;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::LifecycleError;
use crate::metrics;
use crate::release::ReleaseSignal;
use crate::signals;
use crate::stop::GracefulStop;

/// Phase of the process-wide shutdown. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopping,
    Stopped,
}

/// Which path took the coordinator from Stopping to Stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every in-flight call returned before the escalation timeout.
    Clean,
    /// The escalation timeout fired and the transport was force-stopped.
    Forced,
}

impl ShutdownOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            ShutdownOutcome::Clean => "clean",
            ShutdownOutcome::Forced => "forced",
        }
    }
}

impl fmt::Display for ShutdownOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct ShutdownRequest {
    source: String,
}

/// Cloneable handle to request shutdown and observe its progress.
#[derive(Clone)]
pub struct ShutdownHandle {
    request_tx: mpsc::Sender<ShutdownRequest>,
    state_rx: watch::Receiver<ShutdownState>,
}

impl ShutdownHandle {
    /// Request shutdown. The first request starts the sequence; later ones are
    /// logged and ignored. Never blocks.
    pub fn request_shutdown(&self, source: impl Into<String>) {
        if let Err(e) = self.request_tx.try_send(ShutdownRequest {
            source: source.into(),
        }) {
            debug!(error = %e, "shutdown request channel full or closed, request dropped");
        }
    }

    /// Subscription to the shutdown phase.
    pub fn state(&self) -> watch::Receiver<ShutdownState> {
        self.state_rx.clone()
    }

    pub fn current_state(&self) -> ShutdownState {
        *self.state_rx.borrow()
    }
}

/// Builder for [`ShutdownCoordinator`].
#[derive(Clone, Debug)]
pub struct ShutdownCoordinatorBuilder {
    name: String,
    drain_grace: Duration,
    stop_timeout: Duration,
    trap_signals: bool,
}

impl ShutdownCoordinatorBuilder {
    /// Time health watchers get to observe NotServing before the listener stops.
    pub fn with_drain_grace(mut self, drain_grace: Duration) -> Self {
        self.drain_grace = drain_grace;
        self
    }

    /// Time in-flight calls get to return before the transport is force-stopped.
    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    /// Install SIGINT/SIGTERM handlers when running (default: true).
    pub fn with_trap_signals(mut self, trap_signals: bool) -> Self {
        self.trap_signals = trap_signals;
        self
    }

    pub fn build<T: GracefulStop>(
        self,
        health: HealthRegistry,
        release: ReleaseSignal,
        transport: T,
    ) -> ShutdownCoordinator<T> {
        let (request_tx, request_rx) = mpsc::channel(16);
        let state = watch::Sender::new(ShutdownState::Running);
        ShutdownCoordinator {
            name: self.name,
            drain_grace: self.drain_grace,
            stop_timeout: self.stop_timeout,
            trap_signals: self.trap_signals,
            health,
            release,
            transport,
            state,
            request_tx,
            request_rx,
        }
    }
}

/// Drives the shutdown sequence for one server process. `run` consumes the
/// coordinator, so the sequence can execute at most once.
pub struct ShutdownCoordinator<T> {
    name: String,
    drain_grace: Duration,
    stop_timeout: Duration,
    trap_signals: bool,
    health: HealthRegistry,
    release: ReleaseSignal,
    transport: T,
    state: watch::Sender<ShutdownState>,
    request_tx: mpsc::Sender<ShutdownRequest>,
    request_rx: mpsc::Receiver<ShutdownRequest>,
}

impl ShutdownCoordinator<()> {
    pub fn builder(name: &str) -> ShutdownCoordinatorBuilder {
        ShutdownCoordinatorBuilder {
            name: name.to_string(),
            drain_grace: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(1),
            trap_signals: true,
        }
    }
}

impl<T: GracefulStop> ShutdownCoordinator<T> {
    pub fn handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            request_tx: self.request_tx.clone(),
            state_rx: self.state.subscribe(),
        }
    }

    /// Wait for the first shutdown request, then run the sequence to completion.
    /// Both outcomes are successes; errors only come from signal installation.
    #[tracing::instrument(skip_all, fields(app = %self.name))]
    pub async fn run(self) -> Result<ShutdownOutcome, LifecycleError> {
        let signal_task = if self.trap_signals {
            Some(signals::forward_shutdown_signals(self.handle())?)
        } else {
            None
        };

        let ShutdownCoordinator {
            name,
            drain_grace,
            stop_timeout,
            health,
            release,
            mut transport,
            state,
            request_tx,
            mut request_rx,
            ..
        } = self;

        let request = request_rx.recv().await.unwrap_or_else(|| ShutdownRequest {
            source: "closed".to_string(),
        });
        let shutdown_clock = Instant::now();
        metrics::emit_shutdown_initiated(&name, &request.source);
        info!(
            trigger = %request.source,
            "Shutdown: initiating graceful shutdown"
        );
        let absorber = tokio::spawn(absorb_duplicate_requests(name.clone(), request_rx));

        // Health flips before anything touches the transport.
        advance(&state, ShutdownState::Draining);
        match health.shutdown() {
            Ok(()) => info!("Shutdown: health NotServing"),
            Err(e) => warn!(error = %e, "Shutdown: failed to flip health, continuing"),
        }
        tokio::time::sleep(drain_grace).await;

        advance(&state, ShutdownState::Stopping);
        if let Err(e) = health.terminate() {
            warn!(error = %e, "Shutdown: failed to close health watchers, continuing");
        }
        info!("Shutdown: gracefully stopping server, no new connections or RPCs will be accepted and existing streams will be drained");
        transport.begin_graceful_stop();
        info!(
            in_flight = transport.in_flight(),
            "Shutdown: closing existing streams"
        );
        release.release();

        let outcome = match tokio::time::timeout(stop_timeout, transport.wait_stopped()).await {
            Ok(()) => {
                info!("Shutdown: all streams closed cleanly");
                ShutdownOutcome::Clean
            }
            Err(_) => {
                warn!(
                    remaining = transport.in_flight(),
                    timeout_secs = stop_timeout.as_secs_f64(),
                    "Shutdown: failed to gracefully shut down all streams, forcefully terminating server"
                );
                transport.force_stop();
                ShutdownOutcome::Forced
            }
        };
        advance(&state, ShutdownState::Stopped);

        absorber.abort();
        if let Some(task) = signal_task {
            task.abort();
        }
        drop(request_tx);

        let total = shutdown_clock.elapsed();
        metrics::emit_shutdown_completed(&name, outcome.as_str(), total.as_secs_f64());
        info!(
            %outcome,
            total_duration_secs = total.as_secs_f64(),
            "Shutdown: complete"
        );
        Ok(outcome)
    }
}

fn advance(state: &watch::Sender<ShutdownState>, next: ShutdownState) {
    state.send_if_modified(|current| {
        if next <= *current {
            return false;
        }
        debug!(from = ?*current, to = ?next, "Shutdown: state transition");
        *current = next;
        true
    });
}

async fn absorb_duplicate_requests(name: String, mut request_rx: mpsc::Receiver<ShutdownRequest>) {
    while let Some(request) = request_rx.recv().await {
        metrics::emit_duplicate_request(&name);
        info!(
            trigger = %request.source,
            "Shutdown: already in progress, ignoring request"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered() {
        assert!(ShutdownState::Running < ShutdownState::Draining);
        assert!(ShutdownState::Draining < ShutdownState::Stopping);
        assert!(ShutdownState::Stopping < ShutdownState::Stopped);
    }

    #[test]
    fn advance_never_regresses() {
        let (state, rx) = watch::channel(ShutdownState::Running);
        advance(&state, ShutdownState::Stopping);
        advance(&state, ShutdownState::Draining);
        assert_eq!(*rx.borrow(), ShutdownState::Stopping);
        advance(&state, ShutdownState::Stopped);
        advance(&state, ShutdownState::Running);
        assert_eq!(*rx.borrow(), ShutdownState::Stopped);
    }
}
