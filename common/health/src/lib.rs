//! Serving status reporting for the services of the process.
//!
//! The sample server multiplexes the duplex stream service and the
//! gRPC health service on one listener. Load balancers and clients
//! watch the health service to decide whether they should keep
//! routing new streams to this process.
//!
//! HealthRegistry keeps one status per logical service name, the
//! empty name standing for the whole process:
//!   - startup code marks services Serving before the listener accepts
//!   - `shutdown` flips every service to NotServing and freezes the
//!     registry, later `set_status` calls are ignored
//!   - `terminate` marks every service Terminated, which ends every
//!     watch stream with a final item instead of an error
//!
//! Watchers never mutate the registry. Each watch is a subscription
//! on a `tokio::sync::watch` channel, so any number of them can run
//! concurrently and a watcher that goes away is simply dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use futures::stream::{self, Stream};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

mod grpc;

pub use grpc::HealthService;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum HealthStatus {
    Serving,
    NotServing,
    /// Nothing ever set a status for this service name
    ServiceUnknown,
    /// Terminal value, no status will follow
    Terminated,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HealthStatus::Serving => "SERVING",
            HealthStatus::NotServing => "NOT_SERVING",
            HealthStatus::ServiceUnknown => "SERVICE_UNKNOWN",
            HealthStatus::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("poisoned HealthRegistry lock")]
    Poisoned,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Running,
    ShuttingDown,
    Terminated,
}

struct Entry {
    tx: watch::Sender<HealthStatus>,
    /// Set by `set_status`. Entries only a watch created go away with their
    /// last watcher, so remote callers cannot grow the map.
    registered: bool,
}

struct Services {
    phase: Phase,
    channels: HashMap<String, Entry>,
}

impl Services {
    /// Status a service gets when it is first seen in the current phase.
    fn initial_status(&self) -> HealthStatus {
        match self.phase {
            Phase::Running | Phase::ShuttingDown => HealthStatus::ServiceUnknown,
            Phase::Terminated => HealthStatus::Terminated,
        }
    }

    fn entry(&mut self, service: &str) -> &mut Entry {
        let initial = self.initial_status();
        self.channels
            .entry(service.to_owned())
            .or_insert_with(|| Entry {
                tx: watch::Sender::new(initial),
                registered: false,
            })
    }

    /// Called while the departing receiver is still alive.
    fn release_watch(&mut self, service: &str) {
        let unused = self
            .channels
            .get(service)
            .is_some_and(|entry| !entry.registered && entry.tx.receiver_count() <= 1);
        if unused {
            self.channels.remove(service);
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    services: Arc<RwLock<Services>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            services: Arc::new(RwLock::new(Services {
                phase: Phase::Running,
                channels: HashMap::new(),
            })),
        }
    }

    /// Overwrites the status of a service, waking watchers only when the
    /// value actually changes. Ignored once shutdown has begun.
    pub fn set_status(&self, service: &str, status: HealthStatus) -> Result<(), HealthError> {
        let mut services = self.services.write().map_err(|_| HealthError::Poisoned)?;
        if services.phase != Phase::Running {
            debug!(
                service,
                %status,
                "health registry is shutting down, ignoring status update"
            );
            return Ok(());
        }
        let entry = services.entry(service);
        entry.registered = true;
        let changed = entry.tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
        if changed {
            info!(service, %status, "health status updated");
        }
        Ok(())
    }

    /// Current status of a service, `None` if nothing ever set it.
    pub fn status(&self, service: &str) -> Option<HealthStatus> {
        let services = self.services.read().ok()?;
        services
            .channels
            .get(service)
            .filter(|entry| entry.registered)
            .map(|entry| *entry.tx.borrow())
    }

    /// Subscribes to a service: yields the current status, then every
    /// change, and ends after `Terminated`. A name that was never set
    /// starts as `ServiceUnknown` and picks up a later registration.
    pub fn watch(&self, service: &str) -> impl Stream<Item = HealthStatus> + Send + 'static {
        let watcher = match self.services.write() {
            Ok(mut services) => Watcher::new(
                services.entry(service).tx.subscribe(),
                Some((self.services.clone(), service.to_owned())),
            ),
            Err(_) => {
                warn!(service, "poisoned HealthRegistry lock, watch ends immediately");
                Watcher::new(watch::Sender::new(HealthStatus::Terminated).subscribe(), None)
            }
        };
        stream::unfold(watcher, |mut watcher| async move {
            watcher.next().await.map(|status| (status, watcher))
        })
    }

    /// Flips every service to NotServing and ignores later updates.
    pub fn shutdown(&self) -> Result<(), HealthError> {
        let mut services = self.services.write().map_err(|_| HealthError::Poisoned)?;
        if services.phase != Phase::Running {
            return Ok(());
        }
        services.phase = Phase::ShuttingDown;
        for entry in services.channels.values() {
            entry.tx.send_if_modified(|current| match current {
                HealthStatus::NotServing | HealthStatus::ServiceUnknown => false,
                _ => {
                    *current = HealthStatus::NotServing;
                    true
                }
            });
        }
        info!("health registry shut down, all services NOT_SERVING");
        Ok(())
    }

    /// Ends every watch stream. Implies `shutdown`.
    pub fn terminate(&self) -> Result<(), HealthError> {
        self.shutdown()?;
        let mut services = self.services.write().map_err(|_| HealthError::Poisoned)?;
        if services.phase == Phase::Terminated {
            return Ok(());
        }
        services.phase = Phase::Terminated;
        for entry in services.channels.values() {
            entry.tx.send_replace(HealthStatus::Terminated);
        }
        info!("health registry terminated, closing watch streams");
        Ok(())
    }

    /// Number of live watch subscriptions for a service.
    pub fn watcher_count(&self, service: &str) -> usize {
        self.services
            .read()
            .ok()
            .and_then(|services| {
                services
                    .channels
                    .get(service)
                    .map(|entry| entry.tx.receiver_count())
            })
            .unwrap_or(0)
    }
}

/// Per-subscription state behind [`HealthRegistry::watch`].
struct Watcher {
    receiver: watch::Receiver<HealthStatus>,
    last: Option<HealthStatus>,
    done: bool,
    subscription: Option<(Arc<RwLock<Services>>, String)>,
}

impl Watcher {
    fn new(
        receiver: watch::Receiver<HealthStatus>,
        subscription: Option<(Arc<RwLock<Services>>, String)>,
    ) -> Self {
        Self {
            receiver,
            last: None,
            done: false,
            subscription,
        }
    }

    async fn next(&mut self) -> Option<HealthStatus> {
        loop {
            if self.done {
                return None;
            }
            let current = *self.receiver.borrow_and_update();
            if current == HealthStatus::Terminated {
                // A slow watcher may never have seen the shutdown flip.
                if self.last != Some(HealthStatus::NotServing) {
                    self.last = Some(HealthStatus::NotServing);
                    return Some(HealthStatus::NotServing);
                }
                self.done = true;
                return Some(HealthStatus::Terminated);
            }
            if self.last != Some(current) {
                self.last = Some(current);
                return Some(current);
            }
            if self.receiver.changed().await.is_err() {
                self.done = true;
            }
        }
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if let Some((services, service)) = self.subscription.take() {
            if let Ok(mut services) = services.write() {
                services.release_watch(&service);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{HealthRegistry, HealthStatus};
    use futures::StreamExt;
    use std::time::Duration;

    async fn collect_all(
        stream: impl futures::Stream<Item = HealthStatus>,
    ) -> Vec<HealthStatus> {
        tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
            .await
            .expect("watch stream did not end")
    }

    #[tokio::test]
    async fn unknown_service_has_no_status() {
        let registry = HealthRegistry::new();
        assert_eq!(registry.status(""), None);
    }

    #[tokio::test]
    async fn set_status_is_an_idempotent_overwrite() {
        let registry = HealthRegistry::new();
        registry.set_status("", HealthStatus::Serving).unwrap();
        registry.set_status("", HealthStatus::Serving).unwrap();
        assert_eq!(registry.status(""), Some(HealthStatus::Serving));

        registry.set_status("", HealthStatus::NotServing).unwrap();
        assert_eq!(registry.status(""), Some(HealthStatus::NotServing));
    }

    #[tokio::test]
    async fn watch_yields_current_value_first() {
        let registry = HealthRegistry::new();
        registry.set_status("svc", HealthStatus::Serving).unwrap();

        let mut stream = Box::pin(registry.watch("svc"));
        assert_eq!(stream.next().await, Some(HealthStatus::Serving));
        assert_eq!(registry.watcher_count("svc"), 1);
    }

    #[tokio::test]
    async fn watch_of_unset_service_picks_up_registration() {
        let registry = HealthRegistry::new();
        let mut stream = Box::pin(registry.watch("late"));
        assert_eq!(stream.next().await, Some(HealthStatus::ServiceUnknown));

        registry.set_status("late", HealthStatus::Serving).unwrap();
        assert_eq!(stream.next().await, Some(HealthStatus::Serving));
    }

    #[tokio::test]
    async fn watchers_see_serving_not_serving_terminated() {
        let registry = HealthRegistry::new();
        registry.set_status("", HealthStatus::Serving).unwrap();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let mut watcher = Box::pin(registry.watch(""));
            assert_eq!(watcher.next().await, Some(HealthStatus::Serving));
            handles.push(tokio::spawn(collect_all(watcher)));
        }
        assert_eq!(registry.watcher_count(""), 3);

        registry.shutdown().unwrap();
        registry.terminate().unwrap();

        for handle in handles {
            let seen = handle.await.unwrap();
            assert_eq!(seen, vec![HealthStatus::NotServing, HealthStatus::Terminated]);
        }
    }

    #[tokio::test]
    async fn lagging_watcher_never_skips_not_serving() {
        let registry = HealthRegistry::new();
        registry.set_status("", HealthStatus::Serving).unwrap();

        let mut stream = Box::pin(registry.watch(""));
        assert_eq!(stream.next().await, Some(HealthStatus::Serving));

        // Both transitions land before the watcher polls again.
        registry.shutdown().unwrap();
        registry.terminate().unwrap();

        assert_eq!(stream.next().await, Some(HealthStatus::NotServing));
        assert_eq!(stream.next().await, Some(HealthStatus::Terminated));
        assert_eq!(stream.next().await, None);
    }

    #[tokio::test]
    async fn updates_after_shutdown_are_ignored() {
        let registry = HealthRegistry::new();
        registry.set_status("", HealthStatus::Serving).unwrap();
        registry.shutdown().unwrap();

        registry.set_status("", HealthStatus::Serving).unwrap();
        assert_eq!(registry.status(""), Some(HealthStatus::NotServing));
    }

    #[tokio::test]
    async fn shutdown_and_terminate_are_idempotent() {
        let registry = HealthRegistry::new();
        registry.set_status("", HealthStatus::Serving).unwrap();

        registry.shutdown().unwrap();
        registry.shutdown().unwrap();
        registry.terminate().unwrap();
        registry.terminate().unwrap();

        assert_eq!(registry.status(""), Some(HealthStatus::Terminated));
    }

    #[tokio::test]
    async fn watch_after_terminate_ends_immediately() {
        let registry = HealthRegistry::new();
        registry.terminate().unwrap();

        let seen = collect_all(registry.watch("")).await;
        assert_eq!(seen, vec![HealthStatus::NotServing, HealthStatus::Terminated]);
    }

    #[tokio::test]
    async fn dropped_watches_of_unregistered_names_leave_nothing_behind() {
        let registry = HealthRegistry::new();
        for i in 0..1000 {
            let mut stream = Box::pin(registry.watch(&format!("svc-{i}")));
            assert_eq!(stream.next().await, Some(HealthStatus::ServiceUnknown));
        }

        assert_eq!(registry.services.read().unwrap().channels.len(), 0);
        assert_eq!(registry.status("svc-0"), None);
        assert_eq!(registry.watcher_count("svc-0"), 0);
    }

    #[tokio::test]
    async fn unregistered_name_is_kept_while_watched() {
        let registry = HealthRegistry::new();
        let first = registry.watch("late");
        let second = registry.watch("late");
        assert_eq!(registry.watcher_count("late"), 2);

        drop(first);
        assert_eq!(registry.watcher_count("late"), 1);

        // Registration pins the entry past its last watcher.
        registry.set_status("late", HealthStatus::Serving).unwrap();
        drop(second);
        assert_eq!(registry.status("late"), Some(HealthStatus::Serving));
    }

    #[tokio::test]
    async fn dropped_watcher_does_not_affect_publisher() {
        let registry = HealthRegistry::new();
        registry.set_status("", HealthStatus::Serving).unwrap();
        let stream = registry.watch("");
        drop(stream);

        assert_eq!(registry.watcher_count(""), 0);
        registry.set_status("", HealthStatus::NotServing).unwrap();
        registry.shutdown().unwrap();
    }
}
