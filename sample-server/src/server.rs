use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use futures::Stream;
use health::{HealthRegistry, HealthService, HealthStatus};
use lifecycle::{GracefulStop, ReleaseListener};
use sample_proto::sample::sample_service_server::{SampleServiceServer, SERVICE_NAME};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::transport::Server;
use tracing::{error, info};

use crate::error::ServerError;
use crate::service::SessionService;

/// A bound, not yet accepting, gRPC listener.
pub struct ServerRuntime {
    listener: TcpListener,
    local_addr: SocketAddr,
    health: HealthRegistry,
}

impl ServerRuntime {
    pub async fn bind(addr: SocketAddr, health: HealthRegistry) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;
        Ok(Self {
            listener,
            local_addr,
            health,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Marks the process and the sample service Serving, then starts
    /// accepting. The returned handle is the only way to stop the listener.
    pub fn start(self, release: ReleaseListener) -> Result<ServerHandle, ServerError> {
        spawn_server(
            TcpListenerStream::new(self.listener),
            self.local_addr,
            &self.health,
            release,
        )
    }
}

fn spawn_server<I>(
    incoming: I,
    local_addr: SocketAddr,
    health: &HealthRegistry,
    release: ReleaseListener,
) -> Result<ServerHandle, ServerError>
where
    I: Stream<Item = io::Result<TcpStream>> + Send + 'static,
{
    health.set_status("", HealthStatus::Serving)?;
    health.set_status(SERVICE_NAME, HealthStatus::Serving)?;

    let stopping = CancellationToken::new();
    let abort = CancellationToken::new();
    let sessions = TaskTracker::new();
    let service = SessionService::new(release, abort.clone(), sessions.clone());
    let (failure_tx, failure_rx) = oneshot::channel();

    let router = Server::builder()
        .add_service(HealthService::new(health.clone()).into_server())
        .add_service(SampleServiceServer::new(service));

    info!("Starting gRPC server on {}", local_addr);
    let server = {
        let stopping = stopping.clone();
        tokio::spawn(async move {
            let result = router
                .serve_with_incoming_shutdown(incoming, stopping.clone().cancelled_owned())
                .await;
            if stopping.is_cancelled() {
                match result {
                    Ok(()) => info!("gRPC server stopped"),
                    Err(e) => error!(error = %e, "gRPC server exited with error"),
                }
                return;
            }
            // Nobody asked the server to stop.
            let failure = match result {
                Ok(()) => ServerError::Exited,
                Err(e) => ServerError::Transport(e),
            };
            error!(error = %failure, "Failed to serve gRPC");
            if failure_tx.send(failure).is_err() {
                error!("serve failure dropped, nothing is watching the server");
            }
        })
    };

    Ok(ServerHandle {
        local_addr,
        stopping,
        server,
        server_done: false,
        failure: Some(failure_rx),
        sessions,
        abort,
    })
}

/// Resolves only if the server stops serving before a graceful stop was
/// requested.
pub struct ServeFailure {
    rx: Option<oneshot::Receiver<ServerError>>,
}

impl ServeFailure {
    pub async fn wait(self) -> ServerError {
        if let Some(rx) = self.rx {
            if let Ok(failure) = rx.await {
                return failure;
            }
        }
        std::future::pending().await
    }
}

/// Owner of a running server, driven by the shutdown coordinator.
pub struct ServerHandle {
    local_addr: SocketAddr,
    stopping: CancellationToken,
    server: JoinHandle<()>,
    server_done: bool,
    failure: Option<oneshot::Receiver<ServerError>>,
    sessions: TaskTracker,
    abort: CancellationToken,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Watch for the server dying on its own. Only the first call gets a
    /// live watch; later ones never resolve.
    pub fn serve_failure(&mut self) -> ServeFailure {
        ServeFailure {
            rx: self.failure.take(),
        }
    }
}

#[async_trait]
impl GracefulStop for ServerHandle {
    fn begin_graceful_stop(&mut self) {
        self.stopping.cancel();
        self.sessions.close();
    }

    async fn wait_stopped(&mut self) {
        // Polled again after a timeout, so never await a finished JoinHandle twice.
        if !self.server_done {
            if let Err(e) = (&mut self.server).await {
                if !e.is_cancelled() {
                    error!(error = %e, "gRPC server task panicked");
                }
            }
            self.server_done = true;
        }
        self.sessions.wait().await;
    }

    fn force_stop(&mut self) {
        self.stopping.cancel();
        self.abort.cancel();
        self.server.abort();
        self.sessions.close();
    }

    fn in_flight(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifecycle::release_channel;
    use std::time::Duration;

    #[tokio::test]
    async fn listener_ending_before_shutdown_is_reported() {
        let health = HealthRegistry::new();
        let (_release, listener) = release_channel();
        let mut handle = spawn_server(
            tokio_stream::empty::<io::Result<TcpStream>>(),
            "127.0.0.1:0".parse().unwrap(),
            &health,
            listener,
        )
        .unwrap();

        let failure = tokio::time::timeout(Duration::from_secs(5), handle.serve_failure().wait())
            .await
            .expect("early exit was not reported");
        assert!(matches!(failure, ServerError::Exited), "{failure}");
    }

    #[tokio::test]
    async fn requested_stop_is_not_a_failure() {
        let health = HealthRegistry::new();
        let runtime = ServerRuntime::bind("127.0.0.1:0".parse().unwrap(), health)
            .await
            .unwrap();
        let (_release, listener) = release_channel();
        let mut handle = runtime.start(listener).unwrap();
        let failure = handle.serve_failure();

        handle.begin_graceful_stop();
        tokio::time::timeout(Duration::from_secs(5), handle.wait_stopped())
            .await
            .expect("idle server did not stop");
        assert!(
            tokio::time::timeout(Duration::from_millis(200), failure.wait())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn second_failure_watch_never_resolves() {
        let health = HealthRegistry::new();
        let (_release, listener) = release_channel();
        let mut handle = spawn_server(
            tokio_stream::empty::<io::Result<TcpStream>>(),
            "127.0.0.1:0".parse().unwrap(),
            &health,
            listener,
        )
        .unwrap();
        drop(handle.serve_failure());

        assert!(
            tokio::time::timeout(Duration::from_millis(200), handle.serve_failure().wait())
                .await
                .is_err()
        );
    }
}
