//! Client-side view of the connection to the server.
//!
//! The tonic channel dials through [`TrackedConnector`], which reports dial
//! results and socket EOF/errors to a [`ConnectivityMonitor`]. The monitor
//! keeps only the latest state, so observers see transitions, not history.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use http::Uri;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tower::Service;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    /// Terminal, set when the client closes.
    Shutdown,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectivityState::Idle => "IDLE",
            ConnectivityState::Connecting => "CONNECTING",
            ConnectivityState::Ready => "READY",
            ConnectivityState::TransientFailure => "TRANSIENT_FAILURE",
            ConnectivityState::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: Arc<watch::Sender<ConnectivityState>>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectivityMonitor {
    pub fn new() -> Self {
        Self {
            state: Arc::new(watch::Sender::new(ConnectivityState::Idle)),
        }
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state.borrow()
    }

    /// Resolves with the new state as soon as it differs from `from`.
    pub async fn wait_for_state_change(&self, from: ConnectivityState) -> ConnectivityState {
        let mut rx = self.state.subscribe();
        let next = match rx.wait_for(|state| *state != from).await {
            Ok(state) => *state,
            Err(_) => ConnectivityState::Shutdown,
        };
        next
    }

    pub fn shutdown(&self) {
        self.transition(ConnectivityState::Shutdown);
    }

    pub(crate) fn transition(&self, next: ConnectivityState) {
        self.state.send_if_modified(|current| {
            if *current == next || *current == ConnectivityState::Shutdown {
                return false;
            }
            debug!(from = %current, to = %next, "connectivity state transition");
            *current = next;
            true
        });
    }
}

/// Socket wrapper that reports EOF and IO errors to the monitor.
pub struct TrackedStream<S = TcpStream> {
    inner: S,
    monitor: ConnectivityMonitor,
}

impl<S> TrackedStream<S> {
    pub fn new(inner: S, monitor: ConnectivityMonitor) -> Self {
        Self { inner, monitor }
    }

    fn observe<T>(&self, result: &Poll<io::Result<T>>) {
        if let Poll::Ready(Err(_)) = result {
            self.monitor.transition(ConnectivityState::TransientFailure);
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TrackedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let had_room = buf.remaining() > 0;
        let result = Pin::new(&mut this.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            if had_room && buf.filled().len() == before {
                // Peer closed the connection.
                this.monitor.transition(ConnectivityState::Idle);
            }
        }
        this.observe(&result);
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TrackedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.observe(&result);
        result
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        this.observe(&result);
        result
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_flush(cx);
        this.observe(&result);
        result
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = Pin::new(&mut this.inner).poll_shutdown(cx);
        this.observe(&result);
        result
    }
}

impl<S> Drop for TrackedStream<S> {
    fn drop(&mut self) {
        self.monitor.transition(ConnectivityState::Idle);
    }
}

/// Connector for `Endpoint::connect_with_connector_lazy` that dials plain TCP
/// and publishes every dial attempt to the monitor.
#[derive(Clone)]
pub struct TrackedConnector {
    monitor: ConnectivityMonitor,
    connect_timeout: Duration,
}

impl TrackedConnector {
    pub fn new(monitor: ConnectivityMonitor, connect_timeout: Duration) -> Self {
        Self {
            monitor,
            connect_timeout,
        }
    }
}

type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TokioIo<TrackedStream>>> + Send>>;

impl Service<Uri> for TrackedConnector {
    type Response = TokioIo<TrackedStream>;
    type Error = io::Error;
    type Future = ConnectFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let monitor = self.monitor.clone();
        let connect_timeout = self.connect_timeout;
        Box::pin(async move {
            let host = uri
                .host()
                .map(|host| host.trim_start_matches('[').trim_end_matches(']').to_string())
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "server url has no host"))?;
            let port = uri.port_u16().unwrap_or(80);

            monitor.transition(ConnectivityState::Connecting);
            let dial = TcpStream::connect((host.as_str(), port));
            let stream = match tokio::time::timeout(connect_timeout, dial).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(error = %e, "dial failed");
                    monitor.transition(ConnectivityState::TransientFailure);
                    return Err(e);
                }
                Err(_) => {
                    monitor.transition(ConnectivityState::TransientFailure);
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out"));
                }
            };
            stream.set_nodelay(true)?;
            monitor.transition(ConnectivityState::Ready);
            Ok(TokioIo::new(TrackedStream::new(stream, monitor)))
        })
    }
}
