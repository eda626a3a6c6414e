use std::fmt;

use futures::{Stream, StreamExt};
use lifecycle::ReleaseListener;
use sample_proto::sample::{Request, Response};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Lifecycle of one duplex call. Only ever moves forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Client may still send.
    Open,
    /// Client half-closed, the session is parked until release.
    Draining,
    Closed,
}

/// What ended the wait after end-of-stream.
enum Parked {
    Released,
    Aborted,
    /// tonic dropped the response stream: the client cancelled or disconnected.
    CallGone,
}

/// Server side of one `ProcessMessage` call.
///
/// Inbound payloads are echoed on `responses`. Once the client half-closes
/// the session does not end the call on its own: it parks until the shutdown
/// coordinator releases it, or until its abort token is cancelled by a force
/// stop.
pub struct StreamSession {
    id: SessionId,
    state: SessionState,
    release: ReleaseListener,
    abort: CancellationToken,
    responses: mpsc::Sender<Result<Response, Status>>,
}

impl StreamSession {
    pub fn new(
        id: SessionId,
        release: ReleaseListener,
        abort: CancellationToken,
        responses: mpsc::Sender<Result<Response, Status>>,
    ) -> Self {
        Self {
            id,
            state: SessionState::Open,
            release,
            abort,
            responses,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the call to its single terminal result. `Ok` means the session
    /// was released after the client half-closed; any inbound error ends the
    /// session right away without waiting for release.
    #[tracing::instrument(skip_all, fields(session = %self.id))]
    pub async fn run<S>(mut self, mut inbound: S) -> Result<(), Status>
    where
        S: Stream<Item = Result<Request, Status>> + Unpin,
    {
        info!("Client opened stream");
        loop {
            let next = tokio::select! {
                biased;
                _ = self.abort.cancelled() => None,
                next = inbound.next() => Some(next),
            };
            match next {
                None => return Err(self.aborted()),
                Some(Some(Ok(request))) => {
                    info!(payload = %request.payload, "Received message from client");
                    self.respond(request.payload).await?;
                }
                Some(Some(Err(status))) => {
                    warn!(error = %status, "Stream terminated unexpectedly");
                    self.advance(SessionState::Closed);
                    return Err(status);
                }
                Some(None) => break,
            }
        }

        info!("Client completed sending messages");
        self.advance(SessionState::Draining);

        let parked = tokio::select! {
            biased;
            _ = self.abort.cancelled() => Parked::Aborted,
            _ = self.responses.closed() => Parked::CallGone,
            _ = self.release.released() => Parked::Released,
        };
        match parked {
            Parked::Released => {}
            Parked::Aborted => return Err(self.aborted()),
            Parked::CallGone => {
                info!("Client cancelled the call while parked");
                self.advance(SessionState::Closed);
                return Err(Status::cancelled("call cancelled by client"));
            }
        }

        info!("Session released, closing stream");
        self.advance(SessionState::Closed);
        Ok(())
    }

    async fn respond(&mut self, payload: String) -> Result<(), Status> {
        let sent = tokio::select! {
            biased;
            _ = self.abort.cancelled() => None,
            sent = self.responses.send(Ok(Response { payload })) => Some(sent.is_ok()),
        };
        match sent {
            Some(true) => Ok(()),
            Some(false) => {
                // The response stream is gone, tonic already dropped the call.
                debug!("response stream closed");
                self.advance(SessionState::Closed);
                Err(Status::cancelled("response stream closed"))
            }
            None => Err(self.aborted()),
        }
    }

    fn aborted(&mut self) -> Status {
        warn!(state = ?self.state, "Session aborted by forced shutdown");
        self.advance(SessionState::Closed);
        Status::unavailable("server is shutting down")
    }

    fn advance(&mut self, next: SessionState) {
        if next > self.state {
            debug!(from = ?self.state, to = ?next, "session state transition");
            self.state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lifecycle::release_channel;
    use std::time::Duration;
    use tokio_stream::wrappers::ReceiverStream;

    fn request(payload: &str) -> Result<Request, Status> {
        Ok(Request {
            payload: payload.to_string(),
        })
    }

    struct Harness {
        inbound: mpsc::Sender<Result<Request, Status>>,
        responses: mpsc::Receiver<Result<Response, Status>>,
        abort: CancellationToken,
        run: tokio::task::JoinHandle<Result<(), Status>>,
    }

    fn spawn_session(release: ReleaseListener) -> Harness {
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (responses_tx, responses_rx) = mpsc::channel(8);
        let abort = CancellationToken::new();
        let session = StreamSession::new(SessionId(1), release, abort.child_token(), responses_tx);
        assert_eq!(session.state(), SessionState::Open);
        let run = tokio::spawn(session.run(ReceiverStream::new(inbound_rx)));
        Harness {
            inbound: inbound_tx,
            responses: responses_rx,
            abort,
            run,
        }
    }

    #[tokio::test]
    async fn echoes_each_payload() {
        let (_release, listener) = release_channel();
        let mut harness = spawn_session(listener);

        harness.inbound.send(request("foo")).await.unwrap();
        harness.inbound.send(request("bar")).await.unwrap();

        let first = harness.responses.recv().await.unwrap().unwrap();
        let second = harness.responses.recv().await.unwrap().unwrap();
        assert_eq!(first.payload, "foo");
        assert_eq!(second.payload, "bar");
    }

    #[tokio::test(start_paused = true)]
    async fn half_closed_session_waits_for_release() {
        let (release, listener) = release_channel();
        let mut harness = spawn_session(listener);

        harness.inbound.send(request("foo")).await.unwrap();
        drop(harness.inbound);
        assert_eq!(harness.responses.recv().await.unwrap().unwrap().payload, "foo");

        // Parked: no terminal result however long we wait.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!harness.run.is_finished());

        release.release();
        harness.run.await.unwrap().unwrap();
        assert!(harness.responses.recv().await.is_none());
    }

    #[tokio::test]
    async fn release_before_half_close_does_not_end_session() {
        let (release, listener) = release_channel();
        let harness = spawn_session(listener);
        release.release();

        harness.inbound.send(request("late")).await.unwrap();
        tokio::task::yield_now().await;
        assert!(!harness.run.is_finished());

        drop(harness.inbound);
        harness.run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn inbound_error_returns_immediately() {
        let (_release, listener) = release_channel();
        let harness = spawn_session(listener);

        harness
            .inbound
            .send(Err(Status::internal("connection reset")))
            .await
            .unwrap();
        let status = harness.run.await.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[tokio::test]
    async fn abort_interrupts_open_session() {
        let (_release, listener) = release_channel();
        let harness = spawn_session(listener);

        harness.abort.cancel();
        let status = harness.run.await.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn abort_interrupts_parked_session() {
        let (_release, listener) = release_channel();
        let harness = spawn_session(listener);
        drop(harness.inbound);
        tokio::task::yield_now().await;

        harness.abort.cancel();
        let status = harness.run.await.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Unavailable);
    }

    #[tokio::test]
    async fn dropped_response_stream_ends_session() {
        let (_release, listener) = release_channel();
        let harness = spawn_session(listener);
        drop(harness.responses);

        harness.inbound.send(request("foo")).await.unwrap();
        let status = harness.run.await.unwrap().unwrap_err();
        assert_eq!(status.code(), tonic::Code::Cancelled);
    }

    #[tokio::test]
    async fn cancelled_call_ends_parked_session() {
        let (_release, listener) = release_channel();
        let harness = spawn_session(listener);
        drop(harness.inbound);
        tokio::task::yield_now().await;

        drop(harness.responses);
        let status = tokio::time::timeout(Duration::from_secs(5), harness.run)
            .await
            .expect("parked session outlived its call")
            .unwrap()
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::Cancelled);
    }

    #[test]
    fn session_states_are_ordered() {
        assert!(SessionState::Open < SessionState::Draining);
        assert!(SessionState::Draining < SessionState::Closed);
    }
}
