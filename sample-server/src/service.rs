use std::sync::atomic::{AtomicU64, Ordering};

use lifecycle::ReleaseListener;
use sample_proto::sample::sample_service_server::SampleService;
use sample_proto::sample::{Request, Response};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::Status;
use tracing::debug;

use crate::session::{SessionId, StreamSession};

const RESPONSE_BUFFER: usize = 16;

/// Accepts `ProcessMessage` calls and runs each one as a [`StreamSession`]
/// on the server's task tracker.
pub struct SessionService {
    release: ReleaseListener,
    abort: CancellationToken,
    sessions: TaskTracker,
    next_id: AtomicU64,
}

impl SessionService {
    pub fn new(release: ReleaseListener, abort: CancellationToken, sessions: TaskTracker) -> Self {
        Self {
            release,
            abort,
            sessions,
            next_id: AtomicU64::new(1),
        }
    }
}

#[tonic::async_trait]
impl SampleService for SessionService {
    type ProcessMessageStream = ReceiverStream<Result<Response, Status>>;

    async fn process_message(
        &self,
        request: tonic::Request<tonic::Streaming<Request>>,
    ) -> Result<tonic::Response<Self::ProcessMessageStream>, Status> {
        if self.abort.is_cancelled() {
            return Err(Status::unavailable("server is shutting down"));
        }

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let session = StreamSession::new(
            SessionId(self.next_id.fetch_add(1, Ordering::Relaxed)),
            self.release.clone(),
            self.abort.child_token(),
            tx.clone(),
        );
        let id = session.id();
        let inbound = request.into_inner();

        self.sessions.spawn(async move {
            if let Err(status) = session.run(inbound).await {
                // The client may already be gone, nothing left to tell it then.
                if tx.send(Err(status)).await.is_err() {
                    debug!(session = %id, "response stream closed before final status");
                }
            }
        });

        Ok(tonic::Response::new(ReceiverStream::new(rx)))
    }
}
