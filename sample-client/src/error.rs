use thiserror::Error;
use tonic::Status;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid server url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("failed to open stream: {0}")]
    OpenStream(#[source] Status),
    #[error("stream failed: {0}")]
    Stream(#[source] Status),
    #[error("request stream closed before all messages were sent")]
    RequestStreamClosed,
    #[error("health watch failed: {0}")]
    HealthWatch(#[source] Status),
    #[error("background task failed: {0}")]
    Background(#[from] tokio::task::JoinError),
}
