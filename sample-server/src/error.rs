use std::net::SocketAddr;

use health::HealthError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to bind gRPC listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to publish serving status: {0}")]
    Health(#[from] HealthError),
    #[error("gRPC transport failed: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("gRPC server stopped accepting before shutdown was requested")]
    Exited,
}
