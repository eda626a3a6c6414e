//! `grpc.health.v1.Health` service backed by a [`HealthRegistry`].

use std::pin::Pin;

use futures::{future, Stream, StreamExt};
use tonic::{Request, Response, Status};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_server::{Health, HealthServer};
use tonic_health::pb::{HealthCheckRequest, HealthCheckResponse};
use tracing::debug;

use crate::{HealthRegistry, HealthStatus};

type HealthCheckStream = Pin<Box<dyn Stream<Item = Result<HealthCheckResponse, Status>> + Send>>;

#[derive(Clone)]
pub struct HealthService {
    registry: HealthRegistry,
}

impl HealthService {
    pub fn new(registry: HealthRegistry) -> Self {
        Self { registry }
    }

    pub fn into_server(self) -> HealthServer<Self> {
        HealthServer::new(self)
    }
}

fn to_response(status: HealthStatus) -> HealthCheckResponse {
    let status = match status {
        HealthStatus::Serving => ServingStatus::Serving,
        HealthStatus::NotServing | HealthStatus::Terminated => ServingStatus::NotServing,
        HealthStatus::ServiceUnknown => ServingStatus::ServiceUnknown,
    };
    HealthCheckResponse {
        status: status.into(),
    }
}

#[tonic::async_trait]
impl Health for HealthService {
    async fn check(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<HealthCheckResponse>, Status> {
        let service = request.into_inner().service;
        match self.registry.status(&service) {
            Some(HealthStatus::ServiceUnknown) | None => {
                Err(Status::not_found(format!("unknown service: {service:?}")))
            }
            Some(status) => Ok(Response::new(to_response(status))),
        }
    }

    type WatchStream = HealthCheckStream;

    async fn watch(
        &self,
        request: Request<HealthCheckRequest>,
    ) -> Result<Response<Self::WatchStream>, Status> {
        let service = request.into_inner().service;
        debug!(service = %service, "health watch opened");

        // Terminated is never sent on the wire, it ends the stream with OK trailers.
        let stream: HealthCheckStream = Box::pin(
            self.registry
                .watch(&service)
                .take_while(|status| future::ready(*status != HealthStatus::Terminated))
                .map(|status| Ok(to_response(status))),
        );

        Ok(Response::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::transport::{Channel, Server};
    use tonic_health::pb::health_client::HealthClient;

    #[tokio::test]
    async fn check_reports_registered_status() {
        let registry = HealthRegistry::new();
        registry.set_status("", HealthStatus::Serving).unwrap();
        let service = HealthService::new(registry.clone());

        let response = service
            .check(Request::new(HealthCheckRequest {
                service: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.status, i32::from(ServingStatus::Serving));

        registry.terminate().unwrap();
        let response = service
            .check(Request::new(HealthCheckRequest {
                service: String::new(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.status, i32::from(ServingStatus::NotServing));
    }

    #[tokio::test]
    async fn check_unknown_service_is_not_found() {
        let service = HealthService::new(HealthRegistry::new());
        let status = service
            .check(Request::new(HealthCheckRequest {
                service: "missing".to_string(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[tokio::test]
    async fn watch_over_grpc_ends_cleanly_on_terminate() {
        let registry = HealthRegistry::new();
        registry.set_status("", HealthStatus::Serving).unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HealthService::new(registry.clone()).into_server();
        tokio::spawn(async move {
            Server::builder()
                .add_service(server)
                .serve_with_incoming(tokio_stream::wrappers::TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        let channel = Channel::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
            .expect("Failed to connect to test server");
        let mut client = HealthClient::new(channel);
        let mut stream = client
            .watch(HealthCheckRequest {
                service: String::new(),
            })
            .await
            .unwrap()
            .into_inner();

        let first = stream.message().await.unwrap().unwrap();
        assert_eq!(first.status, i32::from(ServingStatus::Serving));

        registry.shutdown().unwrap();
        let second = stream.message().await.unwrap().unwrap();
        assert_eq!(second.status, i32::from(ServingStatus::NotServing));

        registry.terminate().unwrap();
        assert!(stream.message().await.unwrap().is_none());
    }
}
