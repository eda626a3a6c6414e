use sample_proto::sample::sample_service_client::SampleServiceClient;
use sample_proto::sample::Request;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tonic_health::pb::health_check_response::ServingStatus;
use tonic_health::pb::health_client::HealthClient;
use tonic_health::pb::HealthCheckRequest;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::connectivity::{ConnectivityMonitor, ConnectivityState, TrackedConnector};
use crate::error::ClientError;

/// One duplex exchange with the sample server, plus two background loops
/// that report health and connectivity while it runs.
pub struct ClientRuntime {
    channel: Channel,
    connectivity: ConnectivityMonitor,
    health_service: String,
    payloads: Vec<String>,
}

impl ClientRuntime {
    /// Builds the channel without dialing; the first call connects.
    pub fn connect(config: &Config) -> Result<Self, ClientError> {
        let endpoint = Endpoint::from_shared(config.server_url.clone()).map_err(|source| {
            ClientError::InvalidUrl {
                url: config.server_url.clone(),
                source,
            }
        })?;
        let connectivity = ConnectivityMonitor::new();
        let channel = endpoint.connect_with_connector_lazy(TrackedConnector::new(
            connectivity.clone(),
            config.connect_timeout(),
        ));

        Ok(Self {
            channel,
            connectivity,
            health_service: config.health_service.clone(),
            payloads: config.payloads(),
        })
    }

    pub fn connectivity(&self) -> ConnectivityMonitor {
        self.connectivity.clone()
    }

    /// Runs the exchange to completion. The first transport error, from the
    /// exchange or from the health watch, ends the run.
    pub async fn run(self) -> Result<(), ClientError> {
        let cancel = CancellationToken::new();
        let mut background = JoinSet::new();
        background.spawn(watch_health(
            self.channel.clone(),
            self.health_service.clone(),
            cancel.child_token(),
        ));
        background.spawn(observe_connectivity(
            self.connectivity.clone(),
            cancel.child_token(),
        ));

        let exchange = exchange_messages(self.channel.clone(), self.payloads.clone());
        tokio::pin!(exchange);

        let result = loop {
            tokio::select! {
                result = &mut exchange => break result,
                Some(joined) = background.join_next() => {
                    if let Err(e) = flatten(joined) {
                        break Err(e);
                    }
                }
            }
        };

        cancel.cancel();
        self.connectivity.shutdown();
        while let Some(joined) = background.join_next().await {
            if let Err(e) = flatten(joined) {
                debug!(error = %e, "background task failed during teardown");
            }
        }
        drop(self.channel);

        result
    }
}

fn flatten(joined: Result<Result<(), ClientError>, JoinError>) -> Result<(), ClientError> {
    joined?
}

async fn exchange_messages(channel: Channel, payloads: Vec<String>) -> Result<(), ClientError> {
    let mut client = SampleServiceClient::new(channel);
    let (tx, rx) = mpsc::channel(payloads.len().max(1));
    let mut inbound = client
        .process_message(ReceiverStream::new(rx))
        .await
        .map_err(ClientError::OpenStream)?
        .into_inner();
    info!("Client opened stream");

    let send = async move {
        for payload in payloads {
            info!(payload = %payload, "Sending message to server");
            if tx.send(Request { payload }).await.is_err() {
                return Err(ClientError::RequestStreamClosed);
            }
        }
        // Dropping the sender half-closes the stream.
        drop(tx);
        info!("Client completed sending messages");
        Ok(())
    };

    let receive = async move {
        while let Some(response) = inbound.message().await.map_err(ClientError::Stream)? {
            info!(payload = %response.payload, "Received message from server");
        }
        info!("Server closed the stream");
        Ok::<(), ClientError>(())
    };

    tokio::try_join!(send, receive)?;
    Ok(())
}

async fn watch_health(
    channel: Channel,
    service: String,
    cancel: CancellationToken,
) -> Result<(), ClientError> {
    let mut client = HealthClient::new(channel);
    let request = HealthCheckRequest { service };
    let mut stream = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        response = client.watch(request) => response.map_err(ClientError::HealthWatch)?.into_inner(),
    };

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("health watch cancelled");
                return Ok(());
            }
            message = stream.message() => message.map_err(ClientError::HealthWatch)?,
        };
        match message {
            Some(response) => info!(
                "Received health status: {}",
                status_name(response.status)
            ),
            None => {
                info!("Server closed health stream");
                return Ok(());
            }
        }
    }
}

fn status_name(status: i32) -> &'static str {
    match ServingStatus::try_from(status) {
        Ok(status) => status.as_str_name(),
        Err(_) => {
            warn!(status, "unrecognized serving status");
            "UNRECOGNIZED"
        }
    }
}

async fn observe_connectivity(
    monitor: ConnectivityMonitor,
    cancel: CancellationToken,
) -> Result<(), ClientError> {
    let mut state = monitor.state();
    loop {
        info!("Connection state: {}", state);
        if state == ConnectivityState::Shutdown {
            return Ok(());
        }
        state = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            next = monitor.wait_for_state_change(state) => next,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_match_wire_names() {
        assert_eq!(status_name(i32::from(ServingStatus::Serving)), "SERVING");
        assert_eq!(status_name(i32::from(ServingStatus::NotServing)), "NOT_SERVING");
        assert_eq!(status_name(42), "UNRECOGNIZED");
    }

    #[tokio::test]
    async fn connectivity_loop_ends_on_cancel() {
        let monitor = ConnectivityMonitor::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(observe_connectivity(monitor.clone(), cancel.clone()));

        monitor.transition(ConnectivityState::Connecting);
        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn connectivity_loop_ends_on_shutdown() {
        let monitor = ConnectivityMonitor::new();
        let task = tokio::spawn(observe_connectivity(monitor.clone(), CancellationToken::new()));

        monitor.shutdown();
        task.await.unwrap().unwrap();
    }

    #[test]
    fn invalid_url_is_rejected() {
        let config = Config {
            server_url: "not a url".to_string(),
            health_service: String::new(),
            payloads: "foo".to_string(),
            connect_timeout_ms: 100,
        };
        assert!(matches!(
            ClientRuntime::connect(&config),
            Err(ClientError::InvalidUrl { .. })
        ));
    }
}
