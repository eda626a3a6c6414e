use std::net::SocketAddr;

use anyhow::Context;
use envconfig::Envconfig;
use health::HealthRegistry;
use lifecycle::{release_channel, ShutdownCoordinator, ShutdownOutcome};
use metrics_exporter_prometheus::PrometheusBuilder;
use sample_server::config::Config;
use sample_server::server::ServerRuntime;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::init_from_env().context("Invalid configuration")?;

    // Initialize tracing
    let log_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(log_layer)
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    tracing::info!("Starting sample-server");
    tracing::info!("gRPC address: {}", config.grpc_address);
    tracing::info!("Drain grace: {}ms", config.drain_grace_ms);
    tracing::info!("Stop timeout: {}ms", config.stop_timeout_ms);

    if config.metrics_port != 0 {
        let bind = SocketAddr::from(([0, 0, 0, 0], config.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(bind)
            .install()
            .context("Failed to start metrics exporter")?;
        tracing::info!("Metrics server listening on {}", bind);
    }

    let health = HealthRegistry::new();
    let runtime = ServerRuntime::bind(config.grpc_address, health.clone()).await?;
    let (release, release_listener) = release_channel();
    let mut server = runtime.start(release_listener)?;
    let serve_failure = server.serve_failure();

    let coordinator = ShutdownCoordinator::builder("sample-server")
        .with_drain_grace(config.drain_grace())
        .with_stop_timeout(config.stop_timeout())
        .build(health, release, server);

    let outcome = tokio::select! {
        outcome = coordinator.run() => outcome?,
        failure = serve_failure.wait() => return Err(failure.into()),
    };
    match outcome {
        ShutdownOutcome::Clean => tracing::info!("Server stopped"),
        ShutdownOutcome::Forced => {
            tracing::warn!("Server stopped, remaining streams were forcefully terminated")
        }
    }

    Ok(())
}
