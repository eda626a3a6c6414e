use anyhow::Context;
use envconfig::Envconfig;
use sample_client::config::Config;
use sample_client::runtime::ClientRuntime;
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

    tracing::info!("Starting sample-client");
    tracing::info!("Server URL: {}", config.server_url);
    tracing::info!("Health service: {:?}", config.health_service);

    let runtime = ClientRuntime::connect(&config)?;
    tokio::select! {
        result = runtime.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, abandoning stream");
            return Ok(());
        }
    }

    tracing::info!("Client finished");
    Ok(())
}
