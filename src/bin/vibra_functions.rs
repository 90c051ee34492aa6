//! Functions service worker: consumes platform events until SIGINT/SIGTERM.

use tracing::{error, info};
use vibra_bus::functions::{FunctionHandlers, InMemoryNotifications, InMemoryStats};
use vibra_bus::{AmqpTransport, BusClient, BusConfig, EventConsumer};

#[tokio::main]
async fn main() {
    vibra_bus::logging::init();

    let config = match BusConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            std::process::exit(2);
        }
    };
    info!(broker = %config.redacted_url(), exchange = %config.exchange, "starting functions worker");

    let client = BusClient::new(AmqpTransport::new(config.broker_url.clone()), config.client_options());
    let consumer = EventConsumer::new(client.clone(), config.consumer_options());
    let handlers = FunctionHandlers::new(InMemoryStats::new(), InMemoryNotifications::new());
    if let Err(err) = handlers.register(&consumer).await {
        error!(error = %err, "failed to register handlers");
        std::process::exit(1);
    }
    client.open();

    if let Err(err) = wait_for_shutdown_signal().await {
        error!(error = %err, "signal handler failed, shutting down");
    }
    info!("shutdown signal received");

    consumer.shutdown(config.shutdown_grace).await;
    client.close().await;
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
