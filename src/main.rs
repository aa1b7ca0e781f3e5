use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::event;
use tracing::Level;

use tempdevice::client::{self, ClientOptions};
use tempdevice::command;
use tempdevice::config::{Cli, DeviceConfig};
use tempdevice::error::DeviceError;
use tempdevice::pause::PauseState;
use tempdevice::producer;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        event!(Level::ERROR, "{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), DeviceError> {
    let config = DeviceConfig::resolve(&cli)?;
    event!(
        Level::DEBUG,
        host = %config.connection.host_name,
        port = config.connection.port,
        device_id = %config.connection.device_id,
        "Loaded configuration"
    );

    let options =
        ClientOptions::from_connection_string(&config.connection).with_keep_alive(config.keep_alive);
    let (client, inbound) = client::connect(options).await?;

    let pause = Arc::new(PauseState::new());
    let cancel = CancellationToken::new();

    let dispatcher = tokio::spawn(command::dispatch(
        client.clone(),
        inbound,
        pause.clone(),
        cancel.clone(),
    ));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            event!(Level::INFO, "Shutting down");
            shutdown.cancel();
        }
    });

    event!(
        Level::INFO,
        "Sending gradual temperature telemetry. Send a cloud-to-device message with 'pause' to pause telemetry."
    );

    let result = producer::run(&client, &pause, &cancel).await;

    cancel.cancel();
    command::join(dispatcher).await;
    client.disconnect().await;

    let published = result?;
    event!(Level::INFO, published, "Telemetry stopped");
    Ok(())
}
