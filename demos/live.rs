//! Live feed walkthrough: connect, ping, force a reconnect, ping again and capture five messages.
//!
//! Configure the broker through the environment and run with tracing enabled:
//! ```sh
//! LIVEFEED_USERNAME=user LIVEFEED_SECRET=secret LIVEFEED_TOPIC=football \
//!     RUST_LOG=info,livefeed_client=debug cargo run --example live --features tracing
//! ```
//!
//! Optionally log to a file:
//! ```sh
//! LOG_FILE=live.log RUST_LOG=info cargo run --example live --features tracing
//! ```

use std::fs::File;
use std::time::Duration;

use livefeed_client::config::Config;
use livefeed_client::{MqttConnectionManager, topics};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const CAPTURE_LIMIT: usize = 5;
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(path) = std::env::var("LOG_FILE") {
        let file = File::create(path)?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let config = Config::from_env()?;
    info!(url = %config.broker_url()?, topic = %config.topic(), "Starting live feed test");

    let manager = livefeed_client::mqtt(config);

    let result = run(&manager).await;
    if let Err(e) = &result {
        error!("Error during live feed test: {e}");
    }

    manager.close().await?;
    info!("Connection closed");

    result
}

async fn run(manager: &MqttConnectionManager) -> anyhow::Result<()> {
    manager.connect().await?;
    manager.send(topics::HEARTBEAT, topics::HEARTBEAT_PAYLOAD)?;
    info!("Ping sent");

    tokio::time::sleep(Duration::from_secs(5)).await;

    manager.reconnect().await?;
    manager.send(topics::HEARTBEAT, topics::HEARTBEAT_PAYLOAD)?;
    info!("Second ping sent, waiting for messages");

    let Ok(messages) = tokio::time::timeout(CAPTURE_TIMEOUT, manager.receive(CAPTURE_LIMIT)).await
    else {
        warn!(timeout = ?CAPTURE_TIMEOUT, "No messages received");
        return Ok(());
    };

    for (i, payload) in messages?.iter().enumerate() {
        info!(index = i + 1, %payload, "Received message");
    }

    Ok(())
}
