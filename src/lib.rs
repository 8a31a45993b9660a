#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub(crate) mod capture;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub(crate) mod heartbeat;
pub mod topics;
pub mod transport;

pub use connection::{ConnectionManager, ConnectionState};
pub use dispatch::{DecodeError, LoggingHandler, Message, MessageHandler};

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A [`ConnectionManager`] over the standard MQTT-over-WebSocket transport.
#[cfg(feature = "mqtt")]
pub type MqttConnectionManager = ConnectionManager<transport::MqttTransport>;

/// Create a [`MqttConnectionManager`] for `config`.
#[cfg(feature = "mqtt")]
#[must_use]
pub fn mqtt(config: config::Config) -> MqttConnectionManager {
    let transport = transport::MqttTransport::new(&config);
    ConnectionManager::new(config, transport)
}
