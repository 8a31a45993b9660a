//! Publish/subscribe transport abstraction.
//!
//! The [`ConnectionManager`](crate::ConnectionManager) never speaks the wire protocol itself. It
//! drives a [`Transport`], which owns the socket, runs its own background delivery loop and
//! reports broker events back through a registered [`Listener`].
//!
//! # Threading
//!
//! Listener callbacks are invoked from the transport's own thread(s), never from the async
//! runtime. Implementations of [`Listener`] must therefore be [`Send`] + [`Sync`] and must not
//! block.
//!
//! With the `mqtt` feature (on by default) [`MqttTransport`] provides the standard
//! MQTT-over-WebSocket implementation.

#[cfg(feature = "mqtt")]
pub mod mqtt;

use std::fmt;
use std::sync::Arc;

#[cfg(feature = "mqtt")]
pub use mqtt::MqttTransport;

use crate::Result;

/// Return code of an MQTT 3.1.1 CONNACK packet.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectCode {
    /// `0`: connection accepted
    Accepted,
    /// `1`: the broker does not support the requested protocol level
    UnacceptableProtocol,
    /// `2`: the client identifier was rejected
    IdentifierRejected,
    /// `3`: the broker is unavailable
    ServerUnavailable,
    /// `4`: bad user name or password
    BadCredentials,
    /// `5`: the client is not authorized to connect
    NotAuthorized,
}

impl ConnectCode {
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Accepted)
    }

    /// Whether the broker rejected the credentials (return codes `4` and `5`).
    #[must_use]
    pub const fn is_auth_failure(self) -> bool {
        matches!(self, Self::BadCredentials | Self::NotAuthorized)
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Accepted => 0,
            Self::UnacceptableProtocol => 1,
            Self::IdentifierRejected => 2,
            Self::ServerUnavailable => 3,
            Self::BadCredentials => 4,
            Self::NotAuthorized => 5,
        }
    }
}

impl TryFrom<u8> for ConnectCode {
    type Error = crate::error::Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Accepted,
            1 => Self::UnacceptableProtocol,
            2 => Self::IdentifierRejected,
            3 => Self::ServerUnavailable,
            4 => Self::BadCredentials,
            5 => Self::NotAuthorized,
            other => {
                return Err(crate::error::Error::validation(format!(
                    "unknown CONNACK return code {other}"
                )));
            }
        })
    }
}

impl fmt::Display for ConnectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Accepted => "accepted",
            Self::UnacceptableProtocol => "unacceptable protocol version",
            Self::IdentifierRejected => "identifier rejected",
            Self::ServerUnavailable => "server unavailable",
            Self::BadCredentials => "bad user name or password",
            Self::NotAuthorized => "not authorized",
        };
        write!(f, "rc={} {text}", self.as_u8())
    }
}

/// The operations available on a live link.
///
/// This is the half of a transport that listener callbacks and the heartbeat task are allowed to
/// touch; it never blocks.
pub trait Channel: Send + Sync {
    /// Queue `payload` for delivery on `topic`.
    ///
    /// Returns once the transport accepted the publish, not once the broker acknowledged it.
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()>;

    /// Request a subscription to `topic`.
    fn subscribe(&self, topic: &str) -> Result<()>;

    /// Whether the transport currently holds an established link.
    fn is_connected(&self) -> bool;
}

/// Receiver of transport events, invoked from the transport's own thread.
pub trait Listener: Send + Sync + 'static {
    /// The broker answered a connect attempt. `channel` may be used to issue subscriptions.
    fn on_connect(&self, channel: &dyn Channel, code: ConnectCode);

    /// A publish arrived on `topic`.
    fn on_message(&self, topic: &str, payload: &[u8]);
}

/// A full publish/subscribe transport.
///
/// `connect`, `loop_stop` and `disconnect` may block; callers on an async runtime must run them
/// on the blocking pool.
pub trait Transport: Channel + 'static {
    /// Register the listener that receives connect and message callbacks.
    ///
    /// Replaces any previously registered listener.
    fn set_listener(&self, listener: Arc<dyn Listener>);

    /// Establish the link. Blocks until the broker answered or the attempt failed.
    fn connect(&self, host: &str, port: u16) -> Result<()>;

    /// Start the background delivery loop for the current link.
    fn loop_start(&self) -> Result<()>;

    /// Stop the background delivery loop and wait for it to exit. A no-op when not running.
    fn loop_stop(&self);

    /// Close the link. A no-op when not connected.
    fn disconnect(&self) -> Result<()>;
}
