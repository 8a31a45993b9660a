//! Inbound message decoding and handler dispatch.
//!
//! The transport delivers raw publishes on its own thread. The [`Dispatcher`] decodes them and
//! forwards each [`Message`] to whichever [`MessageHandler`] is currently installed in its slot.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;
use serde_json::Value;
#[cfg(feature = "tracing")]
use tracing::{error, info, warn};

use crate::transport::{Channel, ConnectCode, Listener};

/// A decoded inbound publish.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub topic: String,
    /// The payload exactly as received, as UTF-8 text
    pub raw: String,
    /// The payload parsed as JSON
    pub payload: Value,
}

impl Message {
    /// Decode a raw payload. Fails when it is not UTF-8 JSON.
    pub fn decode(topic: &str, payload: &[u8]) -> Result<Self, DecodeError> {
        let raw = std::str::from_utf8(payload).map_err(DecodeError::Utf8)?;
        let value = serde_json::from_str(raw).map_err(DecodeError::Json)?;

        Ok(Self {
            topic: topic.to_owned(),
            raw: raw.to_owned(),
            payload: value,
        })
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub enum DecodeError {
    Utf8(std::str::Utf8Error),
    Json(serde_json::Error),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Utf8(e) => write!(f, "payload is not UTF-8: {e}"),
            Self::Json(e) => write!(f, "payload is not JSON: {e}"),
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Utf8(e) => Some(e),
            Self::Json(e) => Some(e),
        }
    }
}

/// Invoked once per inbound message, on the transport's thread.
///
/// Implemented for every `Fn(&Message) + Send + Sync` closure; such handlers ignore malformed
/// payloads.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: &Message);

    /// A payload on `topic` that could not be decoded.
    fn handle_malformed(&self, _topic: &str, _payload: &[u8], _error: &DecodeError) {}
}

impl<F> MessageHandler for F
where
    F: Fn(&Message) + Send + Sync + 'static,
{
    fn handle(&self, message: &Message) {
        self(message);
    }
}

/// The handler installed by default: logs every message.
#[non_exhaustive]
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl MessageHandler for LoggingHandler {
    fn handle(&self, message: &Message) {
        #[cfg(feature = "tracing")]
        info!(topic = %message.topic, payload = %message.payload, "Received message");
        #[cfg(not(feature = "tracing"))]
        let _ = message;
    }

    fn handle_malformed(&self, topic: &str, payload: &[u8], error: &DecodeError) {
        #[cfg(feature = "tracing")]
        warn!(%topic, bytes = payload.len(), "Dropping malformed message: {error}");
        #[cfg(not(feature = "tracing"))]
        let _ = (topic, payload, error);
    }
}

/// Routes transport callbacks to the installed handler.
pub(crate) struct Dispatcher {
    topic: String,
    handler: RwLock<Arc<dyn MessageHandler>>,
    /// Refusal reported by the broker for the current connect attempt
    refusal: Mutex<Option<ConnectCode>>,
}

impl Dispatcher {
    pub(crate) fn new(topic: String) -> Self {
        Self {
            topic,
            handler: RwLock::new(Arc::new(LoggingHandler)),
            refusal: Mutex::new(None),
        }
    }

    pub(crate) fn handler(&self) -> Arc<dyn MessageHandler> {
        Arc::clone(&self.handler.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Install `handler`, returning the one it replaced.
    pub(crate) fn replace_handler(
        &self,
        handler: Arc<dyn MessageHandler>,
    ) -> Arc<dyn MessageHandler> {
        let mut slot = self.handler.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, handler)
    }

    /// Install a handler built from the current one, atomically with respect to deliveries.
    ///
    /// Returns the handler that was replaced.
    pub(crate) fn compose_handler<F>(&self, build: F) -> Arc<dyn MessageHandler>
    where
        F: FnOnce(Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler>,
    {
        let mut slot = self.handler.write().unwrap_or_else(PoisonError::into_inner);
        let previous = Arc::clone(&slot);
        *slot = build(Arc::clone(&previous));
        previous
    }

    /// Put `previous` back, but only while `installed` is still the active handler.
    ///
    /// Returns `false` when somebody replaced `installed` in the meantime; their handler is kept.
    pub(crate) fn restore_handler(
        &self,
        installed: &Arc<dyn MessageHandler>,
        previous: Arc<dyn MessageHandler>,
    ) -> bool {
        let mut slot = self.handler.write().unwrap_or_else(PoisonError::into_inner);
        if Arc::ptr_eq(&slot, installed) {
            *slot = previous;
            true
        } else {
            false
        }
    }

    pub(crate) fn clear_refusal(&self) {
        self.refusal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    pub(crate) fn take_refusal(&self) -> Option<ConnectCode> {
        self.refusal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Listener for Dispatcher {
    fn on_connect(&self, channel: &dyn Channel, code: ConnectCode) {
        if code.is_success() {
            #[cfg(feature = "tracing")]
            info!(topic = %self.topic, "Connected, subscribing");
            if let Err(e) = channel.subscribe(&self.topic) {
                #[cfg(feature = "tracing")]
                error!(topic = %self.topic, "Unable to subscribe: {e}");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
            return;
        }

        #[cfg(feature = "tracing")]
        if code.is_auth_failure() {
            error!(%code, "Authentication failed. Check username, secret and IP whitelist");
        } else {
            error!(%code, "Connection refused by broker");
        }

        *self.refusal.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        // Clone out of the slot so a handler swap never waits on a slow handler.
        let handler = self.handler();
        match Message::decode(topic, payload) {
            Ok(message) => handler.handle(&message),
            Err(e) => handler.handle_malformed(topic, payload, &e),
        }
    }
}
