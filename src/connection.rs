#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::Arc;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use tokio::sync::{Mutex, watch};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
#[cfg(feature = "tracing")]
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::Result;
use crate::capture::CaptureSession;
use crate::config::{Config, ReconnectConfig};
use crate::dispatch::{Dispatcher, MessageHandler};
use crate::error::{Error, Kind};
use crate::heartbeat::Heartbeat;
use crate::transport::{Listener, Transport};

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Attempting to connect
    Connecting,
    /// Successfully connected
    Connected,
    /// Re-establishing the link, either through [`ConnectionManager::reconnect`] or because the
    /// transport lost the link and is retrying on its own
    Reconnecting,
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Manages the lifecycle of one publish/subscribe link.
///
/// The manager owns its [`Transport`] exclusively and is responsible for:
/// - connecting, closing and reconnecting it, strictly one transition at a time
/// - running exactly one heartbeat task while connected
/// - dispatching inbound messages to the installed [`MessageHandler`]
/// - capturing a bounded number of messages for callers that want to wait for them
///
/// Every operation that opened a connection should end with [`ConnectionManager::close`],
/// including its error paths.
///
/// # Example
///
/// ```ignore
/// let manager = ConnectionManager::new(config, transport);
///
/// manager.connect().await?;
/// let result = async {
///     manager.send("heartbeat", "ping")?;
///     manager.receive(5).await
/// }
/// .await;
/// manager.close().await?;
///
/// for payload in result? {
///     println!("{payload}");
/// }
/// ```
pub struct ConnectionManager<T: Transport> {
    config: Config,
    transport: Arc<T>,
    dispatcher: Arc<Dispatcher>,
    /// The running heartbeat. Held for the whole of every lifecycle transition.
    heartbeat: Mutex<Option<Heartbeat>>,
    /// Serializes bounded captures
    capture: Mutex<()>,
    phase: watch::Sender<ConnectionState>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Create a disconnected manager and register it as the transport's listener.
    pub fn new(config: Config, transport: T) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(config.topic().to_owned()));
        let listener: Arc<dyn Listener> = Arc::<Dispatcher>::clone(&dispatcher);
        transport.set_listener(listener);

        Self {
            config,
            transport: Arc::new(transport),
            dispatcher,
            heartbeat: Mutex::new(None),
            capture: Mutex::new(()),
            phase: watch::Sender::new(ConnectionState::Disconnected),
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Connect the transport and start the heartbeat.
    ///
    /// The blocking connect runs on the blocking thread pool. On failure the transport is torn
    /// down again and no heartbeat is left running.
    ///
    /// # Errors
    ///
    /// - [`Kind::Validation`] if the manager is already connected or the heartbeat interval is zero
    /// - [`Kind::Connect`] if the link could not be established
    /// - [`Kind::Auth`] if the broker rejected the credentials
    pub async fn connect(&self) -> Result<()> {
        let mut heartbeat = self.heartbeat.lock().await;
        self.connect_locked(&mut heartbeat, ConnectionState::Connecting)
            .await
    }

    /// Stop the heartbeat, wait for it to exit, then stop and disconnect the transport.
    ///
    /// Safe to call when not connected.
    pub async fn close(&self) -> Result<()> {
        let mut heartbeat = self.heartbeat.lock().await;
        let result = self.close_locked(&mut heartbeat).await;

        #[cfg(feature = "tracing")]
        info!("Connection closed");

        result
    }

    /// [`Self::close`] followed by [`Self::connect`], with no other lifecycle transition able to
    /// interleave.
    ///
    /// Leaves the manager either connected with a fresh heartbeat or disconnected with none.
    pub async fn reconnect(&self) -> Result<()> {
        let mut heartbeat = self.heartbeat.lock().await;

        #[cfg(feature = "tracing")]
        info!("Reconnecting...");

        self.phase.send_replace(ConnectionState::Reconnecting);
        if let Err(e) = self.close_locked(&mut heartbeat).await {
            #[cfg(feature = "tracing")]
            warn!("Error while closing before reconnect: {e}");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }

        self.connect_locked(&mut heartbeat, ConnectionState::Reconnecting)
            .await?;

        #[cfg(feature = "tracing")]
        info!("Reconnected");

        Ok(())
    }

    async fn connect_locked(
        &self,
        heartbeat: &mut Option<Heartbeat>,
        phase: ConnectionState,
    ) -> Result<()> {
        if heartbeat.is_some() {
            return Err(Error::validation(
                "already connected, close the connection first",
            ));
        }
        if self.config.heartbeat_interval().is_zero() {
            return Err(Error::validation("heartbeat interval must be greater than zero"));
        }

        self.phase.send_replace(phase);

        if let Err(e) = self.open().await {
            #[cfg(feature = "tracing")]
            error!(host = %self.config.host(), "Unable to connect: {e}");

            if let Err(teardown) = self.shutdown_transport().await {
                #[cfg(feature = "tracing")]
                debug!("Error tearing down failed connect: {teardown}");
                #[cfg(not(feature = "tracing"))]
                let _ = &teardown;
            }
            self.phase.send_replace(ConnectionState::Disconnected);
            return Err(e);
        }

        let task = Heartbeat::start(
            Arc::clone(&self.transport),
            self.config.heartbeat_topic().to_owned(),
            self.config.heartbeat_payload().to_owned(),
            self.config.heartbeat_interval(),
        );

        #[cfg(feature = "tracing")]
        info!(host = %self.config.host(), heartbeat = %task.id(), "Connected");

        *heartbeat = Some(task);
        self.phase.send_replace(ConnectionState::Connected);

        Ok(())
    }

    async fn close_locked(&self, heartbeat: &mut Option<Heartbeat>) -> Result<()> {
        if let Some(task) = heartbeat.take() {
            #[cfg(feature = "tracing")]
            let id = task.id();

            task.cancel_and_wait().await;

            #[cfg(feature = "tracing")]
            debug!(heartbeat = %id, "Heartbeat stopped");
        }

        let result = self.shutdown_transport().await;
        self.phase.send_replace(ConnectionState::Disconnected);
        result
    }

    /// Blocking connect, broker answer check, then the delivery loop.
    async fn open(&self) -> Result<()> {
        self.dispatcher.clear_refusal();

        let transport = Arc::clone(&self.transport);
        let host = self.config.host().to_owned();
        let port = self.config.port();
        tokio::task::spawn_blocking(move || transport.connect(&host, port)).await??;

        // Transports that only learn about a refusal through the callback still end up here.
        if let Some(code) = self.dispatcher.take_refusal() {
            return Err(Error::refused(code));
        }

        self.transport.loop_start()
    }

    async fn shutdown_transport(&self) -> Result<()> {
        let transport = Arc::clone(&self.transport);
        tokio::task::spawn_blocking(move || {
            transport.loop_stop();
            transport.disconnect()
        })
        .await?
    }

    /// Publish `payload` to `topic`.
    ///
    /// Returns once the transport accepted the message for delivery; there is no broker
    /// acknowledgement at this layer.
    ///
    /// # Errors
    ///
    /// [`Kind::Publish`] if the transport did not accept the message, e.g. when not connected.
    pub fn send<P: AsRef<[u8]>>(&self, topic: &str, payload: P) -> Result<()> {
        self.transport.publish(topic, payload.as_ref())?;

        #[cfg(feature = "tracing")]
        info!(%topic, "Message sent");

        Ok(())
    }

    /// Whether the transport currently holds an established link.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        match *self.phase.borrow() {
            ConnectionState::Connected if !self.transport.is_connected() => {
                ConnectionState::Reconnecting
            }
            phase => phase,
        }
    }

    /// Subscribe to lifecycle state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.phase.subscribe()
    }

    /// The currently installed message handler.
    #[must_use]
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        self.dispatcher.handler()
    }

    /// Install `handler` for subsequent messages, returning the one it replaced.
    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
        self.dispatcher.replace_handler(handler)
    }

    /// Identifier of the running heartbeat task, if any.
    pub async fn heartbeat_id(&self) -> Option<Uuid> {
        self.heartbeat.lock().await.as_ref().map(Heartbeat::id)
    }

    /// Wait for `limit` inbound messages and return their raw payloads in arrival order.
    ///
    /// Messages keep flowing to the previously installed handler while capturing; it is
    /// reinstated when this returns or when the future is dropped. Malformed payloads are dropped
    /// before capture and do not count towards `limit`.
    ///
    /// There is no timeout: wrap the call in [`tokio::time::timeout`] or use
    /// [`Self::receive_until`] when fewer messages may arrive.
    ///
    /// # Errors
    ///
    /// [`Kind::Validation`] if `limit` is zero.
    pub async fn receive(&self, limit: usize) -> Result<Vec<String>> {
        self.receive_until(limit, &CancellationToken::new()).await
    }

    /// Like [`Self::receive`], but returns whatever was captured so far once `cancellation`
    /// fires.
    pub async fn receive_until(
        &self,
        limit: usize,
        cancellation: &CancellationToken,
    ) -> Result<Vec<String>> {
        if limit == 0 {
            return Err(Error::validation("message limit must be greater than zero"));
        }

        let _capture = self.capture.lock().await;
        let session = CaptureSession::begin(&self.dispatcher, limit);

        #[cfg(feature = "tracing")]
        info!("Waiting to receive {limit} messages...");

        tokio::select! {
            () = session.completed() => {},
            () = cancellation.cancelled() => {
                #[cfg(feature = "tracing")]
                info!("Message waiting was cancelled");
            }
        }

        let messages = session.finish();

        #[cfg(feature = "tracing")]
        info!("Received {} messages", messages.len());

        Ok(messages)
    }

    /// Keep the link up until `shutdown` fires.
    ///
    /// Every [`ReconnectConfig::check_interval`] the link is checked; when it is down,
    /// [`Self::reconnect`] is retried with exponential backoff. A rejected authentication ends
    /// supervision immediately, as does exhausting [`ReconnectConfig::max_attempts`].
    ///
    /// # Errors
    ///
    /// - [`Kind::Validation`] if the check interval is zero
    /// - the [`Kind::Auth`] error of a rejected reconnect
    /// - the last [`Kind::Connect`] error once attempts are exhausted
    pub async fn supervise(
        &self,
        reconnect: ReconnectConfig,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        if reconnect.check_interval.is_zero() {
            return Err(Error::validation("check interval must be greater than zero"));
        }

        let mut backoff: ExponentialBackoff = reconnect.clone().into();
        let mut attempt = 0_u32;
        let mut check = time::interval(reconnect.check_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                () = shutdown.cancelled() => return Ok(()),
                _ = check.tick() => {}
            }

            if self.is_connected() {
                continue;
            }

            loop {
                #[cfg(feature = "tracing")]
                warn!(attempt = attempt.saturating_add(1), "Link is down, reconnecting");

                match self.reconnect().await {
                    Ok(()) => {
                        attempt = 0;
                        backoff.reset();
                        break;
                    }
                    Err(e) if e.kind() == Kind::Auth => return Err(e),
                    Err(e) => {
                        attempt = attempt.saturating_add(1);
                        if let Some(max) = reconnect.max_attempts
                            && attempt >= max
                        {
                            return Err(e);
                        }

                        let delay = backoff.next_backoff().unwrap_or(reconnect.max_backoff);
                        tokio::select! {
                            biased;

                            () = shutdown.cancelled() => return Ok(()),
                            () = time::sleep(delay) => {}
                        }
                    }
                }
            }
        }
    }
}
