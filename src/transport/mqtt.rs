//! MQTT v3.1.1 over WebSocket transport backed by [`rumqttc`].
//!
//! **Feature flag:** `mqtt` (enabled by default)
//!
//! `rumqttc`'s synchronous [`Connection`] owns a private runtime together with the socket, so it
//! is only ever driven from blocking contexts: inside [`Transport::connect`] and
//! [`Transport::disconnect`] (which the manager runs on the blocking pool) and on the dedicated
//! `livefeed-io` thread started by [`Transport::loop_start`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use rumqttc::{
    Client, ConnectReturnCode, Connection, ConnectionError, Event, MqttOptions, Outgoing, Packet,
    QoS, RecvTimeoutError, Transport as WireTransport,
};
#[cfg(feature = "tracing")]
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Channel, ConnectCode, Listener, Transport};
use crate::Result;
use crate::config::Config;
use crate::error::{Error, Kind};

/// Capacity of the outgoing request queue between [`Client`] and [`Connection`].
const REQUEST_CAPACITY: usize = 64;
/// How long a single poll may wait while the link is up before the stop flag is checked again.
const IO_POLL_SLICE: Duration = Duration::from_millis(250);
/// Pause after a link error before polling again, which makes `rumqttc` reconnect.
const RETRY_PAUSE: Duration = Duration::from_secs(1);
/// Upper bound on flushing the DISCONNECT packet.
const DISCONNECT_FLUSH: Duration = Duration::from_secs(1);

impl From<ConnectReturnCode> for ConnectCode {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Success => Self::Accepted,
            ConnectReturnCode::RefusedProtocolVersion => Self::UnacceptableProtocol,
            ConnectReturnCode::BadClientId => Self::IdentifierRejected,
            ConnectReturnCode::ServiceUnavailable => Self::ServerUnavailable,
            ConnectReturnCode::BadUserNamePassword => Self::BadCredentials,
            ConnectReturnCode::NotAuthorized => Self::NotAuthorized,
        }
    }
}

/// State shared between the transport and its delivery thread.
struct Link {
    client: RwLock<Option<Client>>,
    connected: AtomicBool,
    listener: RwLock<Option<Arc<dyn Listener>>>,
}

impl Link {
    fn listener(&self) -> Option<Arc<dyn Listener>> {
        self.listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn client(&self) -> Option<Client> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn on_connack(&self, code: ConnectCode) {
        self.connected.store(code.is_success(), Ordering::Release);
        if let Some(listener) = self.listener() {
            listener.on_connect(self, code);
        }
    }

    fn on_publish(&self, topic: &str, payload: &[u8]) {
        if let Some(listener) = self.listener() {
            listener.on_message(topic, payload);
        }
    }
}

impl Channel for Link {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        let client = match self.client() {
            Some(client) if self.is_connected() => client,
            _ => return Err(Error::not_connected(topic)),
        };

        client
            .try_publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .map_err(|e| Error::with_source(Kind::Publish, e))
    }

    fn subscribe(&self, topic: &str) -> Result<()> {
        let client = self
            .client()
            .ok_or_else(|| Error::transport(Kind::Connect, "cannot subscribe without a link"))?;

        client
            .try_subscribe(topic, QoS::AtMostOnce)
            .map_err(|e| Error::with_source(Kind::Connect, e))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

struct IoLoop {
    stop: Arc<AtomicBool>,
    handle: thread::JoinHandle<Connection>,
}

/// The standard MQTT-over-WebSocket [`Transport`].
///
/// ```no_run
/// use livefeed_client::ConnectionManager;
/// use livefeed_client::config::{Config, Credentials};
/// use livefeed_client::transport::MqttTransport;
///
/// # async fn example() -> livefeed_client::Result<()> {
/// let config = Config::builder()
///     .host("mq.example.com")
///     .topic("football")
///     .credentials(Credentials::new("user", "secret"))
///     .build();
///
/// let transport = MqttTransport::new(&config);
/// let manager = ConnectionManager::new(config, transport);
/// manager.connect().await?;
/// # manager.close().await
/// # }
/// ```
pub struct MqttTransport {
    config: Config,
    client_id: String,
    link: Arc<Link>,
    /// The connection while no delivery thread owns it
    parked: Mutex<Option<Connection>>,
    io: Mutex<Option<IoLoop>>,
}

impl MqttTransport {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let client_id = config
            .client_id()
            .map_or_else(|| format!("livefeed-{}", Uuid::new_v4().simple()), ToOwned::to_owned);

        Self {
            config: config.clone(),
            client_id,
            link: Arc::new(Link {
                client: RwLock::new(None),
                connected: AtomicBool::new(false),
                listener: RwLock::new(None),
            }),
            parked: Mutex::new(None),
            io: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn options(&self, host: &str, port: u16) -> Result<MqttOptions> {
        let url = self.config.url_for(host, port)?;

        let mut options = MqttOptions::new(self.client_id.clone(), url.to_string(), port);
        options.set_keep_alive(self.config.keep_alive());
        options.set_transport(if url.scheme() == "wss" {
            WireTransport::wss_with_default_config()
        } else {
            WireTransport::Ws
        });
        if let Some(credentials) = self.config.credentials() {
            options.set_credentials(credentials.username.clone(), credentials.expose_secret());
        }

        Ok(options)
    }

    fn park(&self, connection: Connection) {
        *self.parked.lock().unwrap_or_else(PoisonError::into_inner) = Some(connection);
    }

    fn unpark(&self) -> Option<Connection> {
        self.parked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn clear_client(&self) -> Option<Client> {
        self.link.connected.store(false, Ordering::Release);
        self.link
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Channel for MqttTransport {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        self.link.publish(topic, payload)
    }

    fn subscribe(&self, topic: &str) -> Result<()> {
        self.link.subscribe(topic)
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }
}

impl Transport for MqttTransport {
    fn set_listener(&self, listener: Arc<dyn Listener>) {
        *self
            .link
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    fn connect(&self, host: &str, port: u16) -> Result<()> {
        if self.link.client().is_some() {
            return Err(Error::validation("transport already holds a link"));
        }

        let options = self.options(host, port)?;
        let (client, mut connection) = Client::new(options, REQUEST_CAPACITY);
        *self
            .link
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(client);

        let timeout = self.config.connect_timeout();
        let deadline = Instant::now() + timeout;

        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break Err(Error::transport(
                    Kind::Connect,
                    format!("no CONNACK from {host}:{port} within {timeout:?}"),
                ));
            }

            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    let code = ConnectCode::from(ack.code);
                    self.link.on_connack(code);
                    break if code.is_success() {
                        Ok(())
                    } else {
                        Err(Error::refused(code))
                    };
                }
                Ok(Ok(_)) => {}
                Ok(Err(ConnectionError::ConnectionRefused(code))) => {
                    let code = ConnectCode::from(code);
                    self.link.on_connack(code);
                    break Err(Error::refused(code));
                }
                Ok(Err(e)) => break Err(Error::with_source(Kind::Connect, e)),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    break Err(Error::transport(Kind::Connect, "request queue closed"));
                }
            }
        };

        match outcome {
            Ok(()) => {
                #[cfg(feature = "tracing")]
                info!(%host, port, client_id = %self.client_id, "Connected to broker");
                self.park(connection);
                Ok(())
            }
            Err(e) => {
                drop(self.clear_client());
                drop(connection);
                Err(e)
            }
        }
    }

    fn loop_start(&self) -> Result<()> {
        let mut io = self.io.lock().unwrap_or_else(PoisonError::into_inner);
        if io.is_some() {
            return Err(Error::validation("delivery loop already running"));
        }

        let connection = self
            .unpark()
            .ok_or_else(|| Error::validation("cannot start delivery loop without a link"))?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = Arc::clone(&stop);
        let link = Arc::clone(&self.link);
        let reconnect_slice = self.config.connect_timeout();

        let handle = thread::Builder::new()
            .name("livefeed-io".to_owned())
            .spawn(move || deliver(connection, &link, &stop_clone, reconnect_slice))
            .map_err(|e| Error::with_source(Kind::Internal, e))?;

        *io = Some(IoLoop { stop, handle });
        Ok(())
    }

    fn loop_stop(&self) {
        let io = self.io.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(IoLoop { stop, handle }) = io else {
            return;
        };

        stop.store(true, Ordering::Release);
        match handle.join() {
            Ok(connection) => self.park(connection),
            Err(_panic) => {
                #[cfg(feature = "tracing")]
                error!("Delivery thread panicked");
                self.link.connected.store(false, Ordering::Release);
            }
        }
    }

    fn disconnect(&self) -> Result<()> {
        self.loop_stop();

        let Some(client) = self.clear_client() else {
            drop(self.unpark());
            return Ok(());
        };

        let result = client
            .try_disconnect()
            .map_err(|e| Error::with_source(Kind::Connect, e));

        if let Some(mut connection) = self.unpark() {
            let deadline = Instant::now() + DISCONNECT_FLUSH;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                match connection.recv_timeout(remaining) {
                    Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) | Ok(Err(_)) | Err(_) => break,
                    Ok(Ok(_)) => {}
                }
            }
        }

        #[cfg(feature = "tracing")]
        debug!(client_id = %self.client_id, "Disconnected from broker");
        result
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        // Never join here: the last owner may be an async task.
        if let Some(io) = self.io.get_mut().unwrap_or_else(PoisonError::into_inner).as_ref() {
            io.stop.store(true, Ordering::Release);
        }
    }
}

/// Body of the `livefeed-io` thread. Returns the connection so it can be parked again.
fn deliver(
    mut connection: Connection,
    link: &Link,
    stop: &AtomicBool,
    reconnect_slice: Duration,
) -> Connection {
    while !stop.load(Ordering::Acquire) {
        // A reconnect handshake must not be cut short by the stop check.
        let slice = if link.is_connected() {
            IO_POLL_SLICE
        } else {
            reconnect_slice
        };

        match connection.recv_timeout(slice) {
            Ok(Ok(Event::Incoming(Packet::Publish(publish)))) => {
                link.on_publish(&publish.topic, &publish.payload);
            }
            Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                link.on_connack(ConnectCode::from(ack.code));
            }
            Ok(Ok(_)) | Err(RecvTimeoutError::Timeout) => {}
            Ok(Err(e)) => {
                link.connected.store(false, Ordering::Release);
                if let ConnectionError::ConnectionRefused(code) = e {
                    link.on_connack(ConnectCode::from(code));
                }
                #[cfg(feature = "tracing")]
                warn!("Connection lost, retrying: {e}");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
                thread::sleep(RETRY_PAUSE);
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    connection
}
