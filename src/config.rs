use std::env;
use std::fmt;
use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;
use secrecy::{ExposeSecret as _, SecretString};
use serde::Deserialize;
use url::Url;

use crate::Result;
use crate::error::Error;
use crate::topics;

pub const HOST_VAR: &str = "LIVEFEED_HOST";
pub const PORT_VAR: &str = "LIVEFEED_PORT";
pub const USERNAME_VAR: &str = "LIVEFEED_USERNAME";
pub const SECRET_VAR: &str = "LIVEFEED_SECRET";
pub const TOPIC_VAR: &str = "LIVEFEED_TOPIC";
pub const HEARTBEAT_SECS_VAR: &str = "LIVEFEED_HEARTBEAT_SECS";

const DEFAULT_PORT: u16 = 443;
const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);
const DEFAULT_KEEP_ALIVE_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_CHECK_INTERVAL_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Broker credentials. The secret is never printed.
#[non_exhaustive]
#[derive(Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub secret: SecretString,
}

impl Credentials {
    #[must_use]
    pub fn new<U: Into<String>, S: Into<String>>(username: U, secret: S) -> Self {
        Self {
            username: username.into(),
            secret: SecretString::from(secret.into()),
        }
    }

    pub(crate) fn expose_secret(&self) -> &str {
        self.secret.expose_secret()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Configuration for a [`ConnectionManager`](crate::ConnectionManager) and its transport.
///
/// Read once at construction; there is no hot-reload.
///
/// ```
/// use std::time::Duration;
///
/// use livefeed_client::config::{Config, Credentials};
///
/// let config = Config::builder()
///     .host("mq.example.com")
///     .topic("football")
///     .credentials(Credentials::new("user", "secret"))
///     .heartbeat_interval(Duration::from_secs(10))
///     .build();
///
/// assert_eq!(config.port(), 443);
/// assert_eq!(config.heartbeat_topic(), "heartbeat");
/// ```
#[derive(Clone, Debug, Builder)]
pub struct Config {
    /// Broker host name, without scheme
    #[builder(into)]
    host: String,
    #[builder(default = DEFAULT_PORT)]
    port: u16,
    /// WebSocket path on the broker
    #[builder(into, default = "/mqtt".to_owned())]
    path: String,
    /// Use `wss://` rather than `ws://`
    #[builder(default = true)]
    tls: bool,
    credentials: Option<Credentials>,
    /// MQTT client identifier. A random one is generated when absent.
    #[builder(into)]
    client_id: Option<String>,
    /// Topic subscribed to on every successful connect
    #[builder(into)]
    topic: String,
    /// How often the heartbeat is published. The default is thirty (30) seconds.
    #[builder(default = DEFAULT_HEARTBEAT_INTERVAL_DURATION)]
    heartbeat_interval: Duration,
    #[builder(into, default = topics::HEARTBEAT.to_owned())]
    heartbeat_topic: String,
    #[builder(into, default = topics::HEARTBEAT_PAYLOAD.to_owned())]
    heartbeat_payload: String,
    /// Upper bound on a single blocking connect attempt
    #[builder(default = DEFAULT_CONNECT_TIMEOUT_DURATION)]
    connect_timeout: Duration,
    #[builder(default = DEFAULT_KEEP_ALIVE_DURATION)]
    keep_alive: Duration,
}

impl Config {
    /// Build a configuration from `LIVEFEED_*` environment variables.
    ///
    /// `LIVEFEED_HOST` defaults to [`topics::DEFAULT_HOST`] and `LIVEFEED_TOPIC` to
    /// [`topics::FOOTBALL`]. Credentials are only set when both `LIVEFEED_USERNAME` and
    /// `LIVEFEED_SECRET` are present.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub(crate) fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Result<Self> {
        let port = match lookup(PORT_VAR) {
            Some(raw) => raw
                .parse::<u16>()
                .map_err(|e| Error::validation(format!("{PORT_VAR}={raw}: {e}")))?,
            None => DEFAULT_PORT,
        };

        let heartbeat_interval = match lookup(HEARTBEAT_SECS_VAR) {
            Some(raw) => {
                let secs = raw
                    .parse::<u64>()
                    .map_err(|e| Error::validation(format!("{HEARTBEAT_SECS_VAR}={raw}: {e}")))?;
                if secs == 0 {
                    return Err(Error::validation(format!(
                        "{HEARTBEAT_SECS_VAR} must be greater than zero"
                    )));
                }
                Duration::from_secs(secs)
            }
            None => DEFAULT_HEARTBEAT_INTERVAL_DURATION,
        };

        let credentials = match (lookup(USERNAME_VAR), lookup(SECRET_VAR)) {
            (Some(username), Some(secret)) => Some(Credentials::new(username, secret)),
            (None, None) => None,
            _ => {
                return Err(Error::validation(format!(
                    "{USERNAME_VAR} and {SECRET_VAR} must be set together"
                )));
            }
        };

        let config = Config::builder()
            .host(lookup(HOST_VAR).unwrap_or_else(|| topics::DEFAULT_HOST.to_owned()))
            .port(port)
            .topic(lookup(TOPIC_VAR).unwrap_or_else(|| topics::FOOTBALL.to_owned()))
            .heartbeat_interval(heartbeat_interval)
            .maybe_credentials(credentials)
            .build();

        config.broker_url()?;
        Ok(config)
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    #[must_use]
    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    #[must_use]
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    #[must_use]
    pub fn heartbeat_topic(&self) -> &str {
        &self.heartbeat_topic
    }

    #[must_use]
    pub fn heartbeat_payload(&self) -> &str {
        &self.heartbeat_payload
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn keep_alive(&self) -> Duration {
        self.keep_alive
    }

    /// The WebSocket URL of the broker, e.g. `wss://mq.example.com/mqtt`.
    pub fn broker_url(&self) -> Result<Url> {
        self.url_for(&self.host, self.port)
    }

    /// The WebSocket URL for an arbitrary `host` and `port`, using this configuration's scheme
    /// and path.
    pub(crate) fn url_for(&self, host: &str, port: u16) -> Result<Url> {
        let scheme = if self.tls { "wss" } else { "ws" };
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        let url = Url::parse(&format!("{scheme}://{host}:{port}{path}"))?;
        Ok(url)
    }
}

/// Configuration for supervised reconnection, see
/// [`ConnectionManager::supervise`](crate::ConnectionManager::supervise).
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Maximum number of consecutive failed reconnects before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// How often link liveness is checked
    #[builder(default = DEFAULT_CHECK_INTERVAL_DURATION)]
    pub check_interval: Duration,
    /// Initial backoff duration for first reconnection attempt
    #[builder(default = DEFAULT_INITIAL_BACKOFF_DURATION)]
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    #[builder(default = DEFAULT_MAX_BACKOFF_DURATION)]
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    #[builder(default = DEFAULT_BACKOFF_MULTIPLIER)]
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_max_elapsed_time(None) // max attempts are counted by the supervisor
            .build()
    }
}
