use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;

use crate::transport::ConnectCode;

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// Network, DNS, TLS or WebSocket failure while establishing the link
    Connect,
    /// The broker rejected the supplied credentials
    Auth,
    /// A publish was not accepted by the transport
    Publish,
    /// Error related to invalid state or arguments within livefeed-client
    Validation,
    /// Internal error from dependencies or the task runtime
    Internal,
}

#[derive(Debug)]
pub struct Error {
    kind: Kind,
    source: Option<Box<dyn StdError + Send + Sync + 'static>>,
    backtrace: Backtrace,
}

impl Error {
    pub fn with_source<S: StdError + Send + Sync + 'static>(kind: Kind, source: S) -> Self {
        Self {
            kind,
            source: Some(Box::new(source)),
            backtrace: Backtrace::capture(),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.backtrace
    }

    pub fn inner(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        self.source.as_deref()
    }

    pub fn downcast_ref<E: StdError + 'static>(&self) -> Option<&E> {
        let e = self.source.as_deref()?;
        e.downcast_ref::<E>()
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Validation {
            reason: message.into(),
        }
        .into()
    }

    /// Builds the error for a broker refusal, classifying credential rejections as [`Kind::Auth`].
    #[must_use]
    pub fn refused(code: ConnectCode) -> Self {
        Refused { code }.into()
    }

    #[must_use]
    pub fn not_connected<S: Into<String>>(topic: S) -> Self {
        NotConnected {
            topic: topic.into(),
        }
        .into()
    }

    /// Wraps an arbitrary transport failure with the given [`Kind`].
    pub fn transport<S: Into<String>>(kind: Kind, message: S) -> Self {
        Self::with_source(
            kind,
            TransportFailure {
                message: message.into(),
            },
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(src) => write!(f, "{:?}: {}", self.kind, src),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_deref()
            .map(|e| e as &(dyn StdError + 'static))
    }
}

#[non_exhaustive]
#[derive(Debug)]
pub struct Validation {
    pub reason: String,
}

impl fmt::Display for Validation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid: {}", self.reason)
    }
}

impl StdError for Validation {}

/// The broker answered the connect request with a non-success return code.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub struct Refused {
    pub code: ConnectCode,
}

impl fmt::Display for Refused {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.code.is_auth_failure() {
            write!(
                f,
                "authentication failed ({}), check username, secret and IP whitelist",
                self.code
            )
        } else {
            write!(f, "connection refused by broker ({})", self.code)
        }
    }
}

impl StdError for Refused {}

#[non_exhaustive]
#[derive(Debug)]
pub struct NotConnected {
    pub topic: String,
}

impl fmt::Display for NotConnected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unable to publish to '{}': not connected", self.topic)
    }
}

impl StdError for NotConnected {}

#[non_exhaustive]
#[derive(Debug)]
pub struct TransportFailure {
    pub message: String,
}

impl fmt::Display for TransportFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport error: {}", self.message)
    }
}

impl StdError for TransportFailure {}

impl From<Validation> for Error {
    fn from(err: Validation) -> Self {
        Error::with_source(Kind::Validation, err)
    }
}

impl From<Refused> for Error {
    fn from(err: Refused) -> Self {
        let kind = if err.code.is_auth_failure() {
            Kind::Auth
        } else {
            Kind::Connect
        };
        Error::with_source(kind, err)
    }
}

impl From<NotConnected> for Error {
    fn from(err: NotConnected) -> Self {
        Error::with_source(Kind::Publish, err)
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::with_source(Kind::Internal, e)
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::with_source(Kind::Validation, e)
    }
}
