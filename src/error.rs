use std::fmt::Display;
use std::io;
use std::str::Utf8Error;
use std::sync::Arc;
use std::time::Duration;

use serde::{de, ser};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("no transport could be configured: {0}")]
    TransportConfiguration(String),
    #[error("call with serial {serial} timed out after {timeout:?}")]
    CallTimeout { serial: u32, timeout: Duration },
    #[error("connection is disconnected")]
    Disconnected,
    #[error("{name}: {message}")]
    Remote { name: String, message: String },
    #[error("invalid bus address: {0}")]
    InvalidAddress(String),
    #[error("invalid match rule: {0}")]
    InvalidMatchRule(String),
    #[error("invalid object path: {0:?}")]
    InvalidObjectPath(String),
    #[error("error serializing: {0}")]
    Serializing(String),
    #[error("error deserializing: {0}")]
    Deserializing(String),
    #[error("transport i/o failed")]
    Io(#[source] Arc<io::Error>),
}

impl Error {
    /// Name used when this error travels back to a peer as an error reply.
    pub fn dbus_name(&self) -> &str {
        match self {
            Error::Remote { name, .. } => name,
            Error::InvalidSignature(_) | Error::Serializing(_) | Error::Deserializing(_) => {
                "org.freedesktop.DBus.Error.InvalidArgs"
            }
            Error::CallTimeout { .. } => "org.freedesktop.DBus.Error.Timeout",
            Error::Disconnected => "org.freedesktop.DBus.Error.Disconnected",
            Error::InvalidMatchRule(_) => "org.freedesktop.DBus.Error.MatchRuleInvalid",
            _ => "org.freedesktop.DBus.Error.Failed",
        }
    }

    /// Whether this error leaves the stream framing in an unknown state.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::MalformedMessage(_) | Error::Io(_) | Error::Disconnected
        )
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<Utf8Error> for Error {
    fn from(err: Utf8Error) -> Self {
        Error::MalformedMessage(format!("string is not valid UTF-8: {}", err))
    }
}

impl ser::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Serializing(msg.to_string())
    }
}

impl de::Error for Error {
    fn custom<T: Display>(msg: T) -> Self {
        Error::Deserializing(msg.to_string())
    }
}
