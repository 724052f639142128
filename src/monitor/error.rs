use thiserror::Error;

use crate::input::LineReadError;
use crate::resp::RespError;

/// Opening the upstream MONITOR connection failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectError {
    #[error("unknown instance: {0}")]
    UnknownInstance(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("connection timed out")]
    Timeout,
    #[error("{0}")]
    Rejected(String),
    #[error("unexpected reply: {0}")]
    Protocol(String),
}

impl From<LineReadError> for ConnectError {
    fn from(error: LineReadError) -> Self {
        match error {
            LineReadError::IoError(message) => ConnectError::Io(message),
            LineReadError::ConnectionClosed => {
                ConnectError::Io("connection closed during handshake".to_string())
            }
            LineReadError::RespParseError(RespError::UnsupportedReply(line)) => {
                ConnectError::Protocol(line)
            }
            other => ConnectError::Protocol(other.to_string()),
        }
    }
}

/// The upstream connection failed after it was opened.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("connection closed by server")]
    Closed,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("{0}")]
    Server(String),
    /// A single line was too long and got skipped; carries its first bytes.
    /// The connection stays usable.
    #[error("line exceeds the maximum length")]
    LineTooLong(String),
}


impl From<LineReadError> for StreamError {
    fn from(error: LineReadError) -> Self {
        match error {
            LineReadError::ConnectionClosed => StreamError::Closed,
            LineReadError::IoError(message) => StreamError::Io(message),
            LineReadError::LineTooLong(preview) => StreamError::LineTooLong(preview),
            other => StreamError::Io(other.to_string()),
        }
    }
}

/// Outcome of a failed push to one observer.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PushError {
    /// The remote side is gone; the hub unsubscribes the observer.
    #[error("observer closed")]
    Closed,
    /// Any other transport failure; the batch is dropped for this observer.
    #[error("push failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RegistryError {
    #[error("observer {0} is already registered")]
    DuplicateObserver(String),
}
