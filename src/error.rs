//! Exchange-level error taxonomy.
//!
//! Errors split into two taxa mirroring the protocol: a
//! [`StreamException`] is isolated to one stream (the engine answers with
//! RST_STREAM and the rest of the connection continues), a
//! [`ConnectionException`] takes the whole connection down through GOAWAY
//! with a shutdown hint.

use crate::codec::{ErrorCode, StreamId};
use std::fmt;

/// How a connection shuts down after GOAWAY.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownHint {
    /// Close as soon as the GOAWAY is flushed.
    #[default]
    Hard,
    /// Drain already-opened streams before closing.
    Graceful,
}

/// An error scoped to a single stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamException {
    /// Stream the error belongs to, when one exists yet.
    pub stream_id: Option<StreamId>,
    /// Error code carried on the RST_STREAM.
    pub code: ErrorCode,
    /// Human-readable detail.
    pub message: String,
}

impl StreamException {
    /// Create a stream exception not yet bound to a stream.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            stream_id: None,
            code,
            message: message.into(),
        }
    }

    /// Bind the exception to a stream id.
    pub fn on_stream(mut self, stream_id: StreamId) -> Self {
        self.stream_id = Some(stream_id);
        self
    }
}

impl fmt::Display for StreamException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stream_id {
            Some(id) => write!(f, "stream {} {}: {}", id.value(), self.code, self.message),
            None => write!(f, "stream {}: {}", self.code, self.message),
        }
    }
}

/// An error affecting the whole connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionException {
    /// Error code carried on the GOAWAY.
    pub code: ErrorCode,
    /// Shutdown policy after the GOAWAY is sent.
    pub hint: ShutdownHint,
    /// Human-readable detail.
    pub message: String,
}

impl ConnectionException {
    /// Create a connection exception with the default hard shutdown hint.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            hint: ShutdownHint::Hard,
            message: message.into(),
        }
    }

    /// Use a graceful shutdown hint (drain open streams).
    pub fn graceful(mut self) -> Self {
        self.hint = ShutdownHint::Graceful;
        self
    }
}

impl fmt::Display for ConnectionException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "connection {}: {}", self.code, self.message)
    }
}

/// Errors surfaced by the exchange engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Stream(StreamException),
    #[error("{0}")]
    Connection(ConnectionException),
    #[error("invalid header: {0}")]
    InvalidHeader(String),
    #[error("io error: {0}")]
    Io(String),
}

impl Error {
    /// Shorthand for a stream exception.
    pub fn stream(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Stream(StreamException::new(code, message))
    }

    /// Shorthand for a connection exception.
    pub fn connection(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionException::new(code, message))
    }

    /// The wire error code to use when answering this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Stream(e) => e.code,
            Error::Connection(e) => e.code,
            Error::InvalidHeader(_) => ErrorCode::ProtocolError,
            Error::Io(_) => ErrorCode::InternalError,
        }
    }
}

impl From<StreamException> for Error {
    fn from(e: StreamException) -> Self {
        Error::Stream(e)
    }
}

impl From<ConnectionException> for Error {
    fn from(e: ConnectionException) -> Self {
        Error::Connection(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
