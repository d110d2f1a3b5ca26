//! Error handling.

mod protocol_error;

use std::{fmt, io, result};

pub use protocol_error::ProtocolError;

/// Result type of all bridge library calls.
pub type Result<T> = result::Result<T, Error>;

/// Possible bridge errors.
pub enum Error {
    /// Input-output error on the underlying TCP socket.
    Io(io::Error),
    /// WebSocket protocol violation (frame or handshake level).
    Protocol(ProtocolError),
    /// JSON-RPC envelope did not parse as JSON at all.
    JsonParse(serde_json::Error),
    /// Operating on a connection that is not in `Connected` state.
    NotConnected,
    /// No port in the configured range could be bound.
    PortRangeExhausted { min: u16, max: u16 },
    /// `Server::start` called while already running.
    AlreadyRunning,
    /// `Server::stop` called while not running.
    NotRunning,
}

impl From<io::Error> for Error {
    #[inline]
    fn from(from: io::Error) -> Self {
        Self::Io(from)
    }
}

impl From<ProtocolError> for Error {
    #[inline]
    fn from(from: ProtocolError) -> Self {
        Self::Protocol(from)
    }
}

impl From<httparse::Error> for Error {
    fn from(err: httparse::Error) -> Self {
        Error::Protocol(ProtocolError::HttparseError(err))
    }
}

impl fmt::Debug for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(elem) => write!(f, "IO error: {elem}"),
            Self::Protocol(elem) => write!(f, "WebSocket protocol error: {elem}"),
            Self::JsonParse(elem) => write!(f, "JSON parse error: {elem}"),
            Self::NotConnected => write!(f, "Operation requires a connected client"),
            Self::PortRangeExhausted { min, max } => {
                write!(f, "No free port in range {min}..={max}")
            }
            Self::AlreadyRunning => write!(f, "Server already running"),
            Self::NotRunning => write!(f, "Server not running"),
        }
    }
}

impl fmt::Display for Error {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for Error {}
