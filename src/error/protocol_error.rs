use std::fmt;

/// Indicates the specific type/cause of a protocol error, and the WebSocket
/// close code a violation of it should be reported with.
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum ProtocolError {
    /// Request line was not `GET <path> HTTP/1.1`.
    WrongHttpMethodOrVersion,
    /// Missing or malformed `Upgrade: websocket` header.
    MissingUpgradeWebSocketHeader,
    /// Missing or malformed `Connection: Upgrade` header.
    MissingConnectionUpgradeHeader,
    /// Missing `Sec-WebSocket-Version: 13` header.
    MissingSecWebSocketVersionHeader,
    /// Missing or malformed `Sec-WebSocket-Key` header.
    MissingSecWebSocketKey,
    /// Auth header missing or not equal to the configured token.
    Unauthorized,
    /// Wrapper around an [`httparse::Error`].
    HttparseError(httparse::Error),
    /// Reserved bits in the frame header are non-zero (no extensions supported).
    NonZeroReservedBits,
    /// The server must close the connection when an unmasked frame is received.
    UnmaskedFrameFromClient,
    /// Control frames must not be fragmented and must be FIN.
    FragmentedControlFrame,
    /// Control frames must have a payload of 125 bytes or less.
    ControlFrameTooBig,
    /// Encountered an opcode outside 0x0-0x2, 0x8-0xA.
    InvalidOpcode(u8),
    /// A continuation frame arrived; fragmentation is unsupported.
    UnsupportedContinuation,
}

impl ProtocolError {
    /// The WebSocket close code this violation should be reported with.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::UnsupportedContinuation => 1003,
            _ => 1002,
        }
    }
}

impl fmt::Debug for ProtocolError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WrongHttpMethodOrVersion => {
                write!(f, "Request line must be \"GET <path> HTTP/1.1\"")
            }
            Self::MissingUpgradeWebSocketHeader => write!(f, "No \"Upgrade: websocket\" header"),
            Self::MissingConnectionUpgradeHeader => write!(f, "No \"Connection: Upgrade\" header"),
            Self::MissingSecWebSocketVersionHeader => {
                write!(f, "No \"Sec-WebSocket-Version: 13\" header")
            }
            Self::MissingSecWebSocketKey => write!(f, "No \"Sec-WebSocket-Key\" header"),
            Self::Unauthorized => write!(f, "Missing or mismatched authorization header"),
            Self::HttparseError(elem) => write!(f, "httparse error: {elem}"),
            Self::NonZeroReservedBits => write!(f, "Reserved bits must be zero"),
            Self::UnmaskedFrameFromClient => write!(f, "Received an unmasked frame from a client"),
            Self::FragmentedControlFrame => write!(f, "Control frames must not be fragmented"),
            Self::ControlFrameTooBig => write!(f, "Control frame payload exceeds 125 bytes"),
            Self::InvalidOpcode(code) => write!(f, "Invalid opcode: {code}"),
            Self::UnsupportedContinuation => write!(f, "Fragmented messages not supported"),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for ProtocolError {}
