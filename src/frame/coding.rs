//! WebSocket opcodes, per RFC 6455 section 5.2.

/// The opcode of a WebSocket frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Continuation frame. Unsupported by this implementation (see
    /// [`ProtocolError::UnsupportedContinuation`](crate::error::ProtocolError::UnsupportedContinuation)).
    Continuation,
    /// Text data, interpreted as a JSON-RPC envelope.
    Text,
    /// Binary data, also interpreted as a JSON-RPC envelope (§9 open question).
    Binary,
    /// Close handshake.
    Close,
    /// Keepalive ping.
    Ping,
    /// Keepalive pong.
    Pong,
}

impl OpCode {
    /// Control frames (0x8-0xF) must be unfragmented and carry a short payload.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            other => Err(other),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(code: OpCode) -> u8 {
        match code {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}
