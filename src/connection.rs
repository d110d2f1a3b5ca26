//! Per-connection state machine (component C3 of spec.md §4.3).
//!
//! A [`ClientConnection`] owns nothing but a byte buffer and some bookkeeping;
//! it never touches a socket. Feeding it bytes yields a list of
//! [`ConnectionEvent`]s describing what the caller (the TCP listener /
//! registry in `server.rs`) should do: write bytes out, deliver a message,
//! or tear the connection down. This separation mirrors the teacher's
//! `FrameSocket`/`HandshakeMachine` split between codec and I/O.

use crate::frame::{self, coding::OpCode, Decoded};
use crate::handshake::{self, HandshakeOutcome};
use crate::ClientId;

/// Lifecycle state of a client (spec.md §3 "Client").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Connected,
    Closing,
    Closed,
}

/// One thing a [`ClientConnection`] wants its owner to do, produced while
/// draining bytes fed to it.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// Write these bytes to the socket, in order.
    Send(Vec<u8>),
    /// Deliver this message payload to `on_message`. Per spec.md §5 this
    /// must happen via the scheduler's next tick, not inline — the caller
    /// is responsible for routing this through a channel rather than
    /// calling the registry directly from the read callback.
    Message(Vec<u8>),
    /// The peer sent a Close frame (or the handshake failed in a way that
    /// requires tearing the socket down). The caller must run the
    /// single `disconnect()` path after flushing any queued `Send` bytes.
    PeerClose { code: u16, reason: String },
    /// A wire-level protocol violation. The caller must flush queued
    /// `Send` bytes (if any) and then disconnect with `close_code`.
    ProtocolError { message: String, close_code: u16 },
    /// The HTTP handshake was answered with a non-101 status. The caller
    /// must flush the queued `Send` response and then close the socket
    /// without further protocol processing.
    HandshakeRejected,
}

/// Per-client connection state (spec.md §3 "Client", minus the owned
/// socket, which lives in `server.rs` next to the registry).
pub struct ClientConnection {
    pub id: ClientId,
    state: ClientState,
    in_buffer: Vec<u8>,
    handshake_done: bool,
    auth_token: Option<String>,
    pub last_ping_sent: u64,
    pub last_pong_recv: u64,
}

impl ClientConnection {
    pub fn new(id: ClientId, auth_token: Option<String>, now_ms: u64) -> Self {
        Self {
            id,
            state: ClientState::Connecting,
            in_buffer: Vec::new(),
            handshake_done: false,
            auth_token,
            last_ping_sent: now_ms,
            last_pong_recv: now_ms,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ClientState::Connected
    }

    /// Feed newly-read bytes in. Returns the events to act on, in order.
    pub fn feed(&mut self, data: &[u8], now_ms: u64) -> Vec<ConnectionEvent> {
        self.in_buffer.extend_from_slice(data);
        let mut events = Vec::new();

        if !self.handshake_done {
            if !self.drain_handshake(&mut events) {
                return events;
            }
        }

        self.drain_frames(now_ms, &mut events);
        events
    }

    /// Phase A (spec.md §4.3). Returns `false` if the caller should stop
    /// (handshake still incomplete, or just rejected).
    fn drain_handshake(&mut self, events: &mut Vec<ConnectionEvent>) -> bool {
        match handshake::try_handshake(&self.in_buffer, self.auth_token.as_deref()) {
            HandshakeOutcome::Incomplete => false,
            HandshakeOutcome::Complete { response, accepted, remaining } => {
                events.push(ConnectionEvent::Send(response));
                if accepted {
                    self.handshake_done = true;
                    self.state = ClientState::Connected;
                    self.in_buffer = remaining;
                    true
                } else {
                    events.push(ConnectionEvent::HandshakeRejected);
                    false
                }
            }
        }
    }

    /// Phase B (spec.md §4.3). Parses as many complete frames as are
    /// buffered, dispatching each by opcode.
    fn drain_frames(&mut self, now_ms: u64, events: &mut Vec<ConnectionEvent>) {
        while self.in_buffer.len() >= 2 {
            match frame::decode(&self.in_buffer) {
                Ok(Decoded::NeedMore) => break,
                Ok(Decoded::Frame { frame, consumed }) => {
                    self.in_buffer.drain(..consumed);
                    self.handle_frame(frame, now_ms, events);
                    if self.state != ClientState::Connected {
                        break;
                    }
                }
                Err(protocol_err) => {
                    events.push(ConnectionEvent::ProtocolError {
                        message: protocol_err.to_string(),
                        close_code: protocol_err.close_code(),
                    });
                    self.state = ClientState::Closing;
                    self.in_buffer.clear();
                    break;
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: frame::Frame, now_ms: u64, events: &mut Vec<ConnectionEvent>) {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => events.push(ConnectionEvent::Message(frame.payload)),
            OpCode::Close => {
                let close = frame::parse_close_payload(&frame.payload);
                if self.state == ClientState::Connected {
                    let reply =
                        frame::encode(OpCode::Close, &frame::encode_close_payload(close.code, ""));
                    events.push(ConnectionEvent::Send(reply));
                    self.state = ClientState::Closing;
                }
                events.push(ConnectionEvent::PeerClose { code: close.code, reason: close.reason });
            }
            OpCode::Ping => {
                events.push(ConnectionEvent::Send(frame::encode(OpCode::Pong, &frame.payload)));
            }
            OpCode::Pong => {
                self.last_pong_recv = now_ms;
            }
            OpCode::Continuation => {
                events.push(ConnectionEvent::ProtocolError {
                    message: "Fragmented messages not supported".into(),
                    close_code: 1003,
                });
                self.state = ClientState::Closing;
                self.in_buffer.clear();
            }
        }
    }

    /// Encode a JSON-RPC payload as an outbound Text frame.
    pub fn encode_message(payload: &[u8]) -> Vec<u8> {
        frame::encode(OpCode::Text, payload)
    }

    /// Encode a Ping frame carrying the given payload.
    pub fn encode_ping(payload: &[u8]) -> Vec<u8> {
        frame::encode(OpCode::Ping, payload)
    }

    /// Idempotent close, per spec.md §4.3: returns the close frame to send
    /// (if the handshake had completed) and transitions to `Closing`. A
    /// second call on an already-`Closing`/`Closed` connection is a no-op.
    pub fn initiate_close(&mut self, code: u16, reason: &str) -> Option<Vec<u8>> {
        if matches!(self.state, ClientState::Closing | ClientState::Closed) {
            return None;
        }
        let frame_bytes = self
            .handshake_done
            .then(|| frame::encode(OpCode::Close, &frame::encode_close_payload(code, reason)));
        self.state = ClientState::Closing;
        frame_bytes
    }

    pub fn mark_closed(&mut self) {
        self.state = ClientState::Closed;
        self.in_buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{encode_close_payload, generate_mask};

    fn client() -> ClientConnection {
        ClientConnection::new(ClientId::new_for_test("c1"), None, 0)
    }

    const HANDSHAKE: &[u8] = b"GET / HTTP/1.1\r\n\
        Host: x\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    fn masked_frame(opcode: OpCode, payload: &[u8]) -> Vec<u8> {
        let mask = generate_mask();
        let mut masked = payload.to_vec();
        crate::frame::apply_mask(&mut masked, mask);
        let mut out = frame::encode(opcode, payload);
        // encode() writes an unmasked header; flip on the MASK bit and
        // splice the mask key + masked payload in, to build a synthetic
        // client-direction frame for these tests.
        let header_len = out.len() - payload.len();
        out.truncate(header_len);
        out[1] |= 0x80;
        out.extend_from_slice(&mask);
        out.extend_from_slice(&masked);
        out
    }

    #[test]
    fn no_message_events_before_handshake_completes() {
        let mut c = client();
        let events = c.feed(b"GET / HTTP/1.1\r\nHost: x", 0);
        assert!(events.is_empty());
        assert_eq!(c.state(), ClientState::Connecting);
    }

    #[test]
    fn handshake_then_message_in_one_feed() {
        let mut c = client();
        let mut data = HANDSHAKE.to_vec();
        data.extend_from_slice(&masked_frame(OpCode::Text, b"hello"));
        let events = c.feed(&data, 0);
        assert!(c.is_connected());
        assert!(matches!(events[0], ConnectionEvent::Send(_)));
        assert!(matches!(&events[1], ConnectionEvent::Message(p) if p == b"hello"));
    }

    #[test]
    fn ping_triggers_pong_reply() {
        let mut c = client();
        c.feed(HANDSHAKE, 0);
        let events = c.feed(&masked_frame(OpCode::Ping, b"ping"), 0);
        match &events[0] {
            ConnectionEvent::Send(bytes) => {
                assert_eq!(bytes[0] & 0x0F, 0xA); // Pong opcode
                assert_eq!(&bytes[2..], b"ping");
            }
            other => panic!("expected Send(pong), got {other:?}"),
        }
    }

    #[test]
    fn pong_updates_last_pong_recv() {
        let mut c = client();
        c.feed(HANDSHAKE, 0);
        c.feed(&masked_frame(OpCode::Pong, b""), 4242);
        assert_eq!(c.last_pong_recv, 4242);
    }

    #[test]
    fn peer_close_emits_reciprocal_and_event() {
        let mut c = client();
        c.feed(HANDSHAKE, 0);
        let payload = encode_close_payload(1000, "bye");
        let events = c.feed(&masked_frame(OpCode::Close, &payload), 0);
        assert!(matches!(events[0], ConnectionEvent::Send(_)));
        match &events[1] {
            ConnectionEvent::PeerClose { code, reason } => {
                assert_eq!(*code, 1000);
                assert_eq!(reason, "bye");
            }
            other => panic!("expected PeerClose, got {other:?}"),
        }
        assert_eq!(c.state(), ClientState::Closing);
    }

    #[test]
    fn continuation_frame_is_protocol_error_1003() {
        let mut c = client();
        c.feed(HANDSHAKE, 0);
        let events = c.feed(&masked_frame(OpCode::Continuation, b"x"), 0);
        match &events[0] {
            ConnectionEvent::ProtocolError { close_code, .. } => assert_eq!(*close_code, 1003),
            other => panic!("expected ProtocolError, got {other:?}"),
        }
    }

    #[test]
    fn unmasked_frame_is_protocol_error_1002() {
        let mut c = client();
        c.feed(HANDSHAKE, 0);
        let mut raw = masked_frame(OpCode::Text, b"hi");
        raw[1] &= 0x7F;
        let events = c.feed(&raw, 0);
        match &events[0] {
            ConnectionEvent::ProtocolError { close_code, .. } => assert_eq!(*close_code, 1002),
            other => panic!("expected ProtocolError, got {other:?}"),
        }
    }

    #[test]
    fn close_is_idempotent() {
        let mut c = client();
        c.feed(HANDSHAKE, 0);
        assert!(c.initiate_close(1000, "bye").is_some());
        assert_eq!(c.state(), ClientState::Closing);
        assert!(c.initiate_close(1000, "bye").is_none());
    }

    #[test]
    fn close_before_handshake_has_no_frame_to_send() {
        let mut c = client();
        assert!(c.initiate_close(1001, "shutdown").is_none());
        assert_eq!(c.state(), ClientState::Closing);
    }
}
