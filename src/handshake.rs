//! HTTP/1.1 Upgrade handshake (component C2 of spec.md §4.2).

use data_encoding::BASE64;
use httparse::Status;
use sha1::{Digest, Sha1};

use crate::error::ProtocolError;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const MAX_HEADERS: usize = 32;
const AUTH_HEADER: &str = "x-claude-code-ide-authorization";

/// Outcome of attempting the handshake against a buffer.
pub enum HandshakeOutcome {
    /// Not enough bytes buffered to see the full `\r\n\r\n` terminator yet.
    Incomplete,
    /// A full HTTP request was parsed and answered. `remaining` is any bytes
    /// in the buffer after the request (the start of the WebSocket stream on
    /// success, or unused on failure).
    Complete { response: Vec<u8>, accepted: bool, remaining: Vec<u8> },
}

/// Attempt to parse and answer one HTTP/1.1 Upgrade request from the front
/// of `buf`. Validates in the order spec.md §4.2 lists, short-circuiting to
/// an HTTP error response on the first failure.
pub fn try_handshake(buf: &[u8], auth_token: Option<&str>) -> HandshakeOutcome {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    let parsed_len = match request.parse(buf) {
        Ok(Status::Partial) => return HandshakeOutcome::Incomplete,
        Ok(Status::Complete(n)) => n,
        Err(_) => {
            return HandshakeOutcome::Complete {
                response: error_response(400, "Bad Request"),
                accepted: false,
                remaining: Vec::new(),
            }
        }
    };

    let remaining = buf[parsed_len..].to_vec();

    match validate(&request, auth_token) {
        Ok(key) => {
            let accept = compute_accept_key(key);
            HandshakeOutcome::Complete {
                response: success_response(&accept),
                accepted: true,
                remaining,
            }
        }
        Err(ProtocolError::Unauthorized) => HandshakeOutcome::Complete {
            response: error_response(401, "Unauthorized"),
            accepted: false,
            remaining,
        },
        Err(_) => HandshakeOutcome::Complete {
            response: error_response(400, "Bad Request"),
            accepted: false,
            remaining,
        },
    }
}

fn validate<'h, 'b>(
    request: &httparse::Request<'h, 'b>,
    auth_token: Option<&str>,
) -> Result<&'b str, ProtocolError> {
    if request.method != Some("GET") || request.version != Some(1) {
        return Err(ProtocolError::WrongHttpMethodOrVersion);
    }

    if !header_token_eq(request, "upgrade", "websocket") {
        return Err(ProtocolError::MissingUpgradeWebSocketHeader);
    }
    if !header_contains_token(request, "connection", "upgrade") {
        return Err(ProtocolError::MissingConnectionUpgradeHeader);
    }
    if !header_eq(request, "sec-websocket-version", "13") {
        return Err(ProtocolError::MissingSecWebSocketVersionHeader);
    }
    let key = find_header(request, "sec-websocket-key")
        .ok_or(ProtocolError::MissingSecWebSocketKey)?;

    if let Some(expected) = auth_token {
        let provided = find_header(request, AUTH_HEADER);
        if provided != Some(expected) {
            return Err(ProtocolError::Unauthorized);
        }
    }

    Ok(key)
}

fn find_header<'h, 'b>(request: &httparse::Request<'h, 'b>, name: &str) -> Option<&'b str> {
    request
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .and_then(|h| std::str::from_utf8(h.value).ok())
}

fn header_eq(request: &httparse::Request<'_, '_>, name: &str, expected: &str) -> bool {
    find_header(request, name).map(|v| v.trim().eq_ignore_ascii_case(expected)).unwrap_or(false)
}

fn header_token_eq(request: &httparse::Request<'_, '_>, name: &str, expected: &str) -> bool {
    header_eq(request, name, expected)
}

fn header_contains_token(request: &httparse::Request<'_, '_>, name: &str, token: &str) -> bool {
    find_header(request, name)
        .map(|v| v.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
}

/// `base64(SHA1(key || GUID))`, per RFC 6455 §1.3.
fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(&hasher.finalize())
}

fn success_response(accept_key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n\
         \r\n"
    )
    .into_bytes()
}

fn error_response(status: u16, reason: &str) -> Vec<u8> {
    let body = reason;
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Connection: close\r\n\
         Content-Length: {}\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}
