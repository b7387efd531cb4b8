//! WebSocket opening handshake (RFC 6455 Section 4).
//!
//! # Client Request
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 13
//! ```
//!
//! # Server Answer
//!
//! ```http
//! HTTP/1.1 101 Switching Protocols
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=
//! ```
//!
//! Parsed string fields borrow from the input buffer; copy them before the
//! buffer is dropped or compacted.

use base64::Engine;
use sha1::{Digest, Sha1};
use std::fmt;

/// RFC 6455 GUID for the Sec-WebSocket-Accept calculation.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Computes the `Sec-WebSocket-Accept` value for a client key:
/// `base64(SHA1(key || GUID))` per RFC 6455 Section 4.2.2.
///
/// # Example
///
/// ```
/// use wsrpc::ws::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
#[must_use]
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Generates a random 16-byte key, base64-encoded, for a client handshake.
#[must_use]
pub fn generate_client_key() -> String {
    let mut key = [0u8; 16];
    getrandom::getrandom(&mut key).expect("OS RNG unavailable");
    base64::engine::general_purpose::STANDARD.encode(key)
}

/// A parsed opening-handshake request.
///
/// All string fields are views into the input buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake<'a> {
    /// Request target from the GET line.
    pub resource: &'a str,
    /// `Host` header value (empty if absent).
    pub host: &'a str,
    /// `Origin` header value (empty if absent).
    pub origin: &'a str,
    /// `Sec-WebSocket-Key` header value (empty if absent).
    pub key: &'a str,
    /// Requested subprotocols, comma-split and trimmed.
    pub protocols: Vec<&'a str>,
    /// Bytes occupied by the request including the terminating CRLF-CRLF.
    pub consumed: usize,
}

/// Opening handshake errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Head bytes were not valid UTF-8.
    BadEncoding,
    /// Request line was not `GET <resource> HTTP/1.1`.
    BadRequestLine,
    /// `Sec-WebSocket-Version` was present but not `13`.
    UnsupportedVersion,
    /// `Connection` header did not include `Upgrade`.
    BadConnection,
    /// `Upgrade` header was not `websocket`.
    BadUpgrade,
    /// `Connection` and/or `Upgrade` never appeared.
    MissingUpgradeHeaders,
    /// Answer status line was malformed.
    BadStatusLine,
    /// Answer status was not `101 Switching Protocols`.
    NotSwitchingProtocols(u16),
    /// Answer `Sec-WebSocket-Accept` was absent or wrong for our key.
    AcceptMismatch,
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadEncoding => write!(f, "handshake is not valid UTF-8"),
            Self::BadRequestLine => write!(f, "malformed request line"),
            Self::UnsupportedVersion => write!(f, "unsupported websocket version"),
            Self::BadConnection => write!(f, "Connection header must include Upgrade"),
            Self::BadUpgrade => write!(f, "Upgrade header must be websocket"),
            Self::MissingUpgradeHeaders => write!(f, "missing Connection/Upgrade headers"),
            Self::BadStatusLine => write!(f, "malformed status line"),
            Self::NotSwitchingProtocols(status) => {
                write!(f, "expected 101 Switching Protocols, got {status}")
            }
            Self::AcceptMismatch => write!(f, "Sec-WebSocket-Accept mismatch"),
        }
    }
}

impl std::error::Error for HandshakeError {}

/// Position just past the CRLF-CRLF terminator, if present.
fn find_terminator(input: &[u8]) -> Option<usize> {
    input.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Parses an opening-handshake request.
///
/// Requires the full CRLF-CRLF terminator; returns `Ok(None)` until it has
/// arrived. Enforces `Sec-WebSocket-Version: 13`, `Connection` including
/// `Upgrade`, and `Upgrade: websocket` (both headers mandatory). Unknown
/// headers are skipped.
pub fn parse_handshake(input: &[u8]) -> Result<Option<Handshake<'_>>, HandshakeError> {
    let Some(consumed) = find_terminator(input) else {
        return Ok(None);
    };
    let head =
        std::str::from_utf8(&input[..consumed - 2]).map_err(|_| HandshakeError::BadEncoding)?;

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    let rest = request_line
        .strip_prefix("GET ")
        .ok_or(HandshakeError::BadRequestLine)?;
    let (resource, version) = rest
        .split_once(' ')
        .ok_or(HandshakeError::BadRequestLine)?;
    if version != "HTTP/1.1" {
        return Err(HandshakeError::BadRequestLine);
    }

    let mut host = "";
    let mut origin = "";
    let mut key = "";
    let mut protocols = Vec::new();
    let mut connection_ok = false;
    let mut upgrade_ok = false;

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("Host") {
            host = value;
        } else if name.eq_ignore_ascii_case("Origin") {
            origin = value;
        } else if name.eq_ignore_ascii_case("Sec-WebSocket-Key") {
            key = value;
        } else if name.eq_ignore_ascii_case("Sec-WebSocket-Version") {
            if value != "13" {
                return Err(HandshakeError::UnsupportedVersion);
            }
        } else if name.eq_ignore_ascii_case("Connection") {
            if value
                .split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("Upgrade"))
            {
                connection_ok = true;
            } else {
                return Err(HandshakeError::BadConnection);
            }
        } else if name.eq_ignore_ascii_case("Upgrade") {
            if value.eq_ignore_ascii_case("websocket") {
                upgrade_ok = true;
            } else {
                return Err(HandshakeError::BadUpgrade);
            }
        } else if name.eq_ignore_ascii_case("Sec-WebSocket-Protocol") {
            protocols.extend(value.split(',').map(str::trim));
        }
    }

    if !connection_ok || !upgrade_ok {
        return Err(HandshakeError::MissingUpgradeHeaders);
    }

    Ok(Some(Handshake {
        resource,
        host,
        origin,
        key,
        protocols,
        consumed,
    }))
}

/// Serialises the `101 Switching Protocols` answer for a client key,
/// optionally echoing a chosen subprotocol. Bit-exact output matters for
/// interop; the header order is fixed.
#[must_use]
pub fn build_handshake_answer(key: &str, protocol: Option<&str>) -> String {
    let accept = compute_accept_key(key);
    let mut answer = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept}\r\n"
    );
    if let Some(protocol) = protocol {
        answer.push_str("Sec-WebSocket-Protocol: ");
        answer.push_str(protocol);
        answer.push_str("\r\n");
    }
    answer.push_str("\r\n");
    answer
}

/// Serialises the client's upgrade request. The `Origin` mirrors the host.
#[must_use]
pub fn build_handshake_request(host: &str, resource: &str, key: &str) -> String {
    format!(
        "GET {resource} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Origin: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
}

/// Validates the server's answer against the key we sent.
///
/// Returns the number of bytes the answer occupied (through CRLF-CRLF) so
/// the caller can drop them, or `Ok(None)` while the terminator is missing.
pub fn parse_handshake_answer(input: &[u8], key: &str) -> Result<Option<usize>, HandshakeError> {
    let Some(consumed) = find_terminator(input) else {
        return Ok(None);
    };
    let head =
        std::str::from_utf8(&input[..consumed - 2]).map_err(|_| HandshakeError::BadEncoding)?;

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap_or_default();
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next().ok_or(HandshakeError::BadStatusLine)?;
    let status: u16 = parts
        .next()
        .ok_or(HandshakeError::BadStatusLine)?
        .parse()
        .map_err(|_| HandshakeError::BadStatusLine)?;
    if status != 101 {
        return Err(HandshakeError::NotSwitchingProtocols(status));
    }

    let accept = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("Sec-WebSocket-Accept"))
        .map(|(_, value)| value.trim())
        .ok_or(HandshakeError::AcceptMismatch)?;

    if accept != compute_accept_key(key) {
        return Err(HandshakeError::AcceptMismatch);
    }

    Ok(Some(consumed))
}
