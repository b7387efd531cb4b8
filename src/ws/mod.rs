//! WebSocket wire protocol (RFC 6455): framing and opening handshake.
//!
//! Pure, allocation-light functions over byte slices; no I/O. The transport
//! layer feeds these from each connection's [`crate::Buffer`] and drops the
//! consumed prefix after every parsed unit.
//!
//! Incomplete input is `Ok(None)` (wait for more bytes); protocol violations
//! are `Err` — the caller decides whether that means a `400` reply (during
//! the handshake) or a CLOSE frame (once framed).

mod frame;
mod handshake;

pub use frame::{
    apply_mask, build_frame, parse_client_frame, parse_server_frame, Frame, FrameError, FrameKind,
};
pub use handshake::{
    build_handshake_answer, build_handshake_request, compute_accept_key, generate_client_key,
    parse_handshake, parse_handshake_answer, Handshake, HandshakeError,
};
