//! WebSocket frame codec according to RFC 6455.
//!
//! # Frame Format (RFC 6455 Section 5.2)
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```
//!
//! Fragmentation is not supported: every frame must carry FIN with all
//! reserved bits clear, and the continuation opcode is rejected outright.
//! Client-to-server frames must be masked; server-to-client frames must not
//! be. [`parse_client_frame`] is the server's inbound parser and
//! [`parse_server_frame`] the client's; both share the length decoding.

use std::fmt;

/// WebSocket frame opcode (4 bits). Only the five opcodes this engine
/// speaks; anything else on the wire is a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Text data frame.
    Text = 0x1,
    /// Binary data frame.
    Binary = 0x2,
    /// Connection close control frame.
    Close = 0x8,
    /// Ping control frame.
    Ping = 0x9,
    /// Pong control frame.
    Pong = 0xA,
}

impl FrameKind {
    /// Returns true if this is a control frame (Close, Ping, Pong).
    #[must_use]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Maps a wire opcode to a kind; `None` for anything unsupported
    /// (including continuation frames).
    #[must_use]
    pub fn from_opcode(value: u8) -> Option<Self> {
        match value {
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }
}

/// A decoded frame.
///
/// `consumed` is the total wire length of the frame so the caller may drop
/// exactly that many bytes from its buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame opcode.
    pub kind: FrameKind,
    /// Total bytes the frame occupied on the wire.
    pub consumed: usize,
    /// Unmasked payload data.
    pub payload: Vec<u8>,
}

/// Frame codec errors. Any of these means the stream is unrecoverable and
/// the connection should be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// FIN bit clear: fragmented messages are not supported.
    Fragmented,
    /// Reserved bits set without extension support.
    ReservedBits,
    /// Opcode outside the supported set.
    UnknownOpcode(u8),
    /// Client-to-server frame without the mask bit.
    UnmaskedClientFrame,
    /// Server-to-client frame with the mask bit set.
    MaskedServerFrame,
    /// 64-bit payload length with the high bit set.
    LengthOverflow,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fragmented => write!(f, "fragmented frames not supported"),
            Self::ReservedBits => write!(f, "reserved bits set without extension"),
            Self::UnknownOpcode(op) => write!(f, "unsupported opcode: 0x{op:X}"),
            Self::UnmaskedClientFrame => write!(f, "client frame must be masked"),
            Self::MaskedServerFrame => write!(f, "server frame must not be masked"),
            Self::LengthOverflow => write!(f, "payload length out of range"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Parses a client-to-server frame (the server's inbound direction).
///
/// The mask bit must be set. Returns `Ok(None)` while the buffer does not
/// yet hold the complete frame.
pub fn parse_client_frame(input: &[u8]) -> Result<Option<Frame>, FrameError> {
    parse(input, true)
}

/// Parses a server-to-client frame (the client's inbound direction).
///
/// The mask bit must be clear and the payload is copied verbatim.
pub fn parse_server_frame(input: &[u8]) -> Result<Option<Frame>, FrameError> {
    parse(input, false)
}

fn parse(input: &[u8], mask_required: bool) -> Result<Option<Frame>, FrameError> {
    if input.len() < 2 {
        return Ok(None);
    }

    let first = input[0];
    if first & 0x80 == 0 {
        return Err(FrameError::Fragmented);
    }
    if first & 0x70 != 0 {
        return Err(FrameError::ReservedBits);
    }
    let opcode = first & 0x0F;
    let kind = FrameKind::from_opcode(opcode).ok_or(FrameError::UnknownOpcode(opcode))?;

    let masked = input[1] & 0x80 != 0;
    if mask_required && !masked {
        return Err(FrameError::UnmaskedClientFrame);
    }
    if !mask_required && masked {
        return Err(FrameError::MaskedServerFrame);
    }

    let Some((payload_len, ext)) = decode_length(input)? else {
        return Ok(None);
    };

    let mask_len = if masked { 4 } else { 0 };
    let header = 2 + ext + mask_len;
    let total = header + payload_len;
    if input.len() < total {
        return Ok(None);
    }

    let mut payload = input[header..total].to_vec();
    if masked {
        let key = [
            input[2 + ext],
            input[3 + ext],
            input[4 + ext],
            input[5 + ext],
        ];
        apply_mask(&mut payload, key);
    }

    Ok(Some(Frame {
        kind,
        consumed: total,
        payload,
    }))
}

/// Decodes the 7/16/64-bit payload length. Returns the payload length and
/// the number of extension bytes, or `None` when the extension bytes have
/// not arrived yet.
fn decode_length(input: &[u8]) -> Result<Option<(usize, usize)>, FrameError> {
    match input[1] & 0x7F {
        126 => {
            if input.len() < 4 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([input[2], input[3]]);
            Ok(Some((usize::from(len), 2)))
        }
        127 => {
            if input.len() < 10 {
                return Ok(None);
            }
            if input[2] & 0x80 != 0 {
                return Err(FrameError::LengthOverflow);
            }
            let len = u64::from_be_bytes([
                input[2], input[3], input[4], input[5], input[6], input[7], input[8], input[9],
            ]);
            let len = usize::try_from(len).map_err(|_| FrameError::LengthOverflow)?;
            Ok(Some((len, 8)))
        }
        n => Ok(Some((usize::from(n), 0))),
    }
}

/// Serialises one frame. `masked` selects the client direction: a fresh
/// random 4-byte key is generated per frame and the payload XOR-masked.
/// The length encoding always chooses the minimum legal form.
#[must_use]
pub fn build_frame(kind: FrameKind, payload: &[u8], masked: bool) -> Vec<u8> {
    let mask_bit: u8 = if masked { 0x80 } else { 0 };
    let mut out = Vec::with_capacity(2 + 8 + 4 + payload.len());

    out.push(0x80 | kind as u8);
    if payload.len() <= 125 {
        out.push(mask_bit | payload.len() as u8);
    } else if payload.len() <= 0xFFFF {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    if masked {
        let key = generate_mask_key();
        out.extend_from_slice(&key);
        let mut body = payload.to_vec();
        apply_mask(&mut body, key);
        out.extend_from_slice(&body);
    } else {
        out.extend_from_slice(payload);
    }

    out
}

/// Applies XOR masking in place. Masking is its own inverse, so this both
/// masks and unmasks.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Fresh 4-byte masking key for a client-to-server frame.
///
/// RFC 6455 §5.3 requires masking keys to come from a strong entropy source
/// to defeat cache-poisoning attacks through intermediaries.
fn generate_mask_key() -> [u8; 4] {
    let mut key = [0u8; 4];
    getrandom::getrandom(&mut key).expect("OS RNG unavailable");
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_KINDS: [FrameKind; 5] = [
        FrameKind::Text,
        FrameKind::Binary,
        FrameKind::Close,
        FrameKind::Ping,
        FrameKind::Pong,
    ];

    #[test]
    fn kind_from_opcode() {
        assert_eq!(FrameKind::from_opcode(0x1), Some(FrameKind::Text));
        assert_eq!(FrameKind::from_opcode(0x2), Some(FrameKind::Binary));
        assert_eq!(FrameKind::from_opcode(0x8), Some(FrameKind::Close));
        assert_eq!(FrameKind::from_opcode(0x9), Some(FrameKind::Ping));
        assert_eq!(FrameKind::from_opcode(0xA), Some(FrameKind::Pong));
        // Continuation and reserved opcodes are rejected.
        for op in [0x0, 0x3, 0x7, 0xB, 0xF] {
            assert_eq!(FrameKind::from_opcode(op), None);
        }
    }

    #[test]
    fn kind_is_control() {
        assert!(!FrameKind::Text.is_control());
        assert!(!FrameKind::Binary.is_control());
        assert!(FrameKind::Close.is_control());
        assert!(FrameKind::Ping.is_control());
        assert!(FrameKind::Pong.is_control());
    }

    #[test]
    fn masked_roundtrip_all_kinds() {
        for kind in ALL_KINDS {
            let wire = build_frame(kind, b"payload", true);
            let frame = parse_client_frame(&wire).unwrap().unwrap();
            assert_eq!(frame.kind, kind);
            assert_eq!(frame.consumed, wire.len());
            assert_eq!(frame.payload, b"payload");
        }
    }

    #[test]
    fn unmasked_roundtrip_all_kinds() {
        for kind in ALL_KINDS {
            let wire = build_frame(kind, b"payload", false);
            let frame = parse_server_frame(&wire).unwrap().unwrap();
            assert_eq!(frame.kind, kind);
            assert_eq!(frame.consumed, wire.len());
            assert_eq!(frame.payload, b"payload");
        }
    }

    #[test]
    fn masking_is_involutive() {
        let key = [0x37, 0xFA, 0x21, 0x3D];
        let mut payload = b"Hello, frames".to_vec();
        let original = payload.clone();
        apply_mask(&mut payload, key);
        assert_ne!(payload, original);
        apply_mask(&mut payload, key);
        assert_eq!(payload, original);
    }

    #[test]
    fn length_boundaries_choose_minimum_form() {
        // (payload len, expected extension bytes)
        let cases = [
            (0usize, 0usize),
            (125, 0),
            (126, 2),
            (127, 2),
            (65535, 2),
            (65536, 8),
            (1 << 20, 8),
        ];
        for (len, ext) in cases {
            let payload = vec![0xAB; len];
            let wire = build_frame(FrameKind::Binary, &payload, true);
            assert_eq!(wire.len(), 2 + ext + 4 + len, "wire size for len {len}");
            let expected_len7 = match ext {
                0 => len as u8,
                2 => 126,
                _ => 127,
            };
            assert_eq!(wire[1] & 0x7F, expected_len7, "length form for len {len}");
            let frame = parse_client_frame(&wire).unwrap().unwrap();
            assert_eq!(frame.consumed, wire.len());
            assert_eq!(frame.payload, payload);
        }
    }

    #[test]
    fn incomplete_input_returns_none() {
        let wire = build_frame(FrameKind::Text, &vec![0x55; 300], true);
        // One byte, partial header, partial extension, partial mask key,
        // partial payload: all incomplete.
        for cut in [1, 2, 3, 5, 7, wire.len() - 1] {
            assert_eq!(parse_client_frame(&wire[..cut]), Ok(None), "cut at {cut}");
        }
        assert!(parse_client_frame(&wire).unwrap().is_some());
    }

    #[test]
    fn fin_clear_is_rejected() {
        let mut wire = build_frame(FrameKind::Text, b"x", true);
        wire[0] &= 0x7F;
        assert_eq!(parse_client_frame(&wire), Err(FrameError::Fragmented));
    }

    #[test]
    fn reserved_bits_are_rejected() {
        for rsv in [0x40u8, 0x20, 0x10] {
            let mut wire = build_frame(FrameKind::Text, b"x", true);
            wire[0] |= rsv;
            assert_eq!(parse_client_frame(&wire), Err(FrameError::ReservedBits));
        }
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let mut wire = build_frame(FrameKind::Text, b"x", true);
        wire[0] = 0x80 | 0x3;
        assert_eq!(parse_client_frame(&wire), Err(FrameError::UnknownOpcode(0x3)));
    }

    #[test]
    fn mask_bit_direction_is_enforced() {
        let unmasked = build_frame(FrameKind::Text, b"x", false);
        assert_eq!(
            parse_client_frame(&unmasked),
            Err(FrameError::UnmaskedClientFrame)
        );

        let masked = build_frame(FrameKind::Text, b"x", true);
        assert_eq!(
            parse_server_frame(&masked),
            Err(FrameError::MaskedServerFrame)
        );
    }

    #[test]
    fn sixty_four_bit_high_bit_is_rejected() {
        let mut wire = vec![0x80 | 0x2, 0x80 | 127];
        wire.extend_from_slice(&(u64::MAX).to_be_bytes());
        wire.extend_from_slice(&[0, 0, 0, 0]);
        assert_eq!(parse_client_frame(&wire), Err(FrameError::LengthOverflow));
    }

    #[test]
    fn empty_payload_frame() {
        let wire = build_frame(FrameKind::Close, &[], false);
        assert_eq!(wire, vec![0x88, 0x00]);
        let frame = parse_server_frame(&wire).unwrap().unwrap();
        assert_eq!(frame.kind, FrameKind::Close);
        assert_eq!(frame.consumed, 2);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn trailing_bytes_are_not_consumed() {
        let mut wire = build_frame(FrameKind::Text, b"first", true);
        let first_len = wire.len();
        wire.extend_from_slice(&build_frame(FrameKind::Text, b"second", true));

        let frame = parse_client_frame(&wire).unwrap().unwrap();
        assert_eq!(frame.consumed, first_len);
        assert_eq!(frame.payload, b"first");

        let rest = &wire[frame.consumed..];
        let second = parse_client_frame(rest).unwrap().unwrap();
        assert_eq!(second.payload, b"second");
    }
}
