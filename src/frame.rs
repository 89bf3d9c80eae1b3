//! Legacy push-frame codec
//!
//! Peers that only speak the newer transfer protocol receive legacy pushes
//! through a tunnel (see `manager`). On the wire the legacy push protocol
//! frames each message with a small fixed header:
//!
//! ```text
//! ┌──────────────┬──────────────────────┬──────────────────────────┐
//! │ Version (1B) │ Payload length (4B)  │ Payload                  │
//! │    0x01      │ big-endian u32       │ (may span several sends) │
//! └──────────────┴──────────────────────┴──────────────────────────┘
//! ```
//!
//! Outbound, the header tells the tunnel how many payload bytes to
//! accumulate before issuing a single alternate-protocol put. Inbound, a
//! whole message received over the alternate protocol is re-framed with
//! this header and replayed byte-for-byte, as if it had arrived on the
//! original push service.

use std::fmt;

/// Frame format version carried in the first header byte.
pub const FRAME_VERSION: u8 = 0x01;

/// Length of the fixed frame header.
pub const HEADER_LEN: usize = 5;

/// Upper bound on a single push payload (1 MiB is far beyond any real tag
/// or handover message).
pub const MAX_PAYLOAD: u32 = 0x0010_0000;

/// Errors raised while parsing a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Fewer than [`HEADER_LEN`] bytes available.
    Truncated,
    /// Unknown version byte.
    BadVersion(u8),
    /// Advertised payload length exceeds [`MAX_PAYLOAD`].
    Oversize(u32),
    /// More payload bytes arrived than the header advertised.
    LengthMismatch,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Truncated => write!(f, "truncated frame header"),
            FrameError::BadVersion(version) => write!(f, "unknown frame version {:#04x}", version),
            FrameError::Oversize(len) => write!(f, "payload length {} exceeds maximum", len),
            FrameError::LengthMismatch => write!(f, "payload longer than advertised"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Encode the fixed header for a payload of `payload_len` bytes.
pub fn encode_header(payload_len: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = FRAME_VERSION;
    header[1..5].copy_from_slice(&payload_len.to_be_bytes());
    header
}

/// Frame a whole payload: header followed by the payload bytes.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&encode_header(payload.len() as u32));
    frame.extend_from_slice(payload);
    frame
}

/// Parse a frame header, returning the advertised payload length.
pub fn parse_header(data: &[u8]) -> Result<u32, FrameError> {
    if data.len() < HEADER_LEN {
        return Err(FrameError::Truncated);
    }
    if data[0] != FRAME_VERSION {
        return Err(FrameError::BadVersion(data[0]));
    }
    let payload_len = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    if payload_len > MAX_PAYLOAD {
        return Err(FrameError::Oversize(payload_len));
    }
    Ok(payload_len)
}
