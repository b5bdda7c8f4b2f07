//! Co-simulation wire format: framing for everything that crosses the
//! rig/terrain process boundary.
//!
//! Every frame is a fixed 52-byte header followed by `length` body bytes.
//! The header is #[repr(C, packed)] with zerocopy derives, so it is read and
//! written without allocation or unsafe code. Bodies are JSON-encoded
//! `Message`s; barrier frames have an empty body.
//!
//! The receiver rejects a frame before interpreting its body if the version,
//! reserved flags, length or content hash do not check out. Ordering (step and
//! per-direction sequence number) is enforced by the channel, not here.

use bytes::{BufMut, Bytes, BytesMut};
use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::payload::Message;

// ── Frame Header ──────────────────────────────────────────────────────────────

/// Header preceding every frame body.
///
/// Wire size: 52 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FrameHeader {
    /// BLAKE3 hash of the body bytes. Verified before the body is parsed.
    pub content_hash: [u8; 32],

    /// Co-simulation step the frame belongs to. `STARTUP_STEP` for the
    /// startup barrier and the initialization handshake.
    pub step: u64,

    /// Per-direction sequence number, starting at 0. A gap or repeat means a
    /// lost or duplicated frame.
    pub sequence: u32,

    /// Body length in bytes, not including this header.
    pub length: u32,

    /// `FrameKind` byte.
    pub kind: u8,

    /// Rank of the sending process.
    pub sender: u8,

    /// Wire format version. Currently 0x01.
    pub version: u8,

    /// Reserved, must be zero.
    pub flags: u8,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FrameHeader, [u8; 52]);

/// Size of `FrameHeader` on the wire.
pub const HEADER_LEN: usize = std::mem::size_of::<FrameHeader>();

// ── Frame Kind ────────────────────────────────────────────────────────────────

/// What a frame carries. Must agree with the body's `Message` variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Barrier = 0x01,
    RigInit = 0x02,
    TerrainInit = 0x03,
    RigState = 0x04,
    TerrainResponse = 0x05,
    Abort = 0x0f,
}

impl FrameKind {
    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Barrier => "barrier",
            FrameKind::RigInit => "rig_init",
            FrameKind::TerrainInit => "terrain_init",
            FrameKind::RigState => "rig_state",
            FrameKind::TerrainResponse => "terrain_response",
            FrameKind::Abort => "abort",
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Barrier),
            0x02 => Ok(FrameKind::RigInit),
            0x03 => Ok(FrameKind::TerrainInit),
            0x04 => Ok(FrameKind::RigState),
            0x05 => Ok(FrameKind::TerrainResponse),
            0x0f => Ok(FrameKind::Abort),
            other => Err(WireError::UnknownKind(other)),
        }
    }
}

impl From<FrameKind> for u8 {
    fn from(k: FrameKind) -> u8 {
        k as u8
    }
}

// ── Constants ─────────────────────────────────────────────────────────────────

/// Current frame format version.
pub const FRAME_VERSION: u8 = 0x01;

/// Step value used before the first co-simulation step.
pub const STARTUP_STEP: u64 = u64::MAX;

/// Maximum body size in bytes. A fine flexible-tire mesh is a few MB of JSON.
pub const MAX_BODY: usize = 64 * 1024 * 1024;

// ── Frame ─────────────────────────────────────────────────────────────────────

/// A decoded, hash-verified frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub sender: u8,
    pub step: u64,
    pub sequence: u32,
    pub body: Bytes,
}

impl Frame {
    /// Parse the body as a `Message` and check it matches the header kind.
    pub fn message(&self) -> Result<Message, WireError> {
        if self.kind == FrameKind::Barrier {
            return Err(WireError::NoBody);
        }
        let msg: Message = serde_json::from_slice(&self.body)
            .map_err(|e| WireError::BodyParse(e.to_string()))?;
        if msg.kind() != self.kind {
            return Err(WireError::KindMismatch {
                header: self.kind.name(),
                body: msg.name(),
            });
        }
        Ok(msg)
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

fn encode(
    kind: FrameKind,
    sender: u8,
    step: u64,
    sequence: u32,
    body: &[u8],
) -> Result<Bytes, WireError> {
    if body.len() > MAX_BODY {
        return Err(WireError::BodyTooLarge(body.len()));
    }
    let header = FrameHeader {
        content_hash: *blake3::hash(body).as_bytes(),
        step,
        sequence,
        length: body.len() as u32,
        kind: kind.into(),
        sender,
        version: FRAME_VERSION,
        flags: 0,
    };
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(body);
    Ok(buf.freeze())
}

/// Encode a barrier frame for `step`.
pub fn encode_barrier(sender: u8, step: u64, sequence: u32) -> Result<Bytes, WireError> {
    encode(FrameKind::Barrier, sender, step, sequence, &[])
}

/// Encode a message frame for `step`.
pub fn encode_message(
    sender: u8,
    step: u64,
    sequence: u32,
    msg: &Message,
) -> Result<Bytes, WireError> {
    let body = serde_json::to_vec(msg).map_err(|e| WireError::BodyEncode(e.to_string()))?;
    encode(msg.kind(), sender, step, sequence, &body)
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Parse and validate a header. Does not look at the body.
pub fn decode_header(bytes: &[u8]) -> Result<FrameHeader, WireError> {
    let header = FrameHeader::read_from_prefix(bytes).ok_or(WireError::Truncated {
        needed: HEADER_LEN,
        got: bytes.len(),
    })?;
    let version = header.version;
    if version != FRAME_VERSION {
        return Err(WireError::UnknownVersion(version));
    }
    let flags = header.flags;
    if flags != 0 {
        return Err(WireError::ReservedFlagsSet(flags));
    }
    let length = header.length as usize;
    if length > MAX_BODY {
        return Err(WireError::BodyTooLarge(length));
    }
    FrameKind::try_from(header.kind)?;
    Ok(header)
}

/// Verify a body against its header and build the frame.
pub fn verify_body(header: &FrameHeader, body: Bytes) -> Result<Frame, WireError> {
    let length = header.length as usize;
    if body.len() != length {
        return Err(WireError::Truncated {
            needed: length,
            got: body.len(),
        });
    }
    let expected = header.content_hash;
    if *blake3::hash(&body).as_bytes() != expected {
        return Err(WireError::HashMismatch);
    }
    Ok(Frame {
        kind: FrameKind::try_from(header.kind)?,
        sender: header.sender,
        step: header.step,
        sequence: header.sequence,
        body,
    })
}

/// Decode a complete frame (header + body) from one buffer.
pub fn decode_frame(bytes: Bytes) -> Result<Frame, WireError> {
    let header = decode_header(&bytes)?;
    let body = bytes.slice(HEADER_LEN..);
    verify_body(&header, body)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown frame kind: 0x{0:02x}")]
    UnknownKind(u8),

    #[error("unknown frame version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("body length {0} exceeds maximum {}", MAX_BODY)]
    BodyTooLarge(usize),

    #[error("truncated frame: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("body hash does not match header")]
    HashMismatch,

    #[error("barrier frames carry no body")]
    NoBody,

    #[error("failed to encode body: {0}")]
    BodyEncode(String),

    #[error("failed to parse body: {0}")]
    BodyParse(String),

    #[error("header kind {header} does not match body {body}")]
    KindMismatch { header: &'static str, body: &'static str },
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{TerrainResponse, TerrainSample};

    fn sample_message() -> Message {
        Message::TerrainResponse(TerrainResponse::Sample(TerrainSample {
            height: -0.013,
            stiffness: 1.0e6,
            damping: 60.0,
        }))
    }

    #[test]
    fn header_layout_is_fixed() {
        assert_eq!(HEADER_LEN, 52);
        let bytes = encode_barrier(1, 7, 3).unwrap();
        assert_eq!(bytes.len(), 52);
        // step sits right after the hash, sequence right after the step
        let step = u64::from_ne_bytes(bytes[32..40].try_into().unwrap());
        let sequence = u32::from_ne_bytes(bytes[40..44].try_into().unwrap());
        assert_eq!(step, 7);
        assert_eq!(sequence, 3);
        assert_eq!(bytes[48], FrameKind::Barrier as u8);
        assert_eq!(bytes[49], 1);
        assert_eq!(bytes[50], FRAME_VERSION);
    }

    #[test]
    fn message_frame_decodes_to_same_message() {
        let msg = sample_message();
        let bytes = encode_message(1, 42, 9, &msg).unwrap();
        let frame = decode_frame(bytes).unwrap();
        assert_eq!(frame.kind, FrameKind::TerrainResponse);
        assert_eq!(frame.step, 42);
        assert_eq!(frame.sequence, 9);
        assert_eq!(frame.sender, 1);
        assert_eq!(frame.message().unwrap(), msg);
    }

    #[test]
    fn corrupted_body_is_rejected() {
        let bytes = encode_message(0, 1, 0, &sample_message()).unwrap();
        let mut raw = bytes.to_vec();
        let last = raw.len() - 2;
        raw[last] ^= 0x20;
        let err = decode_frame(Bytes::from(raw)).unwrap_err();
        assert_eq!(err, WireError::HashMismatch);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let bytes = encode_barrier(0, 0, 0).unwrap();
        let mut raw = bytes.to_vec();
        raw[50] = 0x7f;
        assert_eq!(
            decode_header(&raw).unwrap_err(),
            WireError::UnknownVersion(0x7f)
        );
    }

    #[test]
    fn truncated_header_is_rejected() {
        let err = decode_header(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, WireError::Truncated { needed: 52, got: 10 }));
    }

    #[test]
    fn barrier_has_no_message() {
        let frame = decode_frame(encode_barrier(0, 5, 1).unwrap()).unwrap();
        assert_eq!(frame.message().unwrap_err(), WireError::NoBody);
    }

    #[test]
    fn unknown_kind_error_message() {
        let err = FrameKind::try_from(0xAB).unwrap_err();
        assert!(err.to_string().contains("0xab"));
    }
}
