//! Courier wire format: how a `Message` travels over a byte stream.
//!
//! Every message is exactly one frame:
//!
//!   [prelude: 16 bytes][header block: header_len bytes][body: body_len bytes]
//!
//! The prelude is fixed-size and #[repr(C, packed)] so the reader can size
//! both variable parts before reading them. The header block is JSON; the
//! body is raw bytes (sealed or plaintext). There is no unsafe code here.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use thiserror::Error;
use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::message::{Headers, Message, MessageType};

pub const MAGIC: [u8; 4] = *b"CRR1";
pub const VERSION: u8 = 1;
pub const PRELUDE_SIZE: usize = 16;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Fixed frame prelude. Wire size: 16 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FramePrelude {
    /// Always "CRR1". Anything else is not a Courier frame.
    pub magic: [u8; 4],
    /// Wire format version. Currently 0x01.
    pub version: u8,
    /// Reserved, must be zero.
    pub flags: u8,
    pub reserved: [u8; 2],
    /// Length of the JSON header block.
    pub header_len: U32<LittleEndian>,
    /// Length of the body.
    pub body_len: U32<LittleEndian>,
}

// Compile-time size guard. If this fails, the wire format has silently changed.
assert_eq_size!(FramePrelude, [u8; PRELUDE_SIZE]);

impl FramePrelude {
    pub fn new(header_len: u32, body_len: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags: 0,
            reserved: [0; 2],
            header_len: U32::new(header_len),
            body_len: U32::new(body_len),
        }
    }

    /// Parse and validate a prelude read off the stream.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        let prelude = Self::read_from(bytes).ok_or(WireError::Truncated(bytes.len()))?;
        if prelude.magic != MAGIC {
            return Err(WireError::BadMagic(prelude.magic));
        }
        if prelude.version != VERSION {
            return Err(WireError::UnsupportedVersion(prelude.version));
        }
        Ok(prelude)
    }

    pub fn header_len(&self) -> usize {
        self.header_len.get() as usize
    }

    pub fn body_len(&self) -> usize {
        self.body_len.get() as usize
    }

    /// Reject frames whose declared size exceeds `max_frame_bytes`,
    /// before anything is allocated for them.
    pub fn check_limit(&self, max_frame_bytes: usize) -> Result<(), WireError> {
        let total = self.header_len().saturating_add(self.body_len());
        if total > max_frame_bytes {
            return Err(WireError::TooLarge {
                size: total,
                limit: max_frame_bytes,
            });
        }
        Ok(())
    }
}

// ── Header block ──────────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct HeaderBlock {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(default)]
    owner_id: String,
    #[serde(default)]
    signature: String,
    #[serde(default)]
    headers: Headers,
}

// ── Encode / decode ───────────────────────────────────────────────────────────

/// Serialize a message into one complete frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>, WireError> {
    let block = HeaderBlock {
        kind: msg.kind.as_u8(),
        owner_id: msg.owner_id.clone(),
        signature: msg.signature.clone(),
        headers: msg.headers.clone(),
    };
    let header = serde_json::to_vec(&block).map_err(WireError::Header)?;

    let header_len = u32::try_from(header.len()).map_err(|_| WireError::TooLarge {
        size: header.len(),
        limit: u32::MAX as usize,
    })?;
    let body_len = u32::try_from(msg.body.len()).map_err(|_| WireError::TooLarge {
        size: msg.body.len(),
        limit: u32::MAX as usize,
    })?;

    let prelude = FramePrelude::new(header_len, body_len);
    let mut out = Vec::with_capacity(PRELUDE_SIZE + header.len() + msg.body.len());
    out.extend_from_slice(prelude.as_bytes());
    out.extend_from_slice(&header);
    out.extend_from_slice(&msg.body);
    Ok(out)
}

/// Rebuild a message from a validated prelude and the two variable parts.
pub fn decode(prelude: &FramePrelude, header: &[u8], body: Bytes) -> Result<Message, WireError> {
    if header.len() != prelude.header_len() {
        return Err(WireError::Truncated(header.len()));
    }
    if body.len() != prelude.body_len() {
        return Err(WireError::Truncated(body.len()));
    }

    let block: HeaderBlock = serde_json::from_slice(header).map_err(WireError::Header)?;
    let kind = MessageType::from_u8(block.kind).ok_or(WireError::UnknownType(block.kind))?;

    Ok(Message {
        kind,
        owner_id: block.owner_id,
        signature: block.signature,
        headers: block.headers,
        body,
    })
}

/// Decode a whole frame held in one buffer.
pub fn decode_frame(frame: &[u8]) -> Result<Message, WireError> {
    if frame.len() < PRELUDE_SIZE {
        return Err(WireError::Truncated(frame.len()));
    }
    let prelude = FramePrelude::parse(&frame[..PRELUDE_SIZE])?;
    let header_end = PRELUDE_SIZE + prelude.header_len();
    let body_end = header_end + prelude.body_len();
    if frame.len() != body_end {
        return Err(WireError::Truncated(frame.len()));
    }
    decode(
        &prelude,
        &frame[PRELUDE_SIZE..header_end],
        Bytes::copy_from_slice(&frame[header_end..]),
    )
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum WireError {
    #[error("not a courier frame (magic {0:02x?})")]
    BadMagic([u8; 4]),

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("truncated frame ({0} bytes)")]
    Truncated(usize),

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    TooLarge { size: usize, limit: usize },

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("malformed header block: {0}")]
    Header(serde_json::Error),
}
