//! Wire frame definition.
//!
//! ```text
//! [Length(8, LE)] [PacketId(1)] [SenderId(1)] [Payload(N)]
//! ```
//!
//! The length field counts payload bytes only.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{ProtocolError, Result};

/// Size of the fixed frame header in bytes
pub const HEADER_LEN: usize = 10;

/// Size of the length prefix in bytes
pub const LENGTH_LEN: usize = 8;

/// One length-prefixed unit of wire data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub packet_id: u8,
    pub sender_id: u8,
    pub payload: Bytes,
}

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_len: u64,
    pub packet_id: u8,
    pub sender_id: u8,
}

impl FrameHeader {
    /// Parse a header from the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// Returns `None` if fewer than [`HEADER_LEN`] bytes are available.
    #[inline]
    pub fn peek(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        let mut len_bytes = [0u8; LENGTH_LEN];
        len_bytes.copy_from_slice(&buf[..LENGTH_LEN]);
        Some(Self {
            payload_len: u64::from_le_bytes(len_bytes),
            packet_id: buf[LENGTH_LEN],
            sender_id: buf[LENGTH_LEN + 1],
        })
    }
}

impl Frame {
    pub fn new(packet_id: u8, sender_id: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_id,
            sender_id,
            payload: payload.into(),
        }
    }

    /// Total encoded size (header plus payload)
    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Write the header and payload into `dst`
    pub fn write_to(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u64_le(self.payload.len() as u64);
        dst.put_u8(self.packet_id);
        dst.put_u8(self.sender_id);
        dst.extend_from_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut buf);
        buf.to_vec()
    }

    /// Decode exactly one frame from a complete buffer.
    ///
    /// Trailing bytes after the declared payload are rejected.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let header = FrameHeader::peek(buf).ok_or(ProtocolError::InvalidHeader)?;
        let len = usize::try_from(header.payload_len)
            .map_err(|_| ProtocolError::OversizedPacket(usize::MAX))?;

        if len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::OversizedPacket(len));
        }
        if buf.len() != HEADER_LEN + len {
            return Err(ProtocolError::InvalidHeader);
        }

        let mut rest = &buf[HEADER_LEN..];
        let payload = rest.copy_to_bytes(len);
        Ok(Self {
            packet_id: header.packet_id,
            sender_id: header.sender_id,
            payload,
        })
    }
}
