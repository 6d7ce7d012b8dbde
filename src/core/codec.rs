//! Frame codec for length-prefixed byte streams.
//!
//! [`FrameCodec`] plugs into `tokio_util::codec` for the write half of a
//! connection. The read half uses [`FrameReader`], which keeps its buffer across
//! calls so a transient read error never discards a partially received frame.

use bytes::{Buf, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::frame::{Frame, FrameHeader, HEADER_LEN};
use crate::error::{ProtocolError, Result};

/// Initial capacity of the read buffer
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl FrameCodec {
    pub fn new(max_payload_size: usize) -> Self {
        Self { max_payload_size }
    }

    pub fn max_payload_size(&self) -> usize {
        self.max_payload_size
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        let Some(header) = FrameHeader::peek(src) else {
            return Ok(None);
        };

        let len = usize::try_from(header.payload_len)
            .map_err(|_| ProtocolError::OversizedPacket(usize::MAX))?;
        if len > self.max_payload_size {
            return Err(ProtocolError::OversizedPacket(len));
        }

        let total = HEADER_LEN + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame {
            packet_id: header.packet_id,
            sender_id: header.sender_id,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        if item.payload.len() > self.max_payload_size {
            return Err(ProtocolError::OversizedPacket(item.payload.len()));
        }
        item.write_to(dst);
        Ok(())
    }
}

/// Buffered frame reader over any async byte source.
pub struct FrameReader<R> {
    inner: R,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, codec: FrameCodec) -> Self {
        Self {
            inner,
            codec,
            buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
        }
    }

    /// Read the next complete frame.
    ///
    /// Returns `Ok(None)` when the peer closed the stream on a frame boundary.
    /// A close in the middle of a frame is reported as `UnexpectedEof`.
    /// After any `Err`, the call may be repeated; buffered bytes are kept.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            let n = self.inner.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("stream closed with {} buffered bytes", self.buffer.len()),
                )));
            }
        }
    }

    /// Bytes received but not yet decoded into a frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Read exactly one frame: the header, then exactly its payload.
///
/// Never consumes bytes past the end of the frame, so the stream can be handed
/// to a [`FrameReader`] afterwards without losing data.
pub async fn read_frame_exact<R>(reader: &mut R, max_payload_size: usize) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let header = FrameHeader::peek(&header).ok_or(ProtocolError::InvalidHeader)?;

    let len = usize::try_from(header.payload_len)
        .map_err(|_| ProtocolError::OversizedPacket(usize::MAX))?;
    if len > max_payload_size {
        return Err(ProtocolError::OversizedPacket(len));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Frame::new(header.packet_id, header.sender_id, payload))
}

/// Write one frame and flush it
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&frame.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
