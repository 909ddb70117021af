//! The local half of a virtual connection: the socket to the game server.
//!
//! Reads produce the payloads that become outbound tunnel packets. In framed
//! mode a payload is exactly one W3GS frame; in raw mode it is whatever a
//! single read returned. Reads go through an internal buffer so a read that is
//! abandoned on timeout never loses bytes.
//!
//! Writes are funnelled through a channel into one task that owns the write
//! half, so inbound tunnel events never block on the socket.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::error::{Result, TunnelError};
use crate::frame::{FrameHeader, HEADER_LEN};

/// Largest payload taken from a single raw read.
pub const MAX_RAW_READ: usize = 64 * 1024;

/// Reads outbound payloads from the local socket.
pub struct LocalReader<R> {
    reader: R,
    framed: bool,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> LocalReader<R> {
    pub fn new(reader: R, framed: bool) -> Self {
        Self {
            reader,
            framed,
            buf: BytesMut::with_capacity(MAX_RAW_READ),
        }
    }

    /// Read the next payload. Returns `Ok(None)` at end of stream.
    ///
    /// Cancel safe: bytes read before the future is dropped stay buffered.
    pub async fn read_packet(&mut self) -> Result<Option<Bytes>> {
        loop {
            if let Some(packet) = self.split_packet()? {
                return Ok(Some(packet));
            }

            self.buf.reserve(MAX_RAW_READ);
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                return Ok(None);
            }
        }
    }

    fn split_packet(&mut self) -> Result<Option<Bytes>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if !self.framed {
            let len = self.buf.len().min(MAX_RAW_READ);
            return Ok(Some(self.buf.split_to(len).freeze()));
        }

        let Some(header) = FrameHeader::peek(&self.buf) else {
            return Ok(None);
        };
        let len = usize::from(header.length);
        if len < HEADER_LEN {
            return Err(TunnelError::InvalidFrameLength(header.length));
        }
        if self.buf.len() < len {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(len).freeze()))
    }
}

/// Write every frame received on `frames` to `writer`, then shut it down.
///
/// Returns once the sending side of the channel is gone, or on the first
/// write error.
pub async fn forward_frames<W>(mut frames: UnboundedReceiver<Bytes>, mut writer: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.recv().await {
        writer.write_all(&frame).await?;
    }
    writer.shutdown().await
}
