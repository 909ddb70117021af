//! Application frames exchanged with the local game server.
//!
//! Every W3GS message starts with a 4-byte header:
//!
//! ```text
//! +--------+---------+------------------+---- variable ----+
//! | marker |  kind   | length (u16, LE) |     payload      |
//! |  0xF7  |  (1B)   | includes header  |                  |
//! +--------+---------+------------------+------------------+
//! ```
//!
//! The tunnel carries an arbitrary byte stream, so inbound bytes are
//! reassembled here and split on these headers before being handed to the
//! rewrite step. This module also encodes the metadata frame written to the
//! local server when an outbound connection is established.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TunnelError};

/// Marker byte of every W3GS frame.
pub const W3GS_HEADER: u8 = 0xF7;
/// W3GS join request.
pub const W3GS_REQJOIN: u8 = 0x1E;
/// Marker byte of metadata frames.
pub const GCBI_HEADER: u8 = 0xF9;
/// Metadata frame describing a newly connected remote user.
pub const GCBI_INIT: u8 = 0x01;

/// Length of a frame header.
pub const HEADER_LEN: usize = 4;
/// Length of the metadata frame.
pub const METADATA_LEN: usize = 22;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub marker: u8,
    pub kind: u8,
    /// Total frame length, header included.
    pub length: u16,
}

impl FrameHeader {
    /// Decode a header from the first four bytes of `data`.
    ///
    /// Returns `None` if fewer than four bytes are available.
    pub fn peek(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        Some(Self {
            marker: data[0],
            kind: data[1],
            length: (&data[2..4]).get_u16_le(),
        })
    }

    /// Reject headers that cannot start a W3GS frame.
    pub fn validate(&self) -> Result<()> {
        if self.marker != W3GS_HEADER {
            return Err(TunnelError::InvalidFrameHeader(self.marker));
        }
        if usize::from(self.length) < HEADER_LEN {
            return Err(TunnelError::InvalidFrameLength(self.length));
        }
        Ok(())
    }
}

/// Splits the in-order inbound byte stream into whole frames.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: BytesMut,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append in-order bytes received from the remote.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes not yet split into a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Split off the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed, and an error when the
    /// buffered bytes cannot be a W3GS frame; the stream is unrecoverable
    /// after that.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        let Some(header) = FrameHeader::peek(&self.buf) else {
            return Ok(None);
        };
        header.validate()?;

        let length = usize::from(header.length);
        if self.buf.len() < length {
            return Ok(None);
        }
        Ok(Some(self.buf.split_to(length).freeze()))
    }
}

/// Description of the remote user sent to the local server ahead of any data.
///
/// Header fields are little-endian like every W3GS header; the body is
/// big-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataFrame {
    pub address: Ipv4Addr,
    pub user_id: u32,
    pub room_id: u32,
    /// Experience of the remote user, -1 if unknown.
    pub experience: i32,
    /// Two-letter country code, `??` if unknown.
    pub country: [u8; 2],
}

impl MetadataFrame {
    /// Placeholder country code.
    pub const UNKNOWN_COUNTRY: [u8; 2] = *b"??";

    /// Take the first two bytes of `country`, padding with `?`.
    pub fn country_code(country: &str) -> [u8; 2] {
        let mut code = Self::UNKNOWN_COUNTRY;
        for (slot, byte) in code.iter_mut().zip(country.bytes()) {
            *slot = byte;
        }
        code
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(METADATA_LEN);
        buf.put_u8(GCBI_HEADER);
        buf.put_u8(GCBI_INIT);
        buf.put_u16_le(METADATA_LEN as u16);
        buf.put_slice(&self.address.octets());
        buf.put_u32(self.user_id);
        buf.put_u32(self.room_id);
        buf.put_i32(self.experience);
        buf.put_slice(&self.country);
        buf.freeze()
    }
}
