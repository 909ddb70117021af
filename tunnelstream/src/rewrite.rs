//! Rewriting of frames on their way to the local game server.
//!
//! Only join requests are touched: the player name they carry is whatever the
//! remote client chose, so it is replaced with the name the tunnel verified for
//! the connection. When the host advertises a substitute entry key on the
//! tunnel, the real key is put back as well.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TunnelError};
use crate::frame::{FrameHeader, HEADER_LEN, W3GS_HEADER, W3GS_REQJOIN};
use crate::transport::EntryKeyResolver;

/// Bytes in front of the name: header, host counter, entry key, reserved
/// byte, listen port and peer key.
const NAME_OFFSET: usize = HEADER_LEN + 4 + 4 + 1 + 2 + 4;

/// Decoded W3GS join request. Integer fields are little-endian on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub host_counter: u32,
    pub entry_key: u32,
    pub reserved: u8,
    pub listen_port: u16,
    pub peer_key: u32,
    /// Player name without its NUL terminator.
    pub name: Bytes,
    /// Everything after the name, kept verbatim.
    pub remainder: Bytes,
}

impl JoinRequest {
    /// Shortest frame accepted as a join request.
    pub const MIN_LEN: usize = 21;

    /// Decode a complete join request frame, header included.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        if frame.len() < Self::MIN_LEN {
            return Err(TunnelError::JoinRequestTooShort(frame.len()));
        }

        let mut body = &frame[HEADER_LEN..];
        let host_counter = body.get_u32_le();
        let entry_key = body.get_u32_le();
        let reserved = body.get_u8();
        let listen_port = body.get_u16_le();
        let peer_key = body.get_u32_le();

        let nul = body
            .iter()
            .position(|&b| b == 0)
            .ok_or(TunnelError::UnterminatedString)?;
        let name = Bytes::copy_from_slice(&body[..nul]);
        let remainder = Bytes::copy_from_slice(&body[nul + 1..]);

        Ok(Self {
            host_counter,
            entry_key,
            reserved,
            listen_port,
            peer_key,
            name,
            remainder,
        })
    }

    /// Length of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        NAME_OFFSET + self.name.len() + 1 + self.remainder.len()
    }

    /// Encode with a freshly computed length field.
    ///
    /// The length field only holds frames up to 65535 bytes; `Rewriter`
    /// rejects anything longer before encoding.
    pub fn encode(&self) -> Bytes {
        let len = self.encoded_len();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_u8(W3GS_HEADER);
        buf.put_u8(W3GS_REQJOIN);
        buf.put_u16_le(len as u16);
        buf.put_u32_le(self.host_counter);
        buf.put_u32_le(self.entry_key);
        buf.put_u8(self.reserved);
        buf.put_u16_le(self.listen_port);
        buf.put_u32_le(self.peer_key);
        buf.put_slice(&self.name);
        buf.put_u8(0);
        buf.put_slice(&self.remainder);
        buf.freeze()
    }
}

/// Rewrites frames for one connection.
pub struct Rewriter {
    conn_id: u32,
    /// Name the tunnel verified for the remote user.
    remote_name: String,
    /// Present when entry key substitution is enabled.
    resolver: Option<Arc<dyn EntryKeyResolver>>,
}

impl Rewriter {
    pub fn new(
        conn_id: u32,
        remote_name: impl Into<String>,
        resolver: Option<Arc<dyn EntryKeyResolver>>,
    ) -> Self {
        Self {
            conn_id,
            remote_name: remote_name.into(),
            resolver,
        }
    }

    /// Rewrite one complete frame. Frames other than join requests come back unchanged.
    pub fn rewrite(&self, frame: Bytes) -> Result<Bytes> {
        match FrameHeader::peek(&frame) {
            Some(header) if header.kind == W3GS_REQJOIN => {}
            _ => return Ok(frame),
        }

        let mut join = JoinRequest::decode(&frame)?;

        let claimed = String::from_utf8_lossy(&join.name);
        if !claimed.eq_ignore_ascii_case(&self.remote_name) {
            tracing::warn!(
                conn_id = self.conn_id,
                remote_name = %self.remote_name,
                claimed = %claimed,
                "join request with mismatched name"
            );
        }
        join.name = Bytes::copy_from_slice(self.remote_name.as_bytes());

        if let Some(resolver) = &self.resolver {
            if let Some(real_key) = resolver.resolve(join.entry_key) {
                tracing::debug!(
                    conn_id = self.conn_id,
                    from = join.entry_key,
                    to = real_key,
                    "rewrote entry key"
                );
                join.entry_key = real_key;
            }
        }

        let len = join.encoded_len();
        if len > usize::from(u16::MAX) {
            return Err(TunnelError::JoinRequestTooLong(len));
        }
        Ok(join.encode())
    }
}
