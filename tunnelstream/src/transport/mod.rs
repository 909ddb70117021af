//! The seam between a virtual connection and the datagram tunnel.
//!
//! The tunnel itself (socket, encryption, demultiplexing by connection id)
//! lives outside this crate; a connection only sees the `Tunnel` trait.

pub mod reliable_ordered;
pub mod retransmit;

use std::net::Ipv4Addr;

/// The remote end of a virtual connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEndpoint {
    /// Tunnel address of the remote user.
    pub address: Ipv4Addr,
    /// Tunnel port of the remote user.
    pub port: u16,
    /// Network-assigned user id.
    pub user_id: u32,
}

/// Room member details known for the remote user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberInfo {
    pub username: String,
    pub experience: i32,
    /// Country code; only the first two characters are used.
    pub country: String,
}

/// Send primitives and bookkeeping offered by the outer tunnel interface.
///
/// Sends are fire-and-forget: the tunnel is lossy by nature and the
/// connection recovers from any dropped datagram by retransmitting.
pub trait Tunnel: Send + Sync {
    /// Send a data packet carrying `payload` with the given sequence numbers.
    fn send_data(&self, remote: &RemoteEndpoint, conn_id: u32, seq: u32, ack: u32, payload: &[u8]);

    /// Acknowledge the remote packet `seq`; `ack` is our next expected sequence.
    fn send_ack(&self, remote: &RemoteEndpoint, conn_id: u32, seq: u32, ack: u32);

    /// Signal that the connection is closed.
    fn send_close(&self, remote: &RemoteEndpoint, conn_id: u32);

    /// Forget the connection; later packets for `conn_id` are no longer routed.
    fn remove_connection(&self, conn_id: u32);

    /// Id of the room the tunnel is joined to.
    fn room_id(&self) -> u32;
}

/// Maps the entry key advertised on the tunnel back to the key the local
/// game host expects.
pub trait EntryKeyResolver: Send + Sync {
    fn resolve(&self, entry_key: u32) -> Option<u32>;
}
