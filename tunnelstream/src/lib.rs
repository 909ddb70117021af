//! TunnelStream -- reliable virtual TCP connections over a lossy datagram tunnel.
//!
//! Each connection relays a local game server socket to a remote tunnel user:
//! - **Outbound**: sequence numbering, RFC 2988 retransmission timing, fast
//!   retransmit of gaps and optional flow control
//! - **Inbound**: reordering, W3GS frame reassembly and join request rewriting
//! - **Lifecycle**: idempotent termination and idle detection

pub mod config;
pub mod connection;
pub mod error;
pub mod flow_control;
pub mod frame;
pub mod mux;
pub mod rewrite;
pub mod rtt;
pub mod stream;
pub mod transport;

// Re-export key public types at crate root.
pub use config::{ConnectionConfig, RttConfig};
pub use connection::{Connection, ConnectionContext, ConnectionState};
pub use error::{Result, TunnelError};
pub use frame::{MetadataFrame, Reassembler};
pub use mux::ConnectionTable;
pub use rewrite::{JoinRequest, Rewriter};
pub use rtt::RttEstimator;
pub use transport::{EntryKeyResolver, MemberInfo, RemoteEndpoint, Tunnel};
