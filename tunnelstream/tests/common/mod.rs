//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tunnelstream::config::ConnectionConfig;
use tunnelstream::connection::{Connection, ConnectionContext};
use tunnelstream::frame::{HEADER_LEN, W3GS_HEADER};
use tunnelstream::transport::{EntryKeyResolver, MemberInfo, RemoteEndpoint, Tunnel};

/// Everything a connection handed to the tunnel, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Data { seq: u32, ack: u32, payload: Vec<u8> },
    Ack { seq: u32, ack: u32 },
    Close,
    Removed(u32),
}

/// Tunnel that records every call instead of sending datagrams.
pub struct RecordingTunnel {
    room_id: u32,
    sent: Mutex<Vec<Sent>>,
}

impl RecordingTunnel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            room_id: 42,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }

    /// Sequence numbers of every data packet, retransmissions included.
    pub fn data_seqs(&self) -> Vec<u32> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Data { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect()
    }

    pub fn data_payloads(&self) -> Vec<Vec<u8>> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Data { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    /// `(seq, ack)` of every acknowledgement.
    pub fn acks(&self) -> Vec<(u32, u32)> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Ack { seq, ack } => Some((*seq, *ack)),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> usize {
        self.sent.lock().iter().filter(|s| **s == Sent::Close).count()
    }

    pub fn removed(&self) -> Vec<u32> {
        self.sent
            .lock()
            .iter()
            .filter_map(|s| match s {
                Sent::Removed(id) => Some(*id),
                _ => None,
            })
            .collect()
    }
}

impl Tunnel for RecordingTunnel {
    fn send_data(&self, _remote: &RemoteEndpoint, _conn_id: u32, seq: u32, ack: u32, payload: &[u8]) {
        self.sent.lock().push(Sent::Data {
            seq,
            ack,
            payload: payload.to_vec(),
        });
    }

    fn send_ack(&self, _remote: &RemoteEndpoint, _conn_id: u32, seq: u32, ack: u32) {
        self.sent.lock().push(Sent::Ack { seq, ack });
    }

    fn send_close(&self, _remote: &RemoteEndpoint, _conn_id: u32) {
        self.sent.lock().push(Sent::Close);
    }

    fn remove_connection(&self, conn_id: u32) {
        self.sent.lock().push(Sent::Removed(conn_id));
    }

    fn room_id(&self) -> u32 {
        self.room_id
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn remote() -> RemoteEndpoint {
    RemoteEndpoint {
        address: Ipv4Addr::new(10, 0, 0, 2),
        port: 1513,
        user_id: 1001,
    }
}

pub fn member(name: &str) -> MemberInfo {
    MemberInfo {
        username: name.into(),
        experience: 12,
        country: "US".into(),
    }
}

pub fn connection(
    id: u32,
    config: ConnectionConfig,
    member: Option<MemberInfo>,
    tunnel: &Arc<RecordingTunnel>,
) -> Arc<Connection> {
    connection_with_resolver(id, config, member, tunnel, None)
}

pub fn connection_with_resolver(
    id: u32,
    config: ConnectionConfig,
    member: Option<MemberInfo>,
    tunnel: &Arc<RecordingTunnel>,
    resolver: Option<Arc<dyn EntryKeyResolver>>,
) -> Arc<Connection> {
    let ctx = ConnectionContext {
        config: Arc::new(config),
        tunnel: Arc::clone(tunnel) as Arc<dyn Tunnel>,
        resolver,
    };
    Connection::new(id, remote(), member, ctx)
}

/// Resolver backed by a fixed key table.
pub struct StaticKeys(pub HashMap<u32, u32>);

impl EntryKeyResolver for StaticKeys {
    fn resolve(&self, entry_key: u32) -> Option<u32> {
        self.0.get(&entry_key).copied()
    }
}

/// Build a W3GS frame of the given kind around `body`.
pub fn w3gs(kind: u8, body: &[u8]) -> Vec<u8> {
    let mut frame = vec![W3GS_HEADER, kind];
    frame.extend_from_slice(&((body.len() + HEADER_LEN) as u16).to_le_bytes());
    frame.extend_from_slice(body);
    frame
}

/// Poll `cond` until it holds, failing the test after a few seconds.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
