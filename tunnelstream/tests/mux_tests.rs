//! Connection table tests: routing by connection id and idle reaping.

mod common;

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tunnelstream::config::ConnectionConfig;
use tunnelstream::connection::{Connection, ConnectionContext};
use tunnelstream::mux::ConnectionTable;
use tunnelstream::transport::{RemoteEndpoint, Tunnel};

use common::{connection, remote, RecordingTunnel};

fn raw_config() -> ConnectionConfig {
    ConnectionConfig {
        reassemble: false,
        ..ConnectionConfig::default()
    }
}

#[tokio::test]
async fn dispatch_routes_by_id() {
    let tunnel = RecordingTunnel::new();
    let table = ConnectionTable::new();
    let a = connection(1, raw_config(), None, &tunnel);
    let b = connection(2, raw_config(), None, &tunnel);
    table.insert(Arc::clone(&a));
    table.insert(Arc::clone(&b));
    assert_eq!(table.len(), 2);

    assert!(table.dispatch_data(2, 0, 0, b"x"));
    assert_eq!(a.ack(), 0);
    assert_eq!(b.ack(), 1);

    assert!(table.dispatch_ack(1, 0, 0));
    assert!(!table.dispatch_ack(3, 0, 0));
    assert!(!table.dispatch_data(3, 0, 0, b"x"));
}

#[tokio::test]
async fn insert_replaces_same_id() {
    let tunnel = RecordingTunnel::new();
    let table = ConnectionTable::new();
    assert!(table.insert(connection(1, raw_config(), None, &tunnel)).is_none());
    assert!(table.insert(connection(1, raw_config(), None, &tunnel)).is_some());
    assert_eq!(table.len(), 1);
}

#[tokio::test]
async fn terminated_connections_are_removed() {
    let tunnel = RecordingTunnel::new();
    let table = ConnectionTable::new();
    let a = connection(1, raw_config(), None, &tunnel);
    table.insert(Arc::clone(&a));
    table.insert(connection(2, raw_config(), None, &tunnel));

    a.end();
    table.remove_terminated();
    assert_eq!(table.ids(), vec![2]);
}

#[tokio::test(start_paused = true)]
async fn idle_connections_are_reaped() {
    let tunnel = RecordingTunnel::new();
    let table = ConnectionTable::new();
    table.insert(connection(1, raw_config(), None, &tunnel));
    table.insert(connection(2, raw_config(), None, &tunnel));

    assert!(table.reap_idle().is_empty());

    tokio::time::sleep(Duration::from_secs(200)).await;
    // Keep connection 2 alive.
    table.dispatch_ack(2, 0, 0);
    tokio::time::sleep(Duration::from_secs(150)).await;

    assert_eq!(table.reap_idle(), vec![1]);
    assert_eq!(table.ids(), vec![2]);
    assert_eq!(tunnel.removed(), vec![1]);
    assert_eq!(tunnel.closes(), 4);
}

// ---------------------------------------------------------------------------
// Tunnel that deregisters from the table it serves
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TableTunnel {
    table: Mutex<Weak<ConnectionTable>>,
}

impl Tunnel for TableTunnel {
    fn send_data(&self, _: &RemoteEndpoint, _: u32, _: u32, _: u32, _: &[u8]) {}
    fn send_ack(&self, _: &RemoteEndpoint, _: u32, _: u32, _: u32) {}
    fn send_close(&self, _: &RemoteEndpoint, _: u32) {}

    fn remove_connection(&self, conn_id: u32) {
        if let Some(table) = self.table.lock().upgrade() {
            table.remove(conn_id);
        }
    }

    fn room_id(&self) -> u32 {
        0
    }
}

#[tokio::test(start_paused = true)]
async fn reaping_does_not_deadlock_with_tunnel_removal() {
    let table = Arc::new(ConnectionTable::new());
    let tunnel = Arc::new(TableTunnel::default());
    *tunnel.table.lock() = Arc::downgrade(&table);

    let ctx = ConnectionContext {
        config: Arc::new(ConnectionConfig::default()),
        tunnel: tunnel as Arc<dyn Tunnel>,
        resolver: None,
    };
    table.insert(Connection::new(7, remote(), None, ctx.clone()));
    table.insert(Connection::new(8, remote(), None, ctx));

    tokio::time::sleep(Duration::from_secs(301)).await;
    let mut reaped = table.reap_idle();
    reaped.sort_unstable();
    assert_eq!(reaped, vec![7, 8]);
    assert!(table.is_empty());
}
