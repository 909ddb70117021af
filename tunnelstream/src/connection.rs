//! Virtual connection state machine.
//!
//! A connection bridges one local socket and one tunnel identity:
//! Initializing -> Active -> Terminated.
//!
//! While active, a dedicated worker task reads the local socket, sends each
//! payload over the tunnel and runs timer-driven retransmission. Inbound tunnel
//! events (`acknowledge`, `data`) arrive on whatever task the tunnel
//! demultiplexer uses and may run concurrently with the worker and with each
//! other. Shared state is split into lock domains:
//!
//! - the outbound store (packets plus RTT estimator),
//! - the inbound side (reorder buffer plus reassembler),
//! - the lifecycle state.
//!
//! Locks are only ever nested outbound -> timestamps and inbound -> local
//! writer, so the domains cannot deadlock.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::ConnectionConfig;
use crate::error::{Result, TunnelError};
use crate::frame::{MetadataFrame, Reassembler};
use crate::rewrite::Rewriter;
use crate::rtt::RttEstimator;
use crate::stream::{self, LocalReader};
use crate::transport::reliable_ordered::{Delivery, ReorderBuffer};
use crate::transport::retransmit::{OutboundPacket, OutboundStore};
use crate::transport::{EntryKeyResolver, MemberInfo, RemoteEndpoint, Tunnel};

/// Connection state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created, local socket not attached yet.
    Initializing,
    /// Relaying between the local socket and the tunnel.
    Active,
    /// Closed for good; inbound events are ignored.
    Terminated,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Initializing => write!(f, "Initializing"),
            ConnectionState::Active => write!(f, "Active"),
            ConnectionState::Terminated => write!(f, "Terminated"),
        }
    }
}

/// Collaborators shared by every connection of a tunnel.
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<ConnectionConfig>,
    pub tunnel: Arc<dyn Tunnel>,
    /// Consulted only when `config.rewrite_entry_key` is set.
    pub resolver: Option<Arc<dyn EntryKeyResolver>>,
}

struct Inbound {
    reorder: ReorderBuffer,
    /// Present when inbound bytes are split into frames before forwarding.
    reassembler: Option<Reassembler>,
}

/// One virtual TCP connection carried over the tunnel.
pub struct Connection {
    id: u32,
    remote: RemoteEndpoint,
    member: Option<MemberInfo>,
    /// Verified name of the remote user, or their user id if unknown.
    remote_name: String,
    config: Arc<ConnectionConfig>,
    tunnel: Arc<dyn Tunnel>,
    rewriter: Rewriter,

    state: Mutex<ConnectionState>,
    /// Next sequence number assigned to local data. Only the worker writes it.
    seq: AtomicU32,
    /// Next sequence number expected from the remote, published under the
    /// inbound lock.
    ack: AtomicU32,
    outbound: OutboundStore,
    inbound: Mutex<Inbound>,
    /// Frames queued for the local socket; `None` once closed.
    local_tx: Mutex<Option<UnboundedSender<Bytes>>>,
    /// Wakes the worker when the connection terminates.
    shutdown: Notify,
    last_sent: Mutex<Instant>,
    last_received: Mutex<Instant>,
}

impl Connection {
    /// Create a connection in the `Initializing` state.
    pub fn new(
        id: u32,
        remote: RemoteEndpoint,
        member: Option<MemberInfo>,
        ctx: ConnectionContext,
    ) -> Arc<Self> {
        let config = ctx.config;
        let remote_name = match &member {
            Some(member) => member.username.clone(),
            None => remote.user_id.to_string(),
        };
        let resolver = if config.rewrite_entry_key {
            ctx.resolver
        } else {
            None
        };
        let rtt = RttEstimator::new(config.rtt.clone(), config.standard_delay);
        let now = Instant::now();

        Arc::new(Self {
            id,
            rewriter: Rewriter::new(id, remote_name.clone(), resolver),
            remote,
            member,
            remote_name,
            tunnel: ctx.tunnel,
            state: Mutex::new(ConnectionState::Initializing),
            seq: AtomicU32::new(0),
            ack: AtomicU32::new(0),
            outbound: OutboundStore::new(rtt, config.max_buffered_packets),
            inbound: Mutex::new(Inbound {
                reorder: ReorderBuffer::new(),
                reassembler: config.reassemble.then(Reassembler::new),
            }),
            local_tx: Mutex::new(None),
            shutdown: Notify::new(),
            last_sent: Mutex::new(now),
            last_received: Mutex::new(now),
            config,
        })
    }

    /// Validate the requested destination and dial the local server.
    ///
    /// Returns `false`, with the connection terminated, if the remote user's
    /// name is reserved, the port is not allowed or the dial fails.
    pub async fn init_outbound(self: &Arc<Self>, destination_port: u16) -> bool {
        tracing::info!(
            conn_id = self.id,
            remote_name = %self.remote_name,
            address = %self.remote.address,
            destination_port,
            "starting virtual connection"
        );

        if let Err(err) = self.validate_destination(destination_port) {
            tracing::warn!(conn_id = self.id, remote_name = %self.remote_name, error = %err, "rejecting connection");
            self.end();
            return false;
        }

        let host = self.config.local_host.as_str();
        let socket = match TcpStream::connect((host, destination_port)).await {
            Ok(socket) => socket,
            Err(err) => {
                tracing::warn!(conn_id = self.id, host, destination_port, error = %err, "failed to reach local host");
                self.end();
                return false;
            }
        };

        let metadata = self.config.send_metadata.then(|| self.metadata_frame());
        self.start(socket, metadata)
    }

    /// Adopt an already accepted local socket.
    pub fn init_inbound<S>(self: &Arc<Self>, socket: S)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        tracing::info!(
            conn_id = self.id,
            address = %self.remote.address,
            port = self.remote.port,
            "starting reverse virtual connection"
        );
        self.start(socket, None);
    }

    fn validate_destination(&self, destination_port: u16) -> Result<()> {
        if self.config.is_reserved_name(&self.remote_name) {
            return Err(TunnelError::ReservedName(self.remote_name.clone()));
        }
        if !self.config.is_valid_port(destination_port) {
            return Err(TunnelError::PortNotAllowed(destination_port));
        }
        Ok(())
    }

    fn metadata_frame(&self) -> Bytes {
        let (experience, country) = match &self.member {
            Some(member) => (member.experience, MetadataFrame::country_code(&member.country)),
            None => (-1, MetadataFrame::UNKNOWN_COUNTRY),
        };
        MetadataFrame {
            address: self.remote.address,
            user_id: self.remote.user_id,
            room_id: self.tunnel.room_id(),
            experience,
            country,
        }
        .encode()
    }

    /// Attach the local socket and spawn the writer and worker tasks.
    fn start<S>(self: &Arc<Self>, socket: S, first_frame: Option<Bytes>) -> bool
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(socket);
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(frame) = first_frame {
            // The receiver is alive until this function returns.
            let _ = tx.send(frame);
        }

        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Terminated {
                return false;
            }
            *self.local_tx.lock() = Some(tx);
            *state = ConnectionState::Active;
        }

        let weak = Arc::downgrade(self);
        let conn_id = self.id;
        tokio::spawn(async move {
            if let Err(err) = stream::forward_frames(rx, writer).await {
                tracing::warn!(conn_id, error = %err, "writing to local host failed");
                if let Some(conn) = Weak::upgrade(&weak) {
                    conn.end();
                }
            }
        });

        let reader = LocalReader::new(reader, self.config.framed_reads);
        tokio::spawn(Arc::clone(self).run(reader));
        true
    }

    /// Worker loop: retransmit, read the local socket, send what was read.
    async fn run<R>(self: Arc<Self>, mut reader: LocalReader<R>)
    where
        R: AsyncRead + Unpin,
    {
        while !self.is_terminated() {
            self.standard_retransmit();

            let read = tokio::select! {
                read = tokio::time::timeout(self.config.read_timeout, reader.read_packet()) => read,
                _ = self.shutdown.notified() => break,
            };

            match read {
                // Read timeout: loop back to retransmission.
                Err(_) => continue,
                Ok(Ok(Some(payload))) => {
                    tokio::select! {
                        _ = self.send_local_payload(payload) => {}
                        _ = self.shutdown.notified() => break,
                    }
                }
                Ok(Ok(None)) => {
                    tracing::info!(conn_id = self.id, "local host disconnected");
                    self.end();
                }
                Ok(Err(err)) => {
                    tracing::warn!(conn_id = self.id, error = %err, "reading from local host failed");
                    self.end();
                }
            }
        }
        tracing::trace!(conn_id = self.id, "worker stopped");
    }

    /// Turn a local payload into the next outbound packet and send it.
    async fn send_local_payload(&self, payload: Bytes) {
        *self.last_received.lock() = Instant::now();

        let seq = self.seq.load(Ordering::Acquire);
        tracing::trace!(conn_id = self.id, seq, len = payload.len(), "new packet from local host");

        let packet = OutboundPacket::new(seq, payload.clone(), Instant::now());
        self.outbound
            .enqueue(packet, |seq, data| self.resend(seq, data))
            .await;

        self.tunnel
            .send_data(&self.remote, self.id, seq, self.ack(), &payload);
        self.touch_sent();
        self.seq.store(seq.wrapping_add(1), Ordering::Release);
    }

    /// The remote acknowledged our packet `seq` and expects `ack` next.
    pub fn acknowledge(&self, seq: u32, ack: u32) {
        if self.is_terminated() {
            return;
        }
        *self.last_received.lock() = Instant::now();
        tracing::trace!(conn_id = self.id, seq, ack, "received acknowledgement");

        let now = Instant::now();
        self.outbound.cumulative_ack(ack, Some(seq), now);

        // Everything between the remote's ack and the packet it just saw is missing.
        if ack < seq {
            self.outbound
                .fast_retransmit(ack, seq - 1, now, |seq, data| self.resend(seq, data));
        }

        self.standard_retransmit();
    }

    /// The remote sent the packet `seq` and expects our `ack` next.
    pub fn data(&self, seq: u32, ack: u32, payload: &[u8]) {
        if self.is_terminated() {
            return;
        }
        *self.last_received.lock() = Instant::now();
        tracing::trace!(conn_id = self.id, seq, ack, len = payload.len(), "received data");

        self.outbound.cumulative_ack(ack, None, Instant::now());
        self.standard_retransmit();

        let next_ack = {
            let mut inbound = self.inbound.lock();
            match inbound.reorder.receive(seq, Bytes::copy_from_slice(payload)) {
                Delivery::Deliver(chunks) => {
                    for chunk in chunks {
                        match inbound.reassembler.as_mut() {
                            Some(reassembler) => reassembler.extend(&chunk),
                            None => self.forward_local(chunk),
                        }
                    }
                }
                Delivery::Buffered => {
                    tracing::trace!(conn_id = self.id, seq, "storing early packet");
                }
                Delivery::Duplicate => {
                    tracing::trace!(conn_id = self.id, seq, "ignoring old packet");
                }
            }
            let next_ack = inbound.reorder.expected();
            self.ack.store(next_ack, Ordering::Release);
            next_ack
        };

        self.tunnel.send_ack(&self.remote, self.id, seq, next_ack);
        self.touch_sent();

        if let Err(err) = self.drain_frames() {
            tracing::warn!(conn_id = self.id, error = %err, "protocol violation from remote, disconnecting");
            self.end();
        }
    }

    /// Forward every complete reassembled frame, rewritten, to the local host.
    fn drain_frames(&self) -> Result<()> {
        let mut inbound = self.inbound.lock();
        let Some(reassembler) = inbound.reassembler.as_mut() else {
            return Ok(());
        };
        // Frames are forwarded under the lock so concurrent `data` calls
        // cannot interleave them.
        while let Some(frame) = reassembler.next_frame()? {
            let frame = self.rewriter.rewrite(frame)?;
            self.forward_local(frame);
        }
        Ok(())
    }

    fn forward_local(&self, data: Bytes) {
        if let Some(tx) = self.local_tx.lock().as_ref() {
            // A closed channel means the writer already failed and terminated us.
            let _ = tx.send(data);
        }
    }

    fn resend(&self, seq: u32, data: &Bytes) {
        self.tunnel
            .send_data(&self.remote, self.id, seq, self.ack(), data);
        self.touch_sent();
    }

    fn standard_retransmit(&self) {
        self.outbound
            .standard_retransmit(Instant::now(), |seq, data| self.resend(seq, data));
    }

    fn touch_sent(&self) {
        *self.last_sent.lock() = Instant::now();
    }

    /// Terminate the connection.
    ///
    /// The first call closes the local socket, sends the close signals and
    /// deregisters from the tunnel; later calls do nothing.
    pub fn end(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Terminated {
                return;
            }
            *state = ConnectionState::Terminated;
        }

        tracing::info!(
            conn_id = self.id,
            address = %self.remote.address,
            remote_name = %self.remote_name,
            "terminating connection"
        );

        // Dropping the sender lets the writer flush what is queued and shut
        // the socket down.
        self.local_tx.lock().take();
        self.shutdown.notify_one();

        for _ in 0..self.config.close_signals {
            self.tunnel.send_close(&self.remote, self.id);
        }
        self.tunnel.remove_connection(self.id);
    }

    /// Whether neither side has been heard from for `idle_timeout`.
    ///
    /// The connection does not terminate itself; a reaper polls this.
    pub fn is_timed_out(&self) -> bool {
        let now = Instant::now();
        let idle = self.config.idle_timeout;
        let since_sent = now.saturating_duration_since(*self.last_sent.lock());
        let since_received = now.saturating_duration_since(*self.last_received.lock());
        since_sent > idle && since_received > idle
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn remote(&self) -> &RemoteEndpoint {
        &self.remote
    }

    pub fn remote_name(&self) -> &str {
        &self.remote_name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == ConnectionState::Terminated
    }

    /// Next sequence number assigned to local data.
    pub fn seq(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }

    /// Next sequence number expected from the remote.
    pub fn ack(&self) -> u32 {
        self.ack.load(Ordering::Acquire)
    }

    /// Number of unacknowledged outbound packets.
    pub fn in_flight(&self) -> usize {
        self.outbound.len()
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.outbound.rto()
    }
}
