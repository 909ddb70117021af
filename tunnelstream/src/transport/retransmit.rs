//! Store of unacknowledged outbound packets.
//!
//! Packets are kept in sequence order until the remote acknowledges them.
//! Three things resend them: a fast retransmit when an acknowledgement reports
//! a gap, a timer-driven sweep once a packet is older than the RTO, and the
//! flow-control wait, which keeps sweeping while the reader is stalled.
//!
//! The RTT estimator lives under the same lock as the packets so that an
//! acknowledgement samples and updates the RTO atomically.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::flow_control::{FlowGate, FLOW_CONTROL_POLL};
use crate::rtt::RttEstimator;

/// A packet that has been sent to the remote and not yet acknowledged.
#[derive(Debug, Clone)]
pub struct OutboundPacket {
    /// Sequence number assigned when the packet was read from the local socket.
    pub seq: u32,
    /// Payload bytes.
    pub data: Bytes,
    /// Time of the most recent (re)transmission.
    pub send_time: Instant,
    /// Number of transmissions so far, including the first.
    pub times_sent: u32,
    /// Set once the packet has been resent, so a gap report resends it at most once.
    pub fast_retransmitted: bool,
}

impl OutboundPacket {
    pub fn new(seq: u32, data: Bytes, now: Instant) -> Self {
        Self {
            seq,
            data,
            send_time: now,
            times_sent: 1,
            fast_retransmitted: false,
        }
    }

    fn resent(&mut self, now: Instant) {
        self.send_time = now;
        self.times_sent += 1;
        self.fast_retransmitted = true;
    }
}

struct Inner {
    packets: BTreeMap<u32, OutboundPacket>,
    rtt: RttEstimator,
}

/// In-flight packets of one connection.
pub struct OutboundStore {
    inner: Mutex<Inner>,
    gate: FlowGate,
}

impl OutboundStore {
    /// Create an empty store. `max_buffered` bounds the in-flight count (0 = unbounded).
    pub fn new(rtt: RttEstimator, max_buffered: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                packets: BTreeMap::new(),
                rtt,
            }),
            gate: FlowGate::new(max_buffered),
        }
    }

    /// Add a packet, waiting while the store is over its limit.
    ///
    /// While waiting, expired packets keep being resent through `resend`.
    pub async fn enqueue<F>(&self, mut packet: OutboundPacket, mut resend: F)
    where
        F: FnMut(u32, &Bytes),
    {
        let mut waited = false;
        loop {
            {
                let mut inner = self.inner.lock();
                let in_flight = inner.packets.len();
                if self.gate.is_open(in_flight) {
                    if waited {
                        packet.send_time = Instant::now();
                    }
                    inner.packets.insert(packet.seq, packet);
                    return;
                }
                tracing::trace!(
                    seq = packet.seq,
                    in_flight,
                    limit = self.gate.limit(),
                    "waiting for acknowledgements before sending"
                );
            }

            waited = true;
            self.gate.wait(FLOW_CONTROL_POLL).await;
            self.standard_retransmit(Instant::now(), &mut resend);
        }
    }

    /// Remove every packet below `ack`, and the packet `exact` if given.
    ///
    /// Packets acknowledged on their first transmission feed the RTT
    /// estimator; resent ones are ambiguous and are skipped. Returns the
    /// number of packets removed.
    pub fn cumulative_ack(&self, ack: u32, exact: Option<u32>, now: Instant) -> usize {
        let mut guard = self.inner.lock();
        let Inner { packets, rtt } = &mut *guard;

        let before = packets.len();
        packets.retain(|&seq, packet| {
            let acked = seq < ack || exact == Some(seq);
            if acked && packet.times_sent == 1 {
                rtt.sample(now.saturating_duration_since(packet.send_time));
                tracing::trace!(seq, rto_ms = rtt.rto().as_millis() as u64, "rto updated");
            }
            !acked
        });
        let removed = before - packets.len();
        drop(guard);

        if removed > 0 {
            self.gate.release();
        }
        removed
    }

    /// Resend every packet in `low..=high` that has not been resent yet.
    pub fn fast_retransmit<F>(&self, low: u32, high: u32, now: Instant, mut resend: F) -> usize
    where
        F: FnMut(u32, &Bytes),
    {
        if low > high {
            return 0;
        }

        let mut inner = self.inner.lock();
        let mut count = 0;
        for (&seq, packet) in inner.packets.range_mut(low..=high) {
            if packet.fast_retransmitted {
                continue;
            }
            packet.resent(now);
            resend(seq, &packet.data);
            count += 1;
            tracing::debug!(seq, "fast retransmit");
        }
        count
    }

    /// Resend every packet whose last transmission is older than the RTO.
    ///
    /// Each resend doubles the connection RTO, so later packets in the same
    /// sweep are judged against the backed-off value.
    pub fn standard_retransmit<F>(&self, now: Instant, mut resend: F) -> usize
    where
        F: FnMut(u32, &Bytes),
    {
        let mut guard = self.inner.lock();
        let Inner { packets, rtt } = &mut *guard;

        let mut count = 0;
        for (&seq, packet) in packets.iter_mut() {
            if now.saturating_duration_since(packet.send_time) <= rtt.rto() {
                continue;
            }
            packet.resent(now);
            rtt.backoff();
            resend(seq, &packet.data);
            count += 1;
            tracing::debug!(
                seq,
                times_sent = packet.times_sent,
                rto_ms = rtt.rto().as_millis() as u64,
                "standard retransmit"
            );
        }
        count
    }

    /// Number of unacknowledged packets.
    pub fn len(&self) -> usize {
        self.inner.lock().packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the packet `seq` is still unacknowledged.
    pub fn contains(&self, seq: u32) -> bool {
        self.inner.lock().packets.contains_key(&seq)
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.inner.lock().rtt.rto()
    }

    /// Snapshot of the RTT estimator.
    pub fn rtt(&self) -> RttEstimator {
        self.inner.lock().rtt.clone()
    }

    /// Snapshot of the in-flight packet `seq`.
    pub fn get(&self, seq: u32) -> Option<OutboundPacket> {
        self.inner.lock().packets.get(&seq).cloned()
    }
}
