//! In-order delivery of inbound tunnel packets.
//!
//! Packets ahead of the next expected sequence number wait in a BTreeMap and
//! are released as soon as the gap in front of them closes. Anything behind
//! the expected number has already been delivered and is dropped.

use std::collections::BTreeMap;

use bytes::Bytes;

/// What happened to a packet handed to the reorder buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The packet and any buffered successors are ready, in order.
    Deliver(Vec<Bytes>),
    /// The packet arrived early and is held back.
    Buffered,
    /// The packet was already delivered.
    Duplicate,
}

/// Receiving side of a virtual connection.
///
/// Early packets are held without limit: every distinct sequence number ahead
/// of `expected` stays buffered until the gap closes or the connection ends.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    /// The next sequence number we expect to deliver.
    expected: u32,
    /// Early packets awaiting contiguous delivery.
    pending: BTreeMap<u32, Bytes>,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept the packet `seq` from the remote.
    pub fn receive(&mut self, seq: u32, data: Bytes) -> Delivery {
        if seq < self.expected {
            return Delivery::Duplicate;
        }
        if seq > self.expected {
            self.pending.insert(seq, data);
            return Delivery::Buffered;
        }

        let mut delivered = vec![data];
        self.expected = self.expected.wrapping_add(1);
        while let Some(next) = self.pending.remove(&self.expected) {
            delivered.push(next);
            self.expected = self.expected.wrapping_add(1);
        }
        Delivery::Deliver(delivered)
    }

    /// The next sequence number expected from the remote.
    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Number of early packets being held.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}
