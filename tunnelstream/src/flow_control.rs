//! Backpressure between the local reader and the in-flight packet store.
//!
//! Local reads stall while more than `limit` packets are unacknowledged.
//! Every removal from the store wakes the stalled reader, which re-checks the
//! count; the wait is also bounded so the reader can keep running
//! retransmission sweeps while it is blocked.

use std::time::Duration;

use tokio::sync::Notify;

/// How long a blocked producer waits before re-checking the window.
pub const FLOW_CONTROL_POLL: Duration = Duration::from_millis(100);

/// Packet-count window for one connection.
pub struct FlowGate {
    /// Maximum in-flight packets; 0 means unlimited.
    limit: usize,
    /// Signalled whenever packets leave the store.
    drained: Notify,
}

impl FlowGate {
    /// Create a gate that admits new packets while at most `limit` are in flight.
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            drained: Notify::new(),
        }
    }

    /// The configured limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether a new packet may be added with `in_flight` packets outstanding.
    pub fn is_open(&self, in_flight: usize) -> bool {
        self.limit == 0 || in_flight <= self.limit
    }

    /// Record that packets were removed from the store.
    pub fn release(&self) {
        // A single producer waits per connection, so a stored permit is
        // enough to avoid losing a wake-up that races with `wait`.
        self.drained.notify_one();
    }

    /// Wait until `release` is called or `timeout` elapses.
    ///
    /// Returns `true` if woken by a release.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.drained.notified())
            .await
            .is_ok()
    }
}
