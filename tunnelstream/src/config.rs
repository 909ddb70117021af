//! Per-connection tunables.
//!
//! Defaults mirror what deployed tunnel hosts run with; callers that load
//! settings from a file build a `ConnectionConfig` and override fields.

use std::time::Duration;

/// Parameters of the RFC 2988 retransmission timer.
#[derive(Debug, Clone)]
pub struct RttConfig {
    /// Gain applied to a new sample when updating the smoothed RTT.
    pub alpha: f64,
    /// Gain applied to the deviation when updating the RTT variation.
    pub beta: f64,
    /// Samples below this are raised to it.
    pub lower: Duration,
    /// Samples above this are lowered to it.
    pub upper: Duration,
    /// Clock granularity floor for the variance component.
    pub granularity: Duration,
    /// Variance multiplier.
    pub k: u32,
}

impl Default for RttConfig {
    fn default() -> Self {
        Self {
            alpha: 0.125,
            beta: 0.25,
            lower: Duration::from_millis(10),
            upper: Duration::from_millis(60_000),
            granularity: Duration::from_millis(1),
            k: 4,
        }
    }
}

/// Configuration for a virtual connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Host of the local game server that outbound connections dial.
    pub local_host: String,
    /// Destination ports remote users may request.
    pub local_ports: Vec<u16>,
    /// Names remote users may not connect with (compared case-insensitively).
    pub reserved_names: Vec<String>,
    /// Split inbound bytes into W3GS frames before forwarding them locally,
    /// which enables the join request rewrite.
    pub reassemble: bool,
    /// Read whole W3GS frames from the local socket instead of whatever
    /// bytes happen to be available.
    pub framed_reads: bool,
    /// In-flight packet count above which local reads stall. 0 disables it.
    pub max_buffered_packets: usize,
    /// Retransmission timeout used until the first RTT sample arrives.
    pub standard_delay: Duration,
    /// Local read timeout; on expiry the worker only runs a retransmission sweep.
    pub read_timeout: Duration,
    /// RTT estimator parameters.
    pub rtt: RttConfig,
    /// Write a metadata frame describing the remote user to the local server
    /// once an outbound connection is established.
    pub send_metadata: bool,
    /// Replace the entry key of join requests with the one returned by the
    /// entry key resolver.
    pub rewrite_entry_key: bool,
    /// A connection is timed out when neither side has been heard from for this long.
    pub idle_timeout: Duration,
    /// Number of close signals sent to the remote on termination.
    pub close_signals: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            local_host: "192.168.1.1".into(),
            local_ports: Vec::new(),
            reserved_names: Vec::new(),
            reassemble: true,
            framed_reads: true,
            max_buffered_packets: 0,
            standard_delay: Duration::from_millis(3000),
            read_timeout: Duration::from_millis(1000),
            rtt: RttConfig::default(),
            send_metadata: false,
            rewrite_entry_key: false,
            idle_timeout: Duration::from_secs(300),
            // The reference client sends four.
            close_signals: 4,
        }
    }
}

impl ConnectionConfig {
    /// Whether remote users may connect to `port`.
    pub fn is_valid_port(&self, port: u16) -> bool {
        self.local_ports.contains(&port)
    }

    /// Whether `name` is in the reserved list.
    pub fn is_reserved_name(&self, name: &str) -> bool {
        self.reserved_names
            .iter()
            .any(|reserved| reserved.eq_ignore_ascii_case(name))
    }
}
