//! RTT estimation and retransmission timeout (RFC 2988).
//!
//! RTTVAR = (1 - beta) * RTTVAR + beta * |SRTT - sample|
//! SRTT   = (1 - alpha) * SRTT + alpha * sample
//! RTO    = ceil(SRTT + max(G, K * RTTVAR))
//!
//! Samples are clamped to the configured bounds before use; the RTO itself is
//! not clamped, so repeated backoff can grow it without limit.

use std::time::Duration;

use crate::config::RttConfig;

/// RTT estimator driving the connection-wide retransmission timeout.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    config: RttConfig,
    /// Smoothed RTT in milliseconds, `None` until the first sample.
    srtt: Option<f64>,
    /// RTT variation in milliseconds.
    rttvar: f64,
    /// Current retransmission timeout.
    rto: Duration,
}

impl RttEstimator {
    /// Create an estimator whose RTO starts at `initial_rto`.
    pub fn new(config: RttConfig, initial_rto: Duration) -> Self {
        Self {
            config,
            srtt: None,
            rttvar: 0.0,
            rto: initial_rto,
        }
    }

    /// Feed a round-trip sample taken from a packet's first transmission.
    pub fn sample(&mut self, rtt: Duration) {
        let lower = self.config.lower.as_secs_f64() * 1000.0;
        let upper = self.config.upper.as_secs_f64() * 1000.0;
        let rtt = (rtt.as_secs_f64() * 1000.0).clamp(lower, upper);

        let srtt = match self.srtt {
            None => {
                self.rttvar = rtt / 2.0;
                rtt
            }
            Some(srtt) => {
                let beta = self.config.beta;
                let alpha = self.config.alpha;
                self.rttvar = (1.0 - beta) * self.rttvar + beta * (srtt - rtt).abs();
                (1.0 - alpha) * srtt + alpha * rtt
            }
        };
        self.srtt = Some(srtt);

        let granularity = self.config.granularity.as_secs_f64() * 1000.0;
        let variance = granularity.max(f64::from(self.config.k) * self.rttvar);
        self.rto = Duration::from_millis((srtt + variance).ceil() as u64);
    }

    /// Double the retransmission timeout after a timer-driven resend.
    pub fn backoff(&mut self) {
        self.rto = self.rto.saturating_mul(2);
    }

    /// Whether at least one sample has been taken.
    pub fn measured(&self) -> bool {
        self.srtt.is_some()
    }

    /// Smoothed RTT, or `None` if no samples yet.
    pub fn srtt(&self) -> Option<Duration> {
        self.srtt.map(millis_to_duration)
    }

    /// RTT variation, or `None` if no samples yet.
    pub fn rttvar(&self) -> Option<Duration> {
        self.srtt.map(|_| millis_to_duration(self.rttvar))
    }

    /// Current retransmission timeout.
    pub fn rto(&self) -> Duration {
        self.rto
    }
}

/// Round fractional milliseconds to the nearest microsecond.
fn millis_to_duration(ms: f64) -> Duration {
    Duration::from_micros((ms * 1000.0).round() as u64)
}
