//! Throughput sampling

use std::time::{Duration, Instant};

use crate::transport::TransportStats;

/// Minimum time between two samples
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Byte rates derived from cumulative transport counters
#[derive(Debug, Clone)]
pub struct ThroughputSampler {
    last_sample: Instant,
    last_sent: u64,
    last_received: u64,
    bytes_per_second_sent: u64,
    bytes_per_second_received: u64,
}

impl ThroughputSampler {
    pub fn new(now: Instant) -> Self {
        ThroughputSampler {
            last_sample: now,
            last_sent: 0,
            last_received: 0,
            bytes_per_second_sent: 0,
            bytes_per_second_received: 0,
        }
    }

    /// Recompute rates once at least a second has elapsed. Returns whether
    /// a new sample was taken.
    pub fn sample(&mut self, now: Instant, stats: &TransportStats) -> bool {
        let elapsed = now.saturating_duration_since(self.last_sample);
        if elapsed < SAMPLE_INTERVAL {
            return false;
        }

        let secs = elapsed.as_secs_f64();
        let sent = stats.bytes_sent.saturating_sub(self.last_sent);
        let received = stats.bytes_received.saturating_sub(self.last_received);
        self.bytes_per_second_sent = (sent as f64 / secs) as u64;
        self.bytes_per_second_received = (received as f64 / secs) as u64;

        self.last_sample = now;
        self.last_sent = stats.bytes_sent;
        self.last_received = stats.bytes_received;
        true
    }

    pub fn bytes_per_second_sent(&self) -> u64 {
        self.bytes_per_second_sent
    }

    pub fn bytes_per_second_received(&self) -> u64 {
        self.bytes_per_second_received
    }
}
