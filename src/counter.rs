//! Bandwidth and throughput accounting.
//!
//! Every peer session and the torrent itself need a notion of "recent rate"
//! to drive request queue sizing (§4.4), choke scoring (§4.5), and
//! bandwidth quota redistribution (§5). [`ThruputCounter`] is a small
//! sliding-window rate estimator; [`SpeedBucket`] classifies a counter's
//! current rate into the coarse buckets the piece picker uses to decide
//! whether a peer is "fast enough" to take over a stalled piece (§4.2 step
//! 4).

use std::time::{Duration, Instant};

/// The width of the sliding window used to estimate a rolling rate.
const WINDOW: Duration = Duration::from_secs(20);

/// Tracks total and recent (rolling-window) byte counts for one direction
/// of traffic (e.g. a session's downloaded payload bytes).
#[derive(Clone, Debug)]
pub struct ThruputCounter {
    /// Total bytes ever recorded.
    total: u64,
    /// Byte count within the current window.
    window_bytes: u64,
    /// When the current window started.
    window_start: Instant,
    /// The rate, in bytes/sec, as of the last time the window rolled over.
    last_rate: f64,
}

impl ThruputCounter {
    pub fn new() -> Self {
        Self {
            total: 0,
            window_bytes: 0,
            window_start: Instant::now(),
            last_rate: 0.0,
        }
    }

    /// Records `n` additional bytes transferred now.
    pub fn update(&mut self, n: u64) {
        self.roll_window_if_needed();
        self.total += n;
        self.window_bytes += n;
    }

    /// Returns the total number of bytes ever recorded.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns the current estimated rate, in bytes/sec.
    pub fn rate(&mut self) -> f64 {
        self.roll_window_if_needed();
        if self.window_bytes > 0 {
            let elapsed = self.window_start.elapsed().as_secs_f64().max(0.001);
            self.window_bytes as f64 / elapsed
        } else {
            self.last_rate
        }
    }

    fn roll_window_if_needed(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed >= WINDOW {
            let secs = elapsed.as_secs_f64().max(0.001);
            self.last_rate = self.window_bytes as f64 / secs;
            self.window_bytes = 0;
            self.window_start = Instant::now();
        }
    }
}

impl Default for ThruputCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// The coarse speed classification the piece picker uses to decide whether
/// a fast peer should be allowed to take over a piece that a slow peer left
/// stalled (§4.2 step 4).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SpeedBucket {
    /// No payload rate observed yet.
    None,
    Slow,
    Medium,
    Fast,
}

impl SpeedBucket {
    /// Classifies a rate, in bytes/sec, into a bucket.
    ///
    /// The thresholds are arbitrary but monotonic: what matters for the
    /// picker is the peer's rate *relative to others*, not the absolute
    /// number, so a fixed set of thresholds is a reasonable approximation.
    pub fn classify(rate_bytes_per_sec: f64) -> Self {
        const SLOW_THRESHOLD: f64 = 2.0 * 1024.0;
        const FAST_THRESHOLD: f64 = 50.0 * 1024.0;
        if rate_bytes_per_sec <= 0.0 {
            SpeedBucket::None
        } else if rate_bytes_per_sec < SLOW_THRESHOLD {
            SpeedBucket::Slow
        } else if rate_bytes_per_sec < FAST_THRESHOLD {
            SpeedBucket::Medium
        } else {
            SpeedBucket::Fast
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thruput_counter_accumulates_total() {
        let mut counter = ThruputCounter::new();
        counter.update(100);
        counter.update(50);
        assert_eq!(counter.total(), 150);
    }

    #[test]
    fn test_speed_bucket_ordering() {
        assert!(SpeedBucket::None < SpeedBucket::Slow);
        assert!(SpeedBucket::Slow < SpeedBucket::Medium);
        assert!(SpeedBucket::Medium < SpeedBucket::Fast);
    }

    #[test]
    fn test_speed_bucket_classify() {
        assert_eq!(SpeedBucket::classify(0.0), SpeedBucket::None);
        assert_eq!(SpeedBucket::classify(1024.0), SpeedBucket::Slow);
        assert_eq!(SpeedBucket::classify(1024.0 * 1024.0), SpeedBucket::Fast);
    }
}
