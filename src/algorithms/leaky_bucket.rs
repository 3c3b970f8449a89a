//! Leaky bucket.
//!
//! The inverse of the token bucket: every accepted request adds one unit of
//! volume, and the bucket drains continuously at `limit / window_ms` per
//! millisecond. A request is accepted while the drained volume is below
//! `limit`, so the bucket models queue fullness rather than credit.

use super::Decision;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LeakyBucket {
    volume: f64,
    last_leak: u64,
}

impl LeakyBucket {
    pub fn empty(now: u64) -> Self {
        Self {
            volume: 0.0,
            last_leak: now,
        }
    }

    pub fn from_parts(volume: f64, last_leak: u64) -> Self {
        Self {
            volume: if volume.is_finite() { volume.max(0.0) } else { 0.0 },
            last_leak,
        }
    }

    pub fn volume(&self) -> f64 {
        self.volume
    }

    pub fn last_leak(&self) -> u64 {
        self.last_leak
    }

    fn leak(&mut self, rate: f64, now: u64) {
        let elapsed = now.saturating_sub(self.last_leak);
        self.volume = (self.volume - elapsed as f64 * rate).max(0.0);
        self.last_leak = self.last_leak.max(now);
    }

    pub fn check(&mut self, limit: u64, window_ms: u64, now: u64) -> Decision {
        if limit == 0 {
            return Decision::zero_limit(window_ms, now);
        }

        let rate = limit as f64 / window_ms as f64;
        self.leak(rate, now);

        let allowed = self.volume < limit as f64;
        if allowed {
            self.volume += 1.0;
        }

        let total_hits = self.volume.ceil() as u64;
        let retry_after = if allowed {
            None
        } else {
            // First millisecond at which the volume drops below the limit
            Some(((self.volume - limit as f64) / rate).floor() as u64 + 1)
        };

        Decision {
            allowed,
            total_hits: total_hits as i64,
            remaining: limit.saturating_sub(total_hits),
            reset_time: now + (self.volume / rate).ceil() as u64,
            window_start: now,
            window_end: now + window_ms,
            retry_after,
        }
    }
}
