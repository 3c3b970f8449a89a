//! Fixed window counter.
//!
//! Windows are aligned to multiples of `window_ms` since the epoch, and the
//! store key is suffixed with the window index so every window gets a fresh
//! counter that expires with it.
//!
//! Known property of this algorithm: up to `2 * limit` requests can pass in
//! a short span straddling a window boundary.

use super::Decision;

/// Index of the aligned window containing `now`.
pub fn window_index(now: u64, window_ms: u64) -> u64 {
    now / window_ms
}

/// `(start, end)` of the aligned window containing `now`.
pub fn window_bounds(now: u64, window_ms: u64) -> (u64, u64) {
    let start = window_index(now, window_ms) * window_ms;
    (start, start + window_ms)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedWindow {
    count: u64,
}

impl FixedWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_count(count: u64) -> Self {
        Self { count }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// `self` must be the counter for the window containing `now`.
    pub fn check(&mut self, limit: u64, window_ms: u64, now: u64) -> Decision {
        let (start, end) = window_bounds(now, window_ms);

        if self.count >= limit {
            return Decision {
                allowed: false,
                total_hits: self.count as i64,
                remaining: 0,
                reset_time: end,
                window_start: start,
                window_end: end,
                retry_after: Some(end - now),
            };
        }

        self.count += 1;
        Decision {
            allowed: true,
            total_hits: self.count as i64,
            remaining: limit - self.count,
            reset_time: end,
            window_start: start,
            window_end: end,
            retry_after: None,
        }
    }
}
