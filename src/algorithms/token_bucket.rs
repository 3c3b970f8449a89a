//! Token bucket.
//!
//! Tokens refill continuously at `limit / window_ms` per millisecond, capped
//! at `limit`. A request is accepted when at least one whole token is
//! available after refilling, and consumes it.

use serde::{Deserialize, Serialize};

use super::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: u64,
}

impl TokenBucket {
    /// A bucket for a key that has never been seen starts full.
    pub fn full(limit: u64, now: u64) -> Self {
        Self {
            tokens: limit as f64,
            last_refill: now,
        }
    }

    pub fn from_parts(tokens: f64, last_refill: u64) -> Self {
        Self {
            tokens: if tokens.is_finite() { tokens.max(0.0) } else { 0.0 },
            last_refill,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn last_refill(&self) -> u64 {
        self.last_refill
    }

    fn refill(&mut self, limit: u64, rate: f64, now: u64) {
        let elapsed = now.saturating_sub(self.last_refill);
        self.tokens = (self.tokens + elapsed as f64 * rate).clamp(0.0, limit as f64);
        self.last_refill = self.last_refill.max(now);
    }

    pub fn check(&mut self, limit: u64, window_ms: u64, now: u64) -> Decision {
        if limit == 0 {
            return Decision::zero_limit(window_ms, now);
        }

        let rate = limit as f64 / window_ms as f64;
        self.refill(limit, rate, now);

        let allowed = self.tokens >= 1.0;
        if allowed {
            self.tokens = (self.tokens - 1.0).max(0.0);
        }

        let remaining = (self.tokens.floor() as u64).min(limit);
        let until_full = ((limit as f64 - self.tokens) / rate).ceil() as u64;

        Decision {
            allowed,
            total_hits: (limit - remaining) as i64,
            remaining,
            reset_time: now + until_full,
            window_start: now,
            window_end: now + window_ms,
            retry_after: if allowed {
                None
            } else {
                Some((((1.0 - self.tokens) / rate).ceil() as u64).max(1))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_bucket_creation() {
        let bucket = TokenBucket::full(10, 1_000);
        assert_eq!(bucket.tokens(), 10.0);
        assert_eq!(bucket.last_refill(), 1_000);
    }

    #[test]
    fn test_exhaust_then_full_refill() {
        let mut bucket = TokenBucket::full(5, 0);
        for expected in (0..5).rev() {
            let d = bucket.check(5, 1_000, 0);
            assert!(d.allowed);
            assert_eq!(d.remaining, expected);
        }

        let d = bucket.check(5, 1_000, 0);
        assert!(!d.allowed);
        let retry = d.retry_after.unwrap();
        assert!((200..=201).contains(&retry));

        let d = bucket.check(5, 1_000, 1_000);
        assert!(d.allowed);
        assert_eq!(d.remaining, 4);
    }

    #[test]
    fn test_capacity_overflow_prevention() {
        let mut bucket = TokenBucket::full(5, 0);
        bucket.check(5, 1_000, 0);

        // A long idle period must not overfill the bucket
        let d = bucket.check(5, 1_000, 3_600_000);
        assert!(bucket.tokens() <= 5.0);
        assert_eq!(d.remaining, 4);
    }

    #[test]
    fn test_tokens_never_negative() {
        let mut bucket = TokenBucket::from_parts(-3.0, 0);
        assert_eq!(bucket.tokens(), 0.0);

        for now in 0..50 {
            bucket.check(3, 10_000, now);
            assert!(bucket.tokens() >= 0.0);
            assert!(bucket.tokens() <= 3.0);
        }
    }

    #[test]
    fn test_reset_time_is_time_to_refill() {
        let mut bucket = TokenBucket::full(10, 0);
        let d = bucket.check(10, 10_000, 0);
        // One token missing at one token per second
        assert!((1_000..=1_001).contains(&d.reset_time));
    }

    #[test]
    fn test_clock_going_backwards_does_not_drain() {
        let mut bucket = TokenBucket::from_parts(2.0, 5_000);
        bucket.check(10, 1_000, 4_000);
        assert_eq!(bucket.last_refill(), 5_000);
        assert_eq!(bucket.tokens(), 1.0);
    }
}
