//! Rate limiting algorithms.
//!
//! Each algorithm is pure decision logic over a small piece of window state.
//! The same rules are implemented twice: here in Rust (used by the in-process
//! store and by tests) and in the Lua procedures under `src/lua/`, which the
//! Redis store runs atomically. Both produce a [`Decision`].

pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_window;
pub mod token_bucket;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RateLimitError;

pub use fixed_window::FixedWindow;
pub use leaky_bucket::LeakyBucket;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

/// The admission algorithms the engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    SlidingWindow,
    TokenBucket,
    LeakyBucket,
    FixedWindow,
}

impl Algorithm {
    pub const ALL: [Algorithm; 4] = [
        Algorithm::SlidingWindow,
        Algorithm::TokenBucket,
        Algorithm::LeakyBucket,
        Algorithm::FixedWindow,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
            Algorithm::FixedWindow => "fixed_window",
        }
    }

    /// How long the store should keep this algorithm's state after a write.
    pub fn state_ttl_ms(&self, window_ms: u64, now: u64, buffer_ms: u64) -> u64 {
        match self {
            Algorithm::FixedWindow => {
                let (_, end) = fixed_window::window_bounds(now, window_ms);
                end.saturating_sub(now) + buffer_ms
            }
            _ => window_ms + buffer_ms,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "sliding_window" => Ok(Algorithm::SlidingWindow),
            "token_bucket" => Ok(Algorithm::TokenBucket),
            "leaky_bucket" => Ok(Algorithm::LeakyBucket),
            "fixed_window" => Ok(Algorithm::FixedWindow),
            other => Err(RateLimitError::Validation(format!(
                "unknown algorithm '{}'",
                other
            ))),
        }
    }
}

/// Number of integers in a procedure reply.
pub const REPLY_LEN: usize = 7;

/// Outcome of one algorithm step.
///
/// Wire layout shared with the Lua procedures:
/// `[allowed, total_hits, remaining, reset_time, window_start, window_end, retry_after | -1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub total_hits: i64,
    pub remaining: u64,
    pub reset_time: u64,
    pub window_start: u64,
    pub window_end: u64,
    pub retry_after: Option<u64>,
}

impl Decision {
    /// A limit of zero admits nothing.
    pub(crate) fn zero_limit(window_ms: u64, now: u64) -> Self {
        Self {
            allowed: false,
            total_hits: 0,
            remaining: 0,
            reset_time: now + window_ms,
            window_start: now,
            window_end: now + window_ms,
            retry_after: Some(window_ms.max(1)),
        }
    }

    pub fn to_reply(&self) -> Vec<i64> {
        vec![
            self.allowed as i64,
            self.total_hits,
            self.remaining as i64,
            self.reset_time as i64,
            self.window_start as i64,
            self.window_end as i64,
            self.retry_after.map(|r| r as i64).unwrap_or(-1),
        ]
    }

    /// Decode a procedure reply, rejecting anything that does not have the
    /// exact shape the procedures produce.
    pub fn from_reply(reply: &[i64]) -> Result<Self, RateLimitError> {
        if reply.len() != REPLY_LEN {
            return Err(RateLimitError::Security(format!(
                "procedure reply has {} fields, expected {}",
                reply.len(),
                REPLY_LEN
            )));
        }

        let allowed = match reply[0] {
            0 => false,
            1 => true,
            other => {
                return Err(RateLimitError::Security(format!(
                    "procedure reply has invalid allowed flag {}",
                    other
                )))
            }
        };

        if reply[1..6].iter().any(|v| *v < 0) || reply[6] < -1 {
            return Err(RateLimitError::Security(
                "procedure reply contains negative fields".to_string(),
            ));
        }

        Ok(Self {
            allowed,
            total_hits: reply[1],
            remaining: reply[2] as u64,
            reset_time: reply[3] as u64,
            window_start: reply[4] as u64,
            window_end: reply[5] as u64,
            retry_after: if allowed || reply[6] < 0 {
                None
            } else {
                Some(reply[6] as u64)
            },
        })
    }
}

/// Window state for any algorithm, as held by the in-process store.
#[derive(Debug, Clone, PartialEq)]
pub enum AlgorithmState {
    SlidingWindow(SlidingWindow),
    TokenBucket(TokenBucket),
    LeakyBucket(LeakyBucket),
    FixedWindow(FixedWindow),
}

impl AlgorithmState {
    /// State for a key that has never been seen.
    pub fn fresh(algorithm: Algorithm, limit: u64, now: u64) -> Self {
        match algorithm {
            Algorithm::SlidingWindow => AlgorithmState::SlidingWindow(SlidingWindow::new()),
            Algorithm::TokenBucket => AlgorithmState::TokenBucket(TokenBucket::full(limit, now)),
            Algorithm::LeakyBucket => AlgorithmState::LeakyBucket(LeakyBucket::empty(now)),
            Algorithm::FixedWindow => AlgorithmState::FixedWindow(FixedWindow::new()),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            AlgorithmState::SlidingWindow(_) => Algorithm::SlidingWindow,
            AlgorithmState::TokenBucket(_) => Algorithm::TokenBucket,
            AlgorithmState::LeakyBucket(_) => Algorithm::LeakyBucket,
            AlgorithmState::FixedWindow(_) => Algorithm::FixedWindow,
        }
    }

    /// Run one admission step. `member` is only used by the sliding window,
    /// where it becomes the sorted-set member for an accepted request.
    pub fn evaluate(&mut self, limit: u64, window_ms: u64, now: u64, member: &str) -> Decision {
        match self {
            AlgorithmState::SlidingWindow(state) => state.check(limit, window_ms, now, member),
            AlgorithmState::TokenBucket(state) => state.check(limit, window_ms, now),
            AlgorithmState::LeakyBucket(state) => state.check(limit, window_ms, now),
            AlgorithmState::FixedWindow(state) => state.check(limit, window_ms, now),
        }
    }
}
