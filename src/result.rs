use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::algorithms::{Algorithm, Decision};
use crate::circuit_breaker::FailurePolicy;
use crate::error::RateLimitError;
use crate::metrics::{EngineMetrics, Monitor};

/// Outcome of one admission check as returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// `-1` marks an item whose store call failed inside a batch.
    pub total_hits: i64,
    pub reset_time: u64,
    pub window_start: u64,
    pub window_end: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    pub algorithm: Algorithm,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub response_time_ms: f64,
}

impl RateLimitResult {
    pub fn from_decision(decision: Decision, limit: u64, algorithm: Algorithm) -> Self {
        Self {
            allowed: decision.allowed,
            limit,
            remaining: decision.remaining.min(limit),
            total_hits: decision.total_hits,
            reset_time: decision.reset_time,
            window_start: decision.window_start,
            window_end: decision.window_end,
            retry_after: if decision.allowed {
                None
            } else {
                decision.retry_after.or(Some(1))
            },
            algorithm,
            cached: false,
            response_time_ms: 0.0,
        }
    }

    /// Result used when the store cannot be consulted.
    pub fn safe_default(
        policy: FailurePolicy,
        algorithm: Algorithm,
        limit: u64,
        window_ms: u64,
        now: u64,
    ) -> Self {
        let allowed = policy == FailurePolicy::FailOpen;
        Self {
            allowed,
            limit,
            remaining: if allowed { limit } else { 0 },
            total_hits: if allowed { 0 } else { limit as i64 },
            reset_time: now + window_ms,
            window_start: now,
            window_end: now + window_ms,
            retry_after: if allowed { None } else { Some(window_ms) },
            algorithm,
            cached: false,
            response_time_ms: 0.0,
        }
    }

    /// Denial for a batch item whose store call failed.
    pub fn failed(algorithm: Algorithm, limit: u64, window_ms: u64, now: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            total_hits: -1,
            reset_time: now + window_ms,
            window_start: now,
            window_end: now + window_ms,
            retry_after: Some(window_ms),
            algorithm,
            cached: false,
            response_time_ms: 0.0,
        }
    }

    pub fn with_response_time(mut self, elapsed: Duration) -> Self {
        self.response_time_ms = elapsed.as_secs_f64() * 1_000.0;
        self
    }

    pub fn as_cached(mut self) -> Self {
        self.cached = true;
        self
    }

    /// Share of the limit already consumed.
    pub fn utilization(&self) -> f64 {
        if self.limit == 0 {
            return 1.0;
        }
        self.total_hits.max(0) as f64 / self.limit as f64
    }

    /// Seconds until retry, rounded up, for the `Retry-After` header.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|ms| ms.div_ceil(1_000).max(1))
    }
}

/// Stands in for the store when it cannot be consulted: counts the failure
/// and hands out the policy's result.
#[derive(Debug, Clone)]
pub struct SafeDefaults {
    policy: FailurePolicy,
    metrics: Arc<EngineMetrics>,
    monitor: Arc<dyn Monitor>,
}

impl SafeDefaults {
    pub fn new(policy: FailurePolicy, metrics: Arc<EngineMetrics>, monitor: Arc<dyn Monitor>) -> Self {
        Self {
            policy,
            metrics,
            monitor,
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Count one failed store call. An open circuit is not a store error.
    pub fn record_failure(&self, err: &RateLimitError) {
        if let RateLimitError::StoreUnavailable(_) = err {
            self.metrics.record_store_error(err);
            self.monitor.record_store_error(err);
        }
    }

    pub fn result(&self, algorithm: Algorithm, limit: u64, window_ms: u64, now: u64) -> RateLimitResult {
        self.metrics.record_safe_default();
        RateLimitResult::safe_default(self.policy, algorithm, limit, window_ms, now)
    }
}
