use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::algorithms::Algorithm;
use crate::error::RateLimitError;
use crate::result::RateLimitResult;

/// Hook for an external monitoring system.
pub trait Monitor: Send + Sync + Debug {
    fn record_check(&self, result: &RateLimitResult, elapsed: Duration);

    fn record_circuit_breaker_trip(&self);

    fn record_store_error(&self, error: &RateLimitError);

    /// Extra health details the monitor wants reported alongside the engine's.
    fn health_status(&self) -> Option<Value> {
        None
    }
}

/// Monitor that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMonitor;

impl Monitor for NoopMonitor {
    fn record_check(&self, _result: &RateLimitResult, _elapsed: Duration) {}

    fn record_circuit_breaker_trip(&self) {}

    fn record_store_error(&self, _error: &RateLimitError) {}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub cache_entries: usize,
    pub cache_bytes: usize,
    pub inflight_checks: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
    pub average_response_time_ms: f64,
    pub cache_hit_rate: f64,
    pub algorithm_distribution: HashMap<Algorithm, u64>,
    pub store_errors: u64,
    pub safe_defaults: u64,
    pub circuit_breaker_trips: u64,
    pub memory_usage: MemoryUsage,
}

/// Counters kept by the engine itself.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    total: AtomicU64,
    allowed: AtomicU64,
    blocked: AtomicU64,
    cache_hits: AtomicU64,
    store_errors: AtomicU64,
    safe_defaults: AtomicU64,
    breaker_trips: AtomicU64,
    response_time_micros: AtomicU64,
    algorithms: Mutex<HashMap<Algorithm, u64>>,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_safe_default(&self) {
        self.safe_defaults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuit_breaker_trips(&self) -> u64 {
        self.breaker_trips.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, memory_usage: MemoryUsage) -> EngineStats {
        let total = self.total.load(Ordering::Relaxed);
        let ratio = |n: u64| if total == 0 { 0.0 } else { n as f64 / total as f64 };

        EngineStats {
            total_requests: total,
            allowed_requests: self.allowed.load(Ordering::Relaxed),
            blocked_requests: self.blocked.load(Ordering::Relaxed),
            average_response_time_ms: ratio(self.response_time_micros.load(Ordering::Relaxed))
                / 1_000.0,
            cache_hit_rate: ratio(self.cache_hits.load(Ordering::Relaxed)),
            algorithm_distribution: self
                .algorithms
                .lock()
                .map(|a| a.clone())
                .unwrap_or_default(),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            safe_defaults: self.safe_defaults.load(Ordering::Relaxed),
            circuit_breaker_trips: self.circuit_breaker_trips(),
            memory_usage,
        }
    }
}

impl Monitor for EngineMetrics {
    fn record_check(&self, result: &RateLimitResult, elapsed: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if result.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.blocked.fetch_add(1, Ordering::Relaxed);
        }
        if result.cached {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        self.response_time_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if let Ok(mut algorithms) = self.algorithms.lock() {
            *algorithms.entry(result.algorithm).or_default() += 1;
        }
    }

    fn record_circuit_breaker_trip(&self) {
        self.breaker_trips.fetch_add(1, Ordering::Relaxed);
    }

    fn record_store_error(&self, _error: &RateLimitError) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }
}
