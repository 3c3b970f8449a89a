//! Circuit breaker around store access.
//!
//! Counts consecutive store failures. At the threshold the circuit opens and
//! every check gets the safe-default result without touching the store. Once
//! the recovery timeout has elapsed a single probe request is let through;
//! its outcome closes or re-opens the circuit.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::error::{RateLimitError, Result};
use crate::metrics::Monitor;

/// What a check returns when the store cannot be consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Admit the request.
    FailOpen,
    /// Deny the request.
    FailClosed,
}

impl FromStr for FailurePolicy {
    type Err = RateLimitError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "fail-open" | "open" => Ok(FailurePolicy::FailOpen),
            "fail-closed" | "closed" => Ok(FailurePolicy::FailClosed),
            other => Err(RateLimitError::Configuration(format!(
                "unknown failure policy '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailOpen => f.write_str("fail-open"),
            FailurePolicy::FailClosed => f.write_str("fail-closed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u64,
    pub trips: u64,
    pub last_failure_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admit {
    Rejected,
    Pass,
    Probe,
}

/// Armed while a half-open probe runs inside [`CircuitBreaker::call`].
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.abandon_probe();
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    last_failure_ms: AtomicU64,
    probe_in_flight: AtomicBool,
    trips: AtomicU64,
    failure_threshold: u64,
    recovery_timeout_ms: u64,
    clock: SharedClock,
    monitor: Arc<dyn Monitor>,
}

impl CircuitBreaker {
    pub fn new(
        failure_threshold: u32,
        recovery_timeout_ms: u64,
        clock: SharedClock,
        monitor: Arc<dyn Monitor>,
    ) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU64::new(0),
            last_failure_ms: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
            trips: AtomicU64::new(0),
            failure_threshold: failure_threshold.max(1) as u64,
            recovery_timeout_ms,
            clock,
            monitor,
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    /// Whether the caller may go to the store.
    pub fn allow_request(&self) -> bool {
        self.admit() != Admit::Rejected
    }

    fn admit(&self) -> Admit {
        match self.state() {
            CircuitState::Closed => Admit::Pass,
            CircuitState::Open => {
                let elapsed = self
                    .clock
                    .now_ms()
                    .saturating_sub(self.last_failure_ms.load(Ordering::Acquire));
                if elapsed < self.recovery_timeout_ms {
                    return Admit::Rejected;
                }

                // Whoever moves the circuit to half-open owns the probe
                let transitioned = self
                    .state
                    .compare_exchange(
                        CircuitState::Open as u8,
                        CircuitState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if transitioned {
                    self.probe_in_flight.store(true, Ordering::Release);
                    info!("Circuit breaker half-open, probing store");
                    Admit::Probe
                } else {
                    Admit::Rejected
                }
            }
            CircuitState::HalfOpen => {
                let claimed = self
                    .probe_in_flight
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok();
                if claimed {
                    Admit::Probe
                } else {
                    Admit::Rejected
                }
            }
        }
    }

    /// The probe ended without an outcome: back to open, with the recovery
    /// timeout starting over.
    fn abandon_probe(&self) {
        self.last_failure_ms
            .store(self.clock.now_ms(), Ordering::Release);
        let reopened = self
            .state
            .compare_exchange(
                CircuitState::HalfOpen as u8,
                CircuitState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        self.probe_in_flight.store(false, Ordering::Release);
        if reopened {
            warn!("Circuit breaker probe abandoned, re-opening");
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Release);
        if self.state() == CircuitState::HalfOpen {
            self.state
                .store(CircuitState::Closed as u8, Ordering::Release);
            self.probe_in_flight.store(false, Ordering::Release);
            info!("Circuit breaker closed, store recovered");
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        self.last_failure_ms
            .store(self.clock.now_ms(), Ordering::Release);

        match self.state() {
            CircuitState::HalfOpen => {
                self.state.store(CircuitState::Open as u8, Ordering::Release);
                self.probe_in_flight.store(false, Ordering::Release);
                warn!("Circuit breaker probe failed, re-opening");
            }
            CircuitState::Closed if failures >= self.failure_threshold => {
                let opened = self
                    .state
                    .compare_exchange(
                        CircuitState::Closed as u8,
                        CircuitState::Open as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if opened {
                    self.trips.fetch_add(1, Ordering::Relaxed);
                    self.monitor.record_circuit_breaker_trip();
                    warn!(failures, "Circuit breaker opened");
                }
            }
            _ => {}
        }
    }

    /// Run `op` under the breaker. Store unavailability counts as a failure;
    /// any other outcome shows the store answered. A probe dropped before it
    /// finishes re-opens the circuit.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut probe = match self.admit() {
            Admit::Rejected => return Err(RateLimitError::CircuitOpen),
            Admit::Pass => None,
            Admit::Probe => Some(ProbeGuard {
                breaker: self,
                armed: true,
            }),
        };

        let outcome = op().await;
        if let Some(guard) = probe.as_mut() {
            guard.armed = false;
        }
        match &outcome {
            Err(RateLimitError::StoreUnavailable(_)) => self.record_failure(),
            _ => self.record_success(),
        }
        outcome
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Acquire)
    }

    pub fn trips(&self) -> u64 {
        self.trips.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let last = self.last_failure_ms.load(Ordering::Acquire);
        CircuitSnapshot {
            state: self.state(),
            consecutive_failures: self.consecutive_failures(),
            trips: self.trips(),
            last_failure_ms: (last > 0).then_some(last),
        }
    }

    pub fn reset(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Release);
        self.probe_in_flight.store(false, Ordering::Release);
    }
}
