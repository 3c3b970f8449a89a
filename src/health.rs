use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
use crate::clock::SharedClock;
use crate::distributed::{Coordinator, CoordinatorSnapshot};
use crate::metrics::EngineStats;
use crate::store::Store;

const PING_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    pub reachable: bool,
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub healthy: bool,
    pub status: HealthState,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub store: StoreStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub distributed: Option<CoordinatorSnapshot>,
    pub stats: EngineStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monitor: Option<Value>,
}

#[derive(Debug)]
pub struct HealthChecker {
    store: Arc<dyn Store>,
    breaker: Option<Arc<CircuitBreaker>>,
    coordinator: Option<Arc<Coordinator>>,
    clock: SharedClock,
    started: Instant,
}

impl HealthChecker {
    pub fn new(
        store: Arc<dyn Store>,
        breaker: Option<Arc<CircuitBreaker>>,
        coordinator: Option<Arc<Coordinator>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            breaker,
            coordinator,
            clock,
            started: Instant::now(),
        }
    }

    async fn check_store(&self) -> StoreStatus {
        match tokio::time::timeout(PING_TIMEOUT, self.store.ping()).await {
            Ok(Ok(latency)) => StoreStatus {
                reachable: true,
                latency_ms: Some(latency.as_secs_f64() * 1_000.0),
                error: None,
            },
            Ok(Err(e)) => {
                warn!(error = %e, "Store health check failed");
                StoreStatus {
                    reachable: false,
                    latency_ms: None,
                    error: Some(e.to_string()),
                }
            }
            Err(_) => StoreStatus {
                reachable: false,
                latency_ms: None,
                error: Some(format!("no reply within {:?}", PING_TIMEOUT)),
            },
        }
    }

    /// Unhealthy when the store cannot be reached, degraded while the
    /// circuit is not closed.
    pub async fn check(&self, stats: EngineStats, monitor: Option<Value>) -> HealthReport {
        let store = self.check_store().await;
        let circuit_breaker = self.breaker.as_ref().map(|b| b.snapshot());

        let status = if !store.reachable {
            HealthState::Unhealthy
        } else if circuit_breaker
            .as_ref()
            .is_some_and(|c| c.state != CircuitState::Closed)
        {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        HealthReport {
            healthy: status == HealthState::Healthy,
            status,
            timestamp: self.clock.now_ms(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: self.started.elapsed().as_secs(),
            store,
            circuit_breaker,
            distributed: self.coordinator.as_ref().map(|c| c.snapshot()),
            stats,
            monitor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::metrics::NoopMonitor;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_health_follows_store_and_circuit() {
        let clock = ManualClock::new(5_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let breaker = Arc::new(CircuitBreaker::new(
            1,
            1_000,
            Arc::new(clock.clone()),
            Arc::new(NoopMonitor),
        ));
        let checker = HealthChecker::new(
            store.clone(),
            Some(breaker.clone()),
            None,
            Arc::new(clock),
        );

        let report = checker.check(EngineStats::default(), None).await;
        assert!(report.healthy);
        assert_eq!(report.status, HealthState::Healthy);
        assert_eq!(report.timestamp, 5_000);

        breaker.record_failure();
        assert_eq!(checker.check(EngineStats::default(), None).await.status, HealthState::Degraded);

        store.set_available(false);
        let report = checker.check(EngineStats::default(), None).await;
        assert_eq!(report.status, HealthState::Unhealthy);
        assert!(report.store.error.is_some());
    }

    #[test]
    fn test_report_serialization() {
        let report = HealthReport {
            healthy: true,
            status: HealthState::Healthy,
            timestamp: 1234567890,
            version: "1.0.0".to_string(),
            uptime_seconds: 3600,
            store: StoreStatus {
                reachable: true,
                latency_ms: Some(0.4),
                error: None,
            },
            circuit_breaker: None,
            distributed: None,
            stats: EngineStats::default(),
            monitor: None,
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["uptimeSeconds"], 3600);
        assert!(json.get("circuitBreaker").is_none());
    }
}
