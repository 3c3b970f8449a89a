//! The rate limiting engine.
//!
//! One engine type composes the optional pieces a deployment turns on: the
//! circuit breaker, the local cache with single-flight, and distributed
//! coordination. A check flows cache -> single-flight -> breaker -> atomic
//! procedure, and store trouble on the way comes back as a safe-default
//! result instead of an error.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::algorithms::Algorithm;
use crate::batch::{BatchProcessor, BatchRequest, BatchResponse, BatchSettings};
use crate::cache::LocalCache;
use crate::circuit_breaker::{CircuitBreaker, FailurePolicy};
use crate::clock::{SharedClock, SystemClock};
use crate::config::EngineConfig;
use crate::distributed::{Coordinator, EventBus, EventType};
use crate::error::{RateLimitError, Result};
use crate::executor::{Admission, AtomicExecutor, SharedAdmission};
use crate::health::{HealthChecker, HealthReport};
use crate::key::RateLimitKey;
use crate::metrics::{EngineMetrics, EngineStats, MemoryUsage, Monitor, NoopMonitor};
use crate::result::{RateLimitResult, SafeDefaults};
use crate::scripts::ScriptRegistry;
use crate::single_flight::{Flight, SingleFlight};
use crate::store::{RedisStore, Store};
use crate::validation::RequestValidator;

/// Assembles a [`RateLimitEngine`]. Anything not supplied is derived from
/// the configuration: a Redis store at `store_url`, the system clock, the
/// Redis pub/sub bus and no external monitor.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn Store>>,
    clock: Option<SharedClock>,
    event_bus: Option<Arc<dyn EventBus>>,
    monitor: Option<Arc<dyn Monitor>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            clock: None,
            event_bus: None,
            monitor: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn event_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub async fn build(self) -> Result<RateLimitEngine> {
        let config = self.config;
        config.validate()?;

        let clock: SharedClock = match self.clock {
            Some(clock) => clock,
            None => Arc::new(SystemClock::new()),
        };
        let monitor: Arc<dyn Monitor> = match self.monitor {
            Some(monitor) => monitor,
            None => Arc::new(NoopMonitor),
        };

        let (store, event_bus): (Arc<dyn Store>, Option<Arc<dyn EventBus>>) = match self.store {
            Some(store) => (store, self.event_bus),
            None => {
                let redis = RedisStore::connect(&config.store_url).await?;
                let bus: Arc<dyn EventBus> = match self.event_bus {
                    Some(bus) => bus,
                    None => Arc::new(redis.event_bus()),
                };
                (Arc::new(redis), Some(bus))
            }
        };

        let metrics = Arc::new(EngineMetrics::new());
        // The breaker reports trips to both the engine's counters and the
        // external monitor.
        let trip_monitor: Arc<dyn Monitor> = Arc::new(TripFanout {
            metrics: metrics.clone(),
            monitor: monitor.clone(),
        });
        let breaker = config.circuit_breaker.enabled.then(|| {
            Arc::new(CircuitBreaker::new(
                config.circuit_breaker.failure_threshold,
                config.circuit_breaker.recovery_timeout_ms,
                clock.clone(),
                trip_monitor,
            ))
        });

        let cache = config.local_cache.enabled.then(|| {
            Arc::new(LocalCache::new(
                config.local_cache.max_entries,
                config.local_cache.ttl_ms,
                clock.clone(),
            ))
        });
        let single_flight = config.local_cache.enabled.then(|| {
            SingleFlight::new(Duration::from_millis(
                config.local_cache.single_flight_timeout_ms,
            ))
        });

        let coordinator = if config.distributed.enabled {
            let bus = event_bus.ok_or_else(|| {
                RateLimitError::Configuration(
                    "distributed mode needs an event bus when a custom store is supplied"
                        .to_string(),
                )
            })?;
            Some(Arc::new(Coordinator::new(
                config.distributed.clone(),
                bus,
                clock.clone(),
                cache.clone(),
            )))
        } else {
            None
        };

        let executor = Arc::new(AtomicExecutor::new(
            store.clone(),
            Arc::new(ScriptRegistry::new()),
            config.ttl_buffer_ms,
        ));
        if let Err(e) = executor.initialize().await {
            warn!(error = %e, "Could not register procedures, retrying on first check");
        }

        let validator = RequestValidator::new(config.max_window_ms);
        let batch = BatchProcessor::new(
            BatchSettings {
                enabled: config.batch_enabled,
                max_batch_size: config.max_batch_size,
                max_batch_requests: config.max_batch_requests,
                concurrency: config.batch_concurrency,
                key_prefix: config.key_prefix.clone(),
                failure_policy: config.circuit_breaker.failure_policy,
            },
            executor.clone(),
            breaker.clone(),
            cache.clone(),
            coordinator.clone(),
            validator.clone(),
            clock.clone(),
            metrics.clone(),
            monitor.clone(),
        );
        let health = HealthChecker::new(
            store,
            breaker.clone(),
            coordinator.clone(),
            clock.clone(),
        );

        let safe_defaults = SafeDefaults::new(
            config.circuit_breaker.failure_policy,
            metrics.clone(),
            monitor.clone(),
        );

        let (shutdown_tx, _) = watch::channel(false);
        let engine = RateLimitEngine {
            config,
            clock,
            executor,
            breaker,
            cache,
            single_flight,
            coordinator,
            batch,
            health,
            validator,
            metrics,
            monitor,
            safe_defaults,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        };
        engine.start_background_tasks().await;

        info!(
            algorithm = %engine.config.algorithm,
            prefix = %engine.config.key_prefix,
            distributed = engine.coordinator.is_some(),
            local_cache = engine.cache.is_some(),
            circuit_breaker = engine.breaker.is_some(),
            "Rate limit engine started"
        );
        Ok(engine)
    }
}

/// Forwards breaker trips to the engine counters and the external monitor.
#[derive(Debug)]
struct TripFanout {
    metrics: Arc<EngineMetrics>,
    monitor: Arc<dyn Monitor>,
}

impl Monitor for TripFanout {
    fn record_check(&self, _result: &RateLimitResult, _elapsed: Duration) {}

    fn record_circuit_breaker_trip(&self) {
        self.metrics.record_circuit_breaker_trip();
        self.monitor.record_circuit_breaker_trip();
    }

    fn record_store_error(&self, _error: &RateLimitError) {}
}

#[derive(Debug)]
pub struct RateLimitEngine {
    config: EngineConfig,
    clock: SharedClock,
    executor: Arc<AtomicExecutor>,
    breaker: Option<Arc<CircuitBreaker>>,
    cache: Option<Arc<LocalCache>>,
    single_flight: Option<SingleFlight>,
    coordinator: Option<Arc<Coordinator>>,
    batch: BatchProcessor,
    health: HealthChecker,
    validator: RequestValidator,
    metrics: Arc<EngineMetrics>,
    monitor: Arc<dyn Monitor>,
    safe_defaults: SafeDefaults,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RateLimitEngine {
    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn coordinator(&self) -> Option<&Arc<Coordinator>> {
        self.coordinator.as_ref()
    }

    async fn start_background_tasks(&self) {
        let mut handles = Vec::new();

        if let Some(cache) = &self.cache {
            let cache = Arc::clone(cache);
            let mut shutdown = self.shutdown_tx.subscribe();
            let period = Duration::from_millis(self.config.local_cache.sweep_interval_ms);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            let removed = cache.sweep();
                            if removed > 0 {
                                trace!(removed, "Swept expired cache entries");
                            }
                        }
                    }
                }
                debug!("Cache sweeper stopped");
            }));
        }

        if let Some(coordinator) = &self.coordinator {
            match Arc::clone(coordinator)
                .start(self.shutdown_tx.subscribe())
                .await
            {
                Ok(handle) => handles.push(handle),
                Err(e) => warn!(
                    error = %e,
                    "Could not subscribe to coordination channels, running uncoordinated"
                ),
            }
        }

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
    }

    /// Check and count one request for `identifier`.
    ///
    /// Fails only on invalid input or a malformed store reply. Store
    /// outages and an open circuit yield the configured safe default.
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        limit: u64,
        window_ms: u64,
        algorithm: Option<Algorithm>,
    ) -> Result<RateLimitResult> {
        let started = Instant::now();
        let algorithm = algorithm.unwrap_or(self.config.algorithm);
        self.validator.validate_check(identifier, limit, window_ms)?;

        let cache_key = LocalCache::key(identifier, limit, window_ms, algorithm);
        if let Some(cache) = &self.cache {
            if let Some(hit) = cache.get(&cache_key) {
                trace!(identifier = %identifier, "Local cache hit");
                return Ok(self.finish(hit, started));
            }
        }

        let result = match &self.single_flight {
            Some(flights) => match flights.join(&cache_key) {
                Flight::Leader(guard) => {
                    let result = self.evaluate(identifier, limit, window_ms, algorithm).await?;
                    // Cache before the flight ends
                    self.remember(&cache_key, identifier, &result);
                    guard.complete(&result);
                    return Ok(self.finish(result, started));
                }
                Flight::Follower(receiver) => match flights.wait(receiver).await {
                    Some(shared) => shared,
                    None => self.evaluate(identifier, limit, window_ms, algorithm).await?,
                },
            },
            None => self.evaluate(identifier, limit, window_ms, algorithm).await?,
        };

        self.remember(&cache_key, identifier, &result);
        Ok(self.finish(result, started))
    }

    fn remember(&self, cache_key: &str, identifier: &str, result: &RateLimitResult) {
        if let Some(cache) = &self.cache {
            cache.insert(cache_key, identifier, result);
        }
    }

    fn finish(&self, result: RateLimitResult, started: Instant) -> RateLimitResult {
        let elapsed = started.elapsed();
        let result = result.with_response_time(elapsed);
        self.metrics.record_check(&result, elapsed);
        self.monitor.record_check(&result, elapsed);
        result
    }

    async fn evaluate(
        &self,
        identifier: &str,
        limit: u64,
        window_ms: u64,
        algorithm: Algorithm,
    ) -> Result<RateLimitResult> {
        let now = self.clock.now_ms();
        let admission = Admission {
            key: RateLimitKey::new(&self.config.key_prefix, algorithm, window_ms, identifier, now),
            limit,
            window_ms,
        };

        let attempt = || async {
            match &self.coordinator {
                Some(coordinator) => {
                    let shared = SharedAdmission {
                        global: admission.clone(),
                        instance: admission.key.for_instance(coordinator.instance_id()),
                        instance_limit: coordinator.instance_limit(limit),
                    };
                    self.executor.check_coordinated(&shared, now).await
                }
                None => self.executor.check(&admission, now).await,
            }
        };
        let outcome = match &self.breaker {
            Some(breaker) => breaker.call(attempt).await,
            None => attempt().await,
        };

        match outcome {
            Ok(decision) => {
                let result = RateLimitResult::from_decision(decision, limit, algorithm);
                if !result.allowed {
                    debug!(
                        identifier = %identifier,
                        algorithm = %algorithm,
                        total_hits = result.total_hits,
                        "Request denied"
                    );
                    if let Some(coordinator) = &self.coordinator {
                        coordinator.publish_denied(identifier, limit, window_ms, algorithm);
                    }
                }
                Ok(result)
            }
            Err(e) if e.is_absorbable() => Ok(self.absorb(&e, algorithm, limit, window_ms, now)),
            Err(e) => {
                error!(identifier = %identifier, error = %e, "Rate limit check failed");
                self.monitor.record_store_error(&e);
                Err(e)
            }
        }
    }

    fn absorb(
        &self,
        err: &RateLimitError,
        algorithm: Algorithm,
        limit: u64,
        window_ms: u64,
        now: u64,
    ) -> RateLimitResult {
        self.safe_defaults.record_failure(err);
        warn!(
            error = %err,
            policy = %self.safe_defaults.policy(),
            "Store unreachable, using safe default"
        );
        self.safe_defaults.result(algorithm, limit, window_ms, now)
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.safe_defaults.policy()
    }

    /// Check many requests at once, all with the same algorithm.
    pub async fn check_multiple(
        &self,
        requests: &[BatchRequest],
        algorithm: Option<Algorithm>,
    ) -> Result<BatchResponse> {
        let algorithm = algorithm.unwrap_or(self.config.algorithm);
        self.batch.process(requests, algorithm).await
    }

    /// Forget all state for `identifier`, for one algorithm or all of them.
    /// Returns the number of store keys removed. An open circuit is reported
    /// as the store being unavailable.
    pub async fn reset(&self, identifier: &str, algorithm: Option<Algorithm>) -> Result<u64> {
        RequestValidator::validate_identifier(identifier)?;

        let pattern = RateLimitKey::scan_pattern(&self.config.key_prefix, identifier);
        let cleanup = || async {
            let keys: Vec<String> = self
                .executor
                .scan(&pattern)
                .await?
                .into_iter()
                .filter(|raw| {
                    RateLimitKey::parse(&self.config.key_prefix, raw).is_some_and(|key| {
                        key.identifier == identifier
                            && algorithm.map_or(true, |a| a == key.algorithm)
                    })
                })
                .collect();
            if keys.is_empty() {
                return Ok(0);
            }
            self.executor.delete(&keys).await
        };
        let deleted = match &self.breaker {
            Some(breaker) => breaker.call(cleanup).await.map_err(|e| match e {
                RateLimitError::CircuitOpen => {
                    RateLimitError::StoreUnavailable("circuit breaker is open".to_string())
                }
                other => other,
            })?,
            None => cleanup().await?,
        };

        if let Some(cache) = &self.cache {
            cache.invalidate_identifier(identifier);
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator
                .publish(
                    EventType::Reset,
                    json!({ "identifier": identifier, "algorithm": algorithm }),
                )
                .await;
        }

        info!(identifier = %identifier, algorithm = ?algorithm, deleted, "Rate limit reset");
        Ok(deleted)
    }

    pub fn get_stats(&self) -> EngineStats {
        self.metrics.snapshot(MemoryUsage {
            cache_entries: self.cache.as_ref().map_or(0, |c| c.len()),
            cache_bytes: self.cache.as_ref().map_or(0, |c| c.approximate_bytes()),
            inflight_checks: self.single_flight.as_ref().map_or(0, |f| f.in_flight()),
        })
    }

    pub async fn get_health(&self) -> HealthReport {
        self.health
            .check(self.get_stats(), self.monitor.health_status())
            .await
    }

    /// Flush pending event publishes, then stop background tasks and wait
    /// for them to finish.
    pub async fn shutdown(&self) {
        if let Some(coordinator) = &self.coordinator {
            coordinator.drain().await;
        }
        // Receivers may all be gone already
        let _ = self.shutdown_tx.send(true);

        let handles = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Rate limit engine stopped");
    }
}

impl Drop for RateLimitEngine {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::clock::ManualClock;
    use crate::distributed::MemoryEventBus;
    use crate::scripts::Procedure;
    use crate::store::{MemoryStore, ProcedureCall, StoreOp, StoreReply, StoreResult};

    /// Yields before each procedure call so concurrent checks overlap.
    #[derive(Debug)]
    struct YieldingStore(Arc<MemoryStore>);

    #[async_trait]
    impl Store for YieldingStore {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            self.0.get(key).await
        }

        async fn set(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> StoreResult<()> {
            self.0.set(key, value, ttl_ms).await
        }

        async fn increment(&self, key: &str, by: i64) -> StoreResult<i64> {
            self.0.increment(key, by).await
        }

        async fn z_add(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
            self.0.z_add(key, score, member).await
        }

        async fn z_range_by_score(
            &self,
            key: &str,
            min: f64,
            max: f64,
        ) -> StoreResult<Vec<(String, f64)>> {
            self.0.z_range_by_score(key, min, max).await
        }

        async fn z_rem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
            self.0.z_rem_range_by_score(key, min, max).await
        }

        async fn expire(&self, key: &str, ttl_ms: u64) -> StoreResult<bool> {
            self.0.expire(key, ttl_ms).await
        }

        async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
            self.0.delete(keys).await
        }

        async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
            self.0.scan(pattern).await
        }

        async fn load_procedure(&self, procedure: &Procedure) -> StoreResult<String> {
            self.0.load_procedure(procedure).await
        }

        async fn procedures_exist(&self, handles: &[String]) -> StoreResult<Vec<bool>> {
            self.0.procedures_exist(handles).await
        }

        async fn execute(&self, call: &ProcedureCall) -> StoreResult<Vec<i64>> {
            tokio::task::yield_now().await;
            self.0.execute(call).await
        }

        async fn pipeline(&self, ops: &[StoreOp]) -> StoreResult<Vec<StoreResult<StoreReply>>> {
            tokio::task::yield_now().await;
            self.0.pipeline(ops).await
        }

        async fn ping(&self) -> StoreResult<Duration> {
            self.0.ping().await
        }
    }

    async fn engine(config: EngineConfig) -> (RateLimitEngine, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let engine = RateLimitEngine::builder(config)
            .store(store.clone())
            .clock(Arc::new(clock.clone()))
            .build()
            .await
            .unwrap();
        (engine, store, clock)
    }

    #[tokio::test]
    async fn test_validation_error_is_surfaced() {
        let (engine, store, _) = engine(EngineConfig::default()).await;
        let before = store.round_trips();
        let err = engine
            .check_rate_limit("bad id", 10, 1_000, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::Validation(_)));
        assert!(matches!(
            engine.check_rate_limit("ok", 0, 1_000, None).await,
            Err(RateLimitError::Validation(_))
        ));
        assert_eq!(store.round_trips(), before);
    }

    #[tokio::test]
    async fn test_fail_closed_policy() {
        let mut config = EngineConfig::default();
        config.circuit_breaker.failure_policy = FailurePolicy::FailClosed;
        let (engine, store, _) = engine(config).await;
        store.set_available(false);

        let result = engine
            .check_rate_limit("u", 10, 1_000, Some(Algorithm::FixedWindow))
            .await
            .unwrap();
        assert!(!result.allowed);
        assert_eq!(engine.get_stats().safe_defaults, 1);
        assert_eq!(engine.get_stats().store_errors, 1);
    }

    #[tokio::test]
    async fn test_distributed_requires_bus_with_custom_store() {
        let mut config = EngineConfig::default();
        config.distributed.enabled = true;
        let clock = ManualClock::new(0);
        let result = RateLimitEngine::builder(config)
            .store(Arc::new(MemoryStore::new(Arc::new(clock))))
            .build()
            .await;
        assert!(matches!(result, Err(RateLimitError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_reset_respects_algorithm_filter() {
        let (engine, store, _) = engine(EngineConfig::default()).await;
        engine
            .check_rate_limit("u", 5, 1_000, Some(Algorithm::TokenBucket))
            .await
            .unwrap();
        engine
            .check_rate_limit("u", 5, 1_000, Some(Algorithm::FixedWindow))
            .await
            .unwrap();
        engine
            .check_rate_limit("u2", 5, 1_000, Some(Algorithm::FixedWindow))
            .await
            .unwrap();
        assert_eq!(store.key_count(), 3);

        assert_eq!(engine.reset("u", Some(Algorithm::TokenBucket)).await.unwrap(), 1);
        assert_eq!(engine.reset("u", None).await.unwrap(), 1);
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test]
    async fn test_stats_track_checks() {
        let (engine, _, _) = engine(EngineConfig::default()).await;
        for _ in 0..3 {
            engine
                .check_rate_limit("u", 2, 1_000, Some(Algorithm::LeakyBucket))
                .await
                .unwrap();
        }
        let stats = engine.get_stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.allowed_requests, 2);
        assert_eq!(stats.blocked_requests, 1);
        assert_eq!(stats.algorithm_distribution[&Algorithm::LeakyBucket], 3);
    }

    #[tokio::test]
    async fn test_concurrent_checks_share_one_store_call() {
        let mut config = EngineConfig::default();
        config.local_cache.enabled = true;
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let engine = RateLimitEngine::builder(config)
            .store(Arc::new(YieldingStore(store.clone())))
            .clock(Arc::new(clock))
            .build()
            .await
            .unwrap();

        let before = store.round_trips();
        let checks = (0..8).map(|_| engine.check_rate_limit("hot", 100, 60_000, None));
        let results = futures::future::join_all(checks).await;

        assert_eq!(store.round_trips() - before, 1);
        for result in results {
            let result = result.unwrap();
            assert!(result.allowed);
            assert_eq!(result.total_hits, 1);
        }
        assert_eq!(engine.get_stats().memory_usage.inflight_checks, 0);
    }

    #[tokio::test]
    async fn test_reset_reports_open_circuit_as_unavailable() {
        let mut config = EngineConfig::default();
        config.circuit_breaker.failure_threshold = 1;
        let (engine, store, _) = engine(config).await;
        store.set_available(false);

        let absorbed = engine
            .check_rate_limit("u", 5, 1_000, Some(Algorithm::FixedWindow))
            .await
            .unwrap();
        assert!(absorbed.allowed);

        store.set_available(true);
        assert!(matches!(
            engine.reset("u", None).await,
            Err(RateLimitError::StoreUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_denial_events() {
        let mut config = EngineConfig::default();
        config.distributed.enabled = true;
        config.distributed.instance_id = Some("node-a".to_string());
        let clock = ManualClock::new(1_700_000_000_000);
        let bus = MemoryEventBus::new();
        let engine = RateLimitEngine::builder(config)
            .store(Arc::new(MemoryStore::new(Arc::new(clock.clone()))))
            .event_bus(Arc::new(bus.clone()))
            .clock(Arc::new(clock))
            .build()
            .await
            .unwrap();
        // Let the first heartbeat go out
        tokio::task::yield_now().await;
        let before = bus.published();

        for _ in 0..3 {
            engine
                .check_rate_limit("u", 1, 60_000, Some(Algorithm::FixedWindow))
                .await
                .unwrap();
        }
        engine.shutdown().await;
        assert_eq!(bus.published() - before, 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_background_tasks() {
        let mut config = EngineConfig::default();
        config.local_cache.enabled = true;
        let (engine, _, _) = engine(config).await;
        assert_eq!(engine.tasks.lock().unwrap().len(), 1);
        engine.shutdown().await;
        assert!(engine.tasks.lock().unwrap().is_empty());
    }
}
