//! Batch admission.
//!
//! A batch is validated as a whole, ordered by priority, split into chunks
//! of at most `max_batch_size` items and each chunk goes to the store in a
//! single round trip: one multi-key procedure call for the sliding window,
//! one pipeline for the other algorithms. In distributed mode every chunk is
//! a pipeline of coordinated admissions against this instance's share.
//! Chunks run with bounded concurrency. A chunk that cannot reach the store
//! gets the failure policy's safe default; any other failed chunk or item
//! comes back as a denial with `total_hits == -1`. Results are returned in
//! request order.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::algorithms::{Algorithm, Decision};
use crate::cache::LocalCache;
use crate::circuit_breaker::{CircuitBreaker, FailurePolicy};
use crate::clock::SharedClock;
use crate::distributed::Coordinator;
use crate::error::{RateLimitError, Result};
use crate::executor::{Admission, AtomicExecutor, SharedAdmission};
use crate::key::RateLimitKey;
use crate::metrics::{EngineMetrics, Monitor};
use crate::result::{RateLimitResult, SafeDefaults};
use crate::scripts::ProcedureKind;
use crate::validation::RequestValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

/// Processing order: high, normal, unspecified, low.
fn rank(priority: Option<Priority>) -> u8 {
    match priority {
        Some(Priority::High) => 0,
        Some(Priority::Normal) => 1,
        None => 2,
        Some(Priority::Low) => 3,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub identifier: String,
    pub limit: u64,
    pub window_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
}

impl BatchRequest {
    pub fn new(identifier: &str, limit: u64, window_ms: u64) -> Self {
        Self {
            identifier: identifier.to_string(),
            limit,
            window_ms,
            priority: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItemResult {
    pub identifier: String,
    pub result: RateLimitResult,
    pub execution_time_ms: f64,
    pub cache_hit: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchStats {
    pub total: usize,
    pub allowed: usize,
    pub denied: usize,
    pub errors: usize,
    pub cache_hits: usize,
    pub chunks: usize,
    pub avg_execution_time_ms: f64,
    pub total_time_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResponse {
    pub results: Vec<BatchItemResult>,
    pub stats: BatchStats,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub enabled: bool,
    pub max_batch_size: usize,
    pub max_batch_requests: usize,
    pub concurrency: usize,
    pub key_prefix: String,
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone)]
struct Pending {
    index: usize,
    rank: u8,
    admission: Admission,
}

/// How a chunk reaches the store.
#[derive(Debug, Clone, Copy)]
enum Route<'a> {
    SlidingBatch,
    Pipelined(Algorithm),
    Coordinated(&'a Arc<Coordinator>),
}

impl Route<'_> {
    /// Procedure a pipelined route relies on.
    fn pipelined_kind(&self) -> Option<ProcedureKind> {
        match self {
            Route::SlidingBatch => None,
            Route::Pipelined(algorithm) => Some(ProcedureKind::Single(*algorithm)),
            Route::Coordinated(_) => Some(ProcedureKind::Coordinated),
        }
    }
}

#[derive(Debug)]
struct Outcome {
    index: usize,
    result: RateLimitResult,
    error: Option<String>,
    execution_time_ms: f64,
}

#[derive(Debug)]
pub struct BatchProcessor {
    settings: BatchSettings,
    executor: Arc<AtomicExecutor>,
    breaker: Option<Arc<CircuitBreaker>>,
    cache: Option<Arc<LocalCache>>,
    coordinator: Option<Arc<Coordinator>>,
    validator: RequestValidator,
    clock: SharedClock,
    metrics: Arc<EngineMetrics>,
    monitor: Arc<dyn Monitor>,
    safe_defaults: SafeDefaults,
}

impl BatchProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        settings: BatchSettings,
        executor: Arc<AtomicExecutor>,
        breaker: Option<Arc<CircuitBreaker>>,
        cache: Option<Arc<LocalCache>>,
        coordinator: Option<Arc<Coordinator>>,
        validator: RequestValidator,
        clock: SharedClock,
        metrics: Arc<EngineMetrics>,
        monitor: Arc<dyn Monitor>,
    ) -> Self {
        let safe_defaults =
            SafeDefaults::new(settings.failure_policy, metrics.clone(), monitor.clone());
        Self {
            settings,
            executor,
            breaker,
            cache,
            coordinator,
            validator,
            clock,
            metrics,
            monitor,
            safe_defaults,
        }
    }

    fn route(&self, algorithm: Algorithm) -> Route<'_> {
        match (&self.coordinator, algorithm) {
            (Some(coordinator), _) => Route::Coordinated(coordinator),
            (None, Algorithm::SlidingWindow) => Route::SlidingBatch,
            (None, algorithm) => Route::Pipelined(algorithm),
        }
    }

    fn validate(&self, requests: &[BatchRequest]) -> Result<()> {
        if !self.settings.enabled {
            return Err(RateLimitError::BatchDisabled);
        }
        if requests.is_empty() {
            return Err(RateLimitError::Validation(
                "batch must contain at least one request".to_string(),
            ));
        }
        if requests.len() > self.settings.max_batch_requests {
            return Err(RateLimitError::BatchSizeExceeded {
                size: requests.len(),
                max: self.settings.max_batch_requests,
            });
        }
        for (i, request) in requests.iter().enumerate() {
            self.validator
                .validate_check(&request.identifier, request.limit, request.window_ms)
                .map_err(|e| match e {
                    RateLimitError::Validation(msg) => {
                        RateLimitError::Validation(format!("request {}: {}", i, msg))
                    }
                    other => other,
                })?;
        }
        Ok(())
    }

    async fn guarded<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match &self.breaker {
            Some(breaker) => breaker.call(op).await,
            None => op().await,
        }
    }

    async fn run_chunk(
        &self,
        chunk: Vec<Pending>,
        algorithm: Algorithm,
        route: Route<'_>,
        now: u64,
    ) -> Vec<Outcome> {
        let started = Instant::now();
        let admissions: Vec<Admission> = chunk.iter().map(|p| p.admission.clone()).collect();

        let replies: Result<Vec<Result<Decision>>> = match route {
            Route::SlidingBatch => self
                .guarded(|| self.executor.check_sliding_batch(&admissions, now))
                .await
                .map(|decisions| decisions.into_iter().map(Ok).collect()),
            Route::Pipelined(_) => {
                self.guarded(|| self.executor.check_pipelined(&admissions, now))
                    .await
            }
            Route::Coordinated(coordinator) => {
                let shared: Vec<SharedAdmission> = admissions
                    .iter()
                    .map(|a| SharedAdmission {
                        global: a.clone(),
                        instance: a.key.for_instance(coordinator.instance_id()),
                        instance_limit: coordinator.instance_limit(a.limit),
                    })
                    .collect();
                self.guarded(|| self.executor.check_coordinated_pipelined(&shared, now))
                    .await
            }
        };

        let execution_time_ms = started.elapsed().as_secs_f64() * 1_000.0;
        let outcome = |pending: &Pending, result: RateLimitResult, error: Option<String>| Outcome {
            index: pending.index,
            result,
            error,
            execution_time_ms,
        };

        match replies {
            Ok(items) => chunk
                .iter()
                .zip(items)
                .map(|(pending, item)| {
                    let Admission { key, limit, window_ms } = &pending.admission;
                    match item {
                        Ok(decision) => {
                            let result = RateLimitResult::from_decision(decision, *limit, algorithm);
                            if let (false, Route::Coordinated(coordinator)) = (result.allowed, route) {
                                coordinator.publish_denied(&key.identifier, *limit, *window_ms, algorithm);
                            }
                            outcome(pending, result, None)
                        }
                        Err(e) => {
                            self.record_error(&e);
                            let failed = RateLimitResult::failed(algorithm, *limit, *window_ms, now);
                            outcome(pending, failed, Some(e.to_string()))
                        }
                    }
                })
                .collect(),
            Err(e) if e.is_absorbable() => {
                self.safe_defaults.record_failure(&e);
                warn!(
                    error = %e,
                    items = chunk.len(),
                    policy = %self.safe_defaults.policy(),
                    "Store unreachable, using safe default for batch chunk"
                );
                chunk
                    .iter()
                    .map(|pending| {
                        let Admission { limit, window_ms, .. } = pending.admission;
                        let result = self.safe_defaults.result(algorithm, limit, window_ms, now);
                        outcome(pending, result, None)
                    })
                    .collect()
            }
            Err(e) => {
                self.record_error(&e);
                chunk
                    .iter()
                    .map(|pending| {
                        let Admission { limit, window_ms, .. } = pending.admission;
                        let failed = RateLimitResult::failed(algorithm, limit, window_ms, now);
                        outcome(pending, failed, Some(e.to_string()))
                    })
                    .collect()
            }
        }
    }

    fn record_error(&self, err: &RateLimitError) {
        self.monitor.record_store_error(err);
        self.metrics.record_store_error(err);
    }

    pub async fn process(
        &self,
        requests: &[BatchRequest],
        algorithm: Algorithm,
    ) -> Result<BatchResponse> {
        self.validate(requests)?;

        let started = Instant::now();
        let now = self.clock.now_ms();
        let mut slots: Vec<Option<BatchItemResult>> = vec![None; requests.len()];
        let mut pending = Vec::with_capacity(requests.len());

        for (index, request) in requests.iter().enumerate() {
            if let Some(cache) = &self.cache {
                let cache_key =
                    LocalCache::key(&request.identifier, request.limit, request.window_ms, algorithm);
                if let Some(hit) = cache.get(&cache_key) {
                    slots[index] = Some(BatchItemResult {
                        identifier: request.identifier.clone(),
                        result: hit,
                        execution_time_ms: 0.0,
                        cache_hit: true,
                        error: None,
                    });
                    continue;
                }
            }

            pending.push(Pending {
                index,
                rank: rank(request.priority),
                admission: Admission {
                    key: RateLimitKey::new(
                        &self.settings.key_prefix,
                        algorithm,
                        request.window_ms,
                        &request.identifier,
                        now,
                    ),
                    limit: request.limit,
                    window_ms: request.window_ms,
                },
            });
        }

        let route = self.route(algorithm);
        if let (Some(kind), false) = (route.pipelined_kind(), pending.is_empty()) {
            if let Err(e) = self.guarded(|| self.executor.verify(kind)).await {
                debug!(error = %e, procedure = %kind.name(), "Could not verify procedure before batch");
            }
        }

        // Stable, so equal priorities keep request order
        pending.sort_by_key(|p| p.rank);
        let chunks: Vec<Vec<Pending>> = pending
            .chunks(self.settings.max_batch_size.max(1))
            .map(<[Pending]>::to_vec)
            .collect();
        let chunk_count = chunks.len();

        let outcomes: Vec<Vec<Outcome>> = stream::iter(chunks)
            .map(|chunk| self.run_chunk(chunk, algorithm, route, now))
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes.into_iter().flatten() {
            let request = &requests[outcome.index];
            if let (Some(cache), true) = (&self.cache, outcome.error.is_none()) {
                let cache_key =
                    LocalCache::key(&request.identifier, request.limit, request.window_ms, algorithm);
                cache.insert(&cache_key, &request.identifier, &outcome.result);
            }
            slots[outcome.index] = Some(BatchItemResult {
                identifier: request.identifier.clone(),
                result: outcome.result,
                execution_time_ms: outcome.execution_time_ms,
                cache_hit: false,
                error: outcome.error,
            });
        }

        let results: Vec<BatchItemResult> = slots
            .into_iter()
            .zip(requests)
            .map(|(slot, request)| {
                slot.unwrap_or_else(|| {
                    warn!(identifier = %request.identifier, "Batch item produced no outcome");
                    BatchItemResult {
                        identifier: request.identifier.clone(),
                        result: RateLimitResult::failed(
                            algorithm,
                            request.limit,
                            request.window_ms,
                            now,
                        ),
                        execution_time_ms: 0.0,
                        cache_hit: false,
                        error: Some("no outcome".to_string()),
                    }
                })
            })
            .collect();

        for item in &results {
            let elapsed = std::time::Duration::from_secs_f64(item.execution_time_ms / 1_000.0);
            self.metrics.record_check(&item.result, elapsed);
            self.monitor.record_check(&item.result, elapsed);
        }

        let stats = BatchStats {
            total: results.len(),
            allowed: results.iter().filter(|r| r.result.allowed).count(),
            denied: results.iter().filter(|r| !r.result.allowed).count(),
            errors: results.iter().filter(|r| r.error.is_some()).count(),
            cache_hits: results.iter().filter(|r| r.cache_hit).count(),
            chunks: chunk_count,
            avg_execution_time_ms: results.iter().map(|r| r.execution_time_ms).sum::<f64>()
                / results.len() as f64,
            total_time_ms: started.elapsed().as_secs_f64() * 1_000.0,
        };
        debug!(
            total = stats.total,
            allowed = stats.allowed,
            errors = stats.errors,
            chunks = stats.chunks,
            "Batch processed"
        );

        Ok(BatchResponse { results, stats })
    }
}
