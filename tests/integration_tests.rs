use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use ratewarden::distributed::MemoryEventBus;
use ratewarden::store::MemoryStore;
use ratewarden::{
    create_app, Algorithm, BatchRequest, CircuitState, EngineConfig, ManualClock, RateLimitEngine,
};
use tower::ServiceExt;

const START: u64 = 1_700_000_000_000;

async fn engine_with(
    config: EngineConfig,
    store: Arc<MemoryStore>,
    clock: &ManualClock,
) -> RateLimitEngine {
    RateLimitEngine::builder(config)
        .store(store)
        .clock(Arc::new(clock.clone()))
        .build()
        .await
        .unwrap()
}

async fn engine(config: EngineConfig) -> (RateLimitEngine, Arc<MemoryStore>, ManualClock) {
    let clock = ManualClock::new(START);
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    let engine = engine_with(config, store.clone(), &clock).await;
    (engine, store, clock)
}

#[tokio::test]
async fn test_sliding_window_allows_limit_then_denies() {
    let (engine, _, _) = engine(EngineConfig::default()).await;

    for expected_remaining in (0..10).rev() {
        let result = engine
            .check_rate_limit("user:1", 10, 60_000, Some(Algorithm::SlidingWindow))
            .await
            .unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, expected_remaining);
        assert_eq!(result.remaining as i64, 10 - result.total_hits);
    }

    let denied = engine
        .check_rate_limit("user:1", 10, 60_000, Some(Algorithm::SlidingWindow))
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.remaining, 0);
    assert!(denied.retry_after.unwrap_or(0) > 0);
}

#[tokio::test]
async fn test_token_bucket_refills_after_window() {
    let (engine, _, clock) = engine(EngineConfig::default()).await;

    for _ in 0..5 {
        assert!(
            engine
                .check_rate_limit("user:2", 5, 1_000, Some(Algorithm::TokenBucket))
                .await
                .unwrap()
                .allowed
        );
    }
    assert!(
        !engine
            .check_rate_limit("user:2", 5, 1_000, Some(Algorithm::TokenBucket))
            .await
            .unwrap()
            .allowed
    );

    clock.advance(Duration::from_millis(1_000));
    let refilled = engine
        .check_rate_limit("user:2", 5, 1_000, Some(Algorithm::TokenBucket))
        .await
        .unwrap();
    assert!(refilled.allowed);
    assert_eq!(refilled.remaining, 4);
}

#[tokio::test]
async fn test_fixed_window_reset_time_is_aligned() {
    let (engine, _, clock) = engine(EngineConfig::default()).await;
    clock.set(START + 1_234);

    let result = engine
        .check_rate_limit("user:3", 3, 5_000, Some(Algorithm::FixedWindow))
        .await
        .unwrap();
    assert_eq!(result.reset_time % 5_000, 0);
    assert!(result.reset_time > START + 1_234);
}

#[tokio::test]
async fn test_reset_then_check_starts_fresh() {
    let (engine, _, _) = engine(EngineConfig::default()).await;

    for algorithm in Algorithm::ALL {
        for _ in 0..3 {
            engine
                .check_rate_limit("user:4", 3, 10_000, Some(algorithm))
                .await
                .unwrap();
        }
    }

    assert_eq!(engine.reset("user:4", None).await.unwrap(), 4);
    // Nothing left to delete the second time
    assert_eq!(engine.reset("user:4", None).await.unwrap(), 0);

    for algorithm in Algorithm::ALL {
        let result = engine
            .check_rate_limit("user:4", 3, 10_000, Some(algorithm))
            .await
            .unwrap();
        assert!(result.allowed, "{} after reset", algorithm);
        assert_eq!(result.total_hits, 1, "{} after reset", algorithm);
    }
}

#[tokio::test]
async fn test_circuit_breaker_opens_and_recovers() {
    let mut config = EngineConfig::default();
    config.circuit_breaker.failure_threshold = 3;
    config.circuit_breaker.recovery_timeout_ms = 1_000;
    let (engine, store, clock) = engine(config).await;

    store.set_available(false);
    for _ in 0..3 {
        let result = engine
            .check_rate_limit("user:5", 10, 1_000, None)
            .await
            .unwrap();
        // Fail-open safe default
        assert!(result.allowed);
    }
    let health = engine.get_health().await;
    assert_eq!(health.circuit_breaker.as_ref().unwrap().state, CircuitState::Open);

    // Open circuit short-circuits without touching the store
    let before = store.round_trips();
    assert!(engine
        .check_rate_limit("user:5", 10, 1_000, None)
        .await
        .unwrap()
        .allowed);
    assert_eq!(store.round_trips(), before);

    store.set_available(true);
    clock.advance(Duration::from_millis(1_000));
    let probe = engine
        .check_rate_limit("user:5", 10, 1_000, None)
        .await
        .unwrap();
    assert!(probe.allowed);
    assert_eq!(probe.total_hits, 1);

    let health = engine.get_health().await;
    let circuit = health.circuit_breaker.unwrap();
    assert_eq!(circuit.state, CircuitState::Closed);
    assert_eq!(circuit.consecutive_failures, 0);
    assert_eq!(health.stats.circuit_breaker_trips, 1);
    assert!(health.healthy);
}

#[tokio::test]
async fn test_batch_is_chunked_and_ordered() {
    let (engine, store, _) = engine(EngineConfig::default()).await;
    let requests: Vec<BatchRequest> = (0..250)
        .map(|i| BatchRequest::new(&format!("batch:{}", i), 5, 60_000))
        .collect();

    let before = store.round_trips();
    let response = engine
        .check_multiple(&requests, Some(Algorithm::SlidingWindow))
        .await
        .unwrap();
    assert_eq!(store.round_trips() - before, 3);

    assert_eq!(response.results.len(), 250);
    for (i, item) in response.results.iter().enumerate() {
        assert_eq!(item.identifier, format!("batch:{}", i));
        assert!(item.result.allowed);
    }
    assert_eq!(response.stats.chunks, 3);
    assert_eq!(response.stats.allowed, 250);
}

#[tokio::test]
async fn test_batch_structural_errors() {
    let mut config = EngineConfig::default();
    config.max_batch_requests = 10;
    let (limited, _, _) = engine(config).await;

    let requests = vec![BatchRequest::new("x", 1, 1_000); 11];
    let err = limited.check_multiple(&requests, None).await.unwrap_err();
    assert!(matches!(
        err,
        ratewarden::RateLimitError::BatchSizeExceeded { size: 11, max: 10 }
    ));

    let mut config = EngineConfig::default();
    config.batch_enabled = false;
    let (disabled, _, _) = engine(config).await;
    assert!(matches!(
        disabled.check_multiple(&requests[..1], None).await,
        Err(ratewarden::RateLimitError::BatchDisabled)
    ));
}

#[tokio::test]
async fn test_local_cache_never_serves_denial() {
    let clock = ManualClock::new(START);
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));

    let mut cached = EngineConfig::default();
    cached.local_cache.enabled = true;
    let front = engine_with(cached, store.clone(), &clock).await;
    let other = engine_with(EngineConfig::default(), store.clone(), &clock).await;

    // Another instance uses up the quota
    for _ in 0..2 {
        other.check_rate_limit("user:6", 2, 10_000, None).await.unwrap();
    }

    let first = front.check_rate_limit("user:6", 2, 10_000, None).await.unwrap();
    assert!(!first.allowed);

    let before = store.round_trips();
    let second = front.check_rate_limit("user:6", 2, 10_000, None).await.unwrap();
    assert!(!second.allowed);
    assert!(!second.cached);
    assert_eq!(store.round_trips() - before, 1);
    assert_eq!(front.get_stats().memory_usage.cache_entries, 0);

    front.shutdown().await;
}

#[tokio::test]
async fn test_local_cache_absorbs_repeated_allows() {
    let mut config = EngineConfig::default();
    config.local_cache.enabled = true;
    let (engine, store, _) = engine(config).await;

    let first = engine.check_rate_limit("user:7", 100, 10_000, None).await.unwrap();
    assert!(!first.cached);

    let before = store.round_trips();
    let second = engine.check_rate_limit("user:7", 100, 10_000, None).await.unwrap();
    assert!(second.cached);
    assert_eq!(store.round_trips(), before);
    assert!(engine.get_stats().cache_hit_rate > 0.0);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_procedures_reload_after_store_restart() {
    let (engine, store, _) = engine(EngineConfig::default()).await;
    engine
        .check_rate_limit("user:8", 5, 1_000, Some(Algorithm::LeakyBucket))
        .await
        .unwrap();

    store.flush_procedures();
    let result = engine
        .check_rate_limit("user:8", 5, 1_000, Some(Algorithm::LeakyBucket))
        .await
        .unwrap();
    assert!(result.allowed);
    assert_eq!(result.total_hits, 2);
}

#[tokio::test]
async fn test_instances_split_the_limit() {
    let clock = ManualClock::new(START);
    let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
    let bus = Arc::new(MemoryEventBus::new());

    let node = |id: &str| {
        let mut config = EngineConfig::default();
        config.distributed.enabled = true;
        config.distributed.instance_id = Some(id.to_string());
        config.distributed.sync_interval_ms = 20;
        RateLimitEngine::builder(config)
            .store(store.clone())
            .clock(Arc::new(clock.clone()))
            .event_bus(bus.clone())
            .build()
    };
    let a = node("node-a").await.unwrap();
    let b = node("node-b").await.unwrap();

    let discovered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let counts = (
                a.coordinator().map(|c| c.active_instance_count()),
                b.coordinator().map(|c| c.active_instance_count()),
            );
            if counts == (Some(2), Some(2)) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(discovered.is_ok(), "instances did not discover each other");

    // Each instance may use half of the shared limit
    for _ in 0..5 {
        assert!(a.check_rate_limit("shared", 10, 60_000, None).await.unwrap().allowed);
    }
    let denied = a.check_rate_limit("shared", 10, 60_000, None).await.unwrap();
    assert!(!denied.allowed);

    for _ in 0..5 {
        assert!(b.check_rate_limit("shared", 10, 60_000, None).await.unwrap().allowed);
    }
    let exhausted = b.check_rate_limit("shared", 10, 60_000, None).await.unwrap();
    assert!(!exhausted.allowed);
    assert_eq!(exhausted.remaining, 0);

    let published = bus.published();
    a.reset("shared", None).await.unwrap();
    assert!(bus.published() > published);

    a.shutdown().await;
    b.shutdown().await;
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn check_request(identifier: &str, limit: u64) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/check")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({
                "identifier": identifier,
                "limit": limit,
                "windowMs": 60_000,
            })
            .to_string(),
        ))
        .unwrap()
}

#[tokio::test]
async fn test_http_check_sets_headers_and_429() {
    let (engine, _, _) = engine(EngineConfig::default()).await;
    let app = create_app(Arc::new(engine));

    let response = app.clone().oneshot(check_request("user:9", 1)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["X-RateLimit-Limit"], "1");
    assert_eq!(response.headers()["X-RateLimit-Remaining"], "0");
    let body = body_json(response).await;
    assert_eq!(body["allowed"], true);
    assert_eq!(body["algorithm"], "sliding_window");

    let response = app.clone().oneshot(check_request("user:9", 1)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key("Retry-After"));

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/v1/limits/user:9?algorithm=sliding_window")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["deleted"], 1);

    let response = app.oneshot(check_request("user:9", 1)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_http_validation_and_health() {
    let (engine, _, _) = engine(EngineConfig::default()).await;
    let app = create_app(Arc::new(engine));

    let response = app.clone().oneshot(check_request("bad id", 1)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(response).await["error"], "validation_error");

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["store"]["reachable"], true);

    let response = app
        .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await.get("totalRequests").is_some());
}
