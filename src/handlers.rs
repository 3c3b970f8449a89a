use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::algorithms::Algorithm;
use crate::batch::BatchRequest;
use crate::engine::RateLimitEngine;
use crate::error::RateLimitError;
use crate::health::HealthState;
use crate::result::RateLimitResult;

/// Shared application state
pub type SharedState = Arc<RateLimitEngine>;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub identifier: String,
    pub limit: u64,
    pub window_ms: u64,
    #[serde(default)]
    pub algorithm: Option<Algorithm>,
}

#[derive(Debug, Deserialize)]
pub struct BatchCheckRequest {
    pub requests: Vec<BatchRequest>,
    #[serde(default)]
    pub algorithm: Option<Algorithm>,
}

#[derive(Debug, Deserialize)]
pub struct ResetQuery {
    pub algorithm: Option<Algorithm>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub identifier: String,
    pub deleted: u64,
}

/// `X-RateLimit-*` headers, plus `Retry-After` when denied.
pub fn rate_limit_headers(result: &RateLimitResult) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert("X-RateLimit-Limit", HeaderValue::from(result.limit));
    headers.insert("X-RateLimit-Remaining", HeaderValue::from(result.remaining));
    headers.insert(
        "X-RateLimit-Reset",
        HeaderValue::from(result.reset_time.div_ceil(1_000)),
    );
    if let Some(secs) = result.retry_after_secs().filter(|_| !result.allowed) {
        headers.insert("Retry-After", HeaderValue::from(secs));
    }
    headers
}

/// Check and count one request
pub async fn check(
    State(engine): State<SharedState>,
    Json(payload): Json<CheckRequest>,
) -> Result<impl IntoResponse, RateLimitError> {
    let result = engine
        .check_rate_limit(
            &payload.identifier,
            payload.limit,
            payload.window_ms,
            payload.algorithm,
        )
        .await?;

    let status = if result.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };
    Ok((status, rate_limit_headers(&result), Json(result)))
}

/// Check many requests in one call
pub async fn check_batch(
    State(engine): State<SharedState>,
    Json(payload): Json<BatchCheckRequest>,
) -> Result<impl IntoResponse, RateLimitError> {
    let response = engine
        .check_multiple(&payload.requests, payload.algorithm)
        .await?;
    Ok(Json(response))
}

/// Reset all limits of an identifier, optionally for one algorithm
pub async fn reset(
    State(engine): State<SharedState>,
    Path(identifier): Path<String>,
    Query(query): Query<ResetQuery>,
) -> Result<impl IntoResponse, RateLimitError> {
    let deleted = engine.reset(&identifier, query.algorithm).await?;
    Ok(Json(ResetResponse {
        identifier,
        deleted,
    }))
}

/// Health check endpoint; 503 only when the store is unreachable
pub async fn health(State(engine): State<SharedState>) -> impl IntoResponse {
    let report = engine.get_health().await;
    let status = match report.status {
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        HealthState::Healthy | HealthState::Degraded => StatusCode::OK,
    };
    (status, Json(report))
}

pub async fn stats(State(engine): State<SharedState>) -> impl IntoResponse {
    Json(engine.get_stats())
}
