//! Distributed rate limiting.
//!
//! [`RateLimitEngine`] admits or rejects requests per identifier against
//! quotas shared by every instance using the same store. State lives in
//! Redis and is only changed by server-side procedures, so concurrent
//! checks from many processes never race.

pub mod algorithms;
pub mod batch;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod executor;
pub mod handlers;
pub mod health;
pub mod key;
pub mod metrics;
pub mod middleware;
pub mod result;
pub mod scripts;
pub mod server;
pub mod single_flight;
pub mod store;
pub mod validation;

pub use algorithms::Algorithm;
pub use batch::{BatchItemResult, BatchRequest, BatchResponse, BatchStats, Priority};
pub use circuit_breaker::{CircuitState, FailurePolicy};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::EngineConfig;
pub use engine::{EngineBuilder, RateLimitEngine};
pub use error::{RateLimitError, Result};
pub use health::{HealthReport, HealthState};
pub use metrics::{EngineStats, Monitor, NoopMonitor};
pub use result::RateLimitResult;
pub use server::create_app;
