use std::net::SocketAddr;

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};

use crate::algorithms::Algorithm;
use crate::circuit_breaker::FailurePolicy;
use crate::error::{RateLimitError, Result};
use crate::validation::{MAX_LIMIT, MAX_WINDOW_MS};

/// HTTP server settings.
#[derive(Debug, Envconfig, Clone)]
pub struct ServerConfig {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Default log level when RUST_LOG is unset
    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,
}

impl ServerConfig {
    pub fn from_env() -> std::result::Result<Self, envconfig::Error> {
        ServerConfig::init_from_env()
    }
}

#[derive(Debug, Envconfig, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    #[envconfig(from = "RATELIMIT_CIRCUIT_BREAKER_ENABLED", default = "true")]
    pub enabled: bool,

    /// Consecutive store failures before the circuit opens
    #[envconfig(from = "RATELIMIT_CIRCUIT_BREAKER_FAILURE_THRESHOLD", default = "5")]
    pub failure_threshold: u32,

    #[envconfig(from = "RATELIMIT_CIRCUIT_BREAKER_RECOVERY_TIMEOUT_MS", default = "30000")]
    pub recovery_timeout_ms: u64,

    #[envconfig(from = "RATELIMIT_CIRCUIT_BREAKER_FAILURE_POLICY", default = "fail-open")]
    pub failure_policy: FailurePolicy,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            failure_policy: FailurePolicy::FailOpen,
        }
    }
}

#[derive(Debug, Envconfig, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedConfig {
    #[envconfig(from = "RATELIMIT_DISTRIBUTED_ENABLED", default = "false")]
    pub enabled: bool,

    /// Generated when unset
    #[envconfig(from = "RATELIMIT_INSTANCE_ID")]
    pub instance_id: Option<String>,

    /// Heartbeat period
    #[envconfig(from = "RATELIMIT_SYNC_INTERVAL_MS", default = "5000")]
    pub sync_interval_ms: u64,

    /// Tolerated clock difference to a peer before warning
    #[envconfig(from = "RATELIMIT_MAX_DRIFT_MS", default = "1000")]
    pub max_drift_ms: u64,

    /// Floor for the active instance count used to split limits
    #[envconfig(from = "RATELIMIT_MIN_INSTANCE_COUNT", default = "1")]
    pub min_instance_count: usize,

    /// A peer is live while its last heartbeat is this recent; 3x the sync interval when unset
    #[envconfig(from = "RATELIMIT_INSTANCE_TTL_MS")]
    pub instance_ttl_ms: Option<u64>,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            instance_id: None,
            sync_interval_ms: 5_000,
            max_drift_ms: 1_000,
            min_instance_count: 1,
            instance_ttl_ms: None,
        }
    }
}

impl DistributedConfig {
    pub fn instance_ttl_ms(&self) -> u64 {
        self.instance_ttl_ms
            .unwrap_or(self.sync_interval_ms.saturating_mul(3))
    }
}

#[derive(Debug, Envconfig, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalCacheConfig {
    #[envconfig(from = "RATELIMIT_LOCAL_CACHE_ENABLED", default = "false")]
    pub enabled: bool,

    #[envconfig(from = "RATELIMIT_LOCAL_CACHE_MAX_ENTRIES", default = "10000")]
    pub max_entries: usize,

    #[envconfig(from = "RATELIMIT_LOCAL_CACHE_TTL_MS", default = "1000")]
    pub ttl_ms: u64,

    #[envconfig(from = "RATELIMIT_LOCAL_CACHE_SWEEP_INTERVAL_MS", default = "1000")]
    pub sweep_interval_ms: u64,

    /// How long a duplicate check waits for the in-flight one before going to the store itself
    #[envconfig(from = "RATELIMIT_SINGLE_FLIGHT_TIMEOUT_MS", default = "100")]
    pub single_flight_timeout_ms: u64,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_entries: 10_000,
            ttl_ms: 1_000,
            sweep_interval_ms: 1_000,
            single_flight_timeout_ms: 100,
        }
    }
}

/// Engine configuration, read from `RATELIMIT_*` environment variables.
#[derive(Debug, Envconfig, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[envconfig(from = "RATELIMIT_STORE_URL", default = "redis://127.0.0.1:6379")]
    pub store_url: String,

    #[envconfig(from = "RATELIMIT_KEY_PREFIX", default = "ratelimit")]
    pub key_prefix: String,

    /// Algorithm used when a check does not name one
    #[envconfig(from = "RATELIMIT_ALGORITHM", default = "sliding_window")]
    pub algorithm: Algorithm,

    /// Added to every state TTL so keys outlive their window slightly
    #[envconfig(from = "RATELIMIT_TTL_BUFFER_MS", default = "1000")]
    pub ttl_buffer_ms: u64,

    #[envconfig(from = "RATELIMIT_MAX_WINDOW_MS", default = "86400000")]
    pub max_window_ms: u64,

    #[envconfig(from = "RATELIMIT_BATCH_ENABLED", default = "true")]
    pub batch_enabled: bool,

    /// Items per store round trip
    #[envconfig(from = "RATELIMIT_MAX_BATCH_SIZE", default = "100")]
    pub max_batch_size: usize,

    /// Items accepted in one batch call
    #[envconfig(from = "RATELIMIT_MAX_BATCH_REQUESTS", default = "1000")]
    pub max_batch_requests: usize,

    /// Chunks in flight at once
    #[envconfig(from = "RATELIMIT_BATCH_CONCURRENCY", default = "4")]
    pub batch_concurrency: usize,

    #[envconfig(nested = true)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[envconfig(nested = true)]
    pub distributed: DistributedConfig,

    #[envconfig(nested = true)]
    pub local_cache: LocalCacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "ratelimit".to_string(),
            algorithm: Algorithm::SlidingWindow,
            ttl_buffer_ms: 1_000,
            max_window_ms: MAX_WINDOW_MS,
            batch_enabled: true,
            max_batch_size: 100,
            max_batch_requests: 1_000,
            batch_concurrency: 4,
            circuit_breaker: CircuitBreakerConfig::default(),
            distributed: DistributedConfig::default(),
            local_cache: LocalCacheConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config = EngineConfig::init_from_env()
            .map_err(|e| RateLimitError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(RateLimitError::Configuration(msg));

        if !["redis://", "rediss://", "redis+unix://"]
            .iter()
            .any(|scheme| self.store_url.starts_with(scheme))
        {
            return fail(format!("unsupported store URL '{}'", self.store_url));
        }
        if self.key_prefix.is_empty()
            || !self
                .key_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ':'))
        {
            return fail(format!("invalid key prefix '{}'", self.key_prefix));
        }
        if self.max_window_ms == 0 || self.max_window_ms > MAX_WINDOW_MS {
            return fail(format!(
                "max window must be between 1 and {} ms",
                MAX_WINDOW_MS
            ));
        }
        if self.max_batch_size == 0 {
            return fail("max batch size must be positive".to_string());
        }
        if self.max_batch_requests == 0 || self.max_batch_requests > MAX_LIMIT as usize * 10 {
            return fail(format!(
                "max batch requests must be between 1 and {}",
                MAX_LIMIT * 10
            ));
        }
        if self.batch_concurrency == 0 {
            return fail("batch concurrency must be positive".to_string());
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return fail("circuit breaker failure threshold must be positive".to_string());
        }
        if self.circuit_breaker.recovery_timeout_ms == 0 {
            return fail("circuit breaker recovery timeout must be positive".to_string());
        }
        if self.distributed.sync_interval_ms == 0 {
            return fail("sync interval must be positive".to_string());
        }
        if self.distributed.min_instance_count == 0 {
            return fail("minimum instance count must be at least 1".to_string());
        }
        if self.distributed.instance_ttl_ms() < self.distributed.sync_interval_ms {
            return fail("instance TTL must not be shorter than the sync interval".to_string());
        }
        if let Some(id) = &self.distributed.instance_id {
            if id.is_empty()
                || !id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            {
                return fail(format!("invalid instance id '{}'", id));
            }
        }
        if self.local_cache.enabled {
            if self.local_cache.max_entries == 0 {
                return fail("local cache size must be positive".to_string());
            }
            if self.local_cache.ttl_ms == 0 || self.local_cache.sweep_interval_ms == 0 {
                return fail("local cache TTL and sweep interval must be positive".to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.distributed.instance_ttl_ms(), 15_000);
        assert_eq!(config.circuit_breaker.failure_policy, FailurePolicy::FailOpen);
        assert!(!config.local_cache.enabled);
    }

    #[test]
    fn test_from_hashmap() {
        let env = HashMap::from([
            ("RATELIMIT_ALGORITHM".to_string(), "token_bucket".to_string()),
            ("RATELIMIT_KEY_PREFIX".to_string(), "rl".to_string()),
            ("RATELIMIT_CIRCUIT_BREAKER_FAILURE_POLICY".to_string(), "fail-closed".to_string()),
            ("RATELIMIT_INSTANCE_ID".to_string(), "node-1".to_string()),
            ("RATELIMIT_LOCAL_CACHE_MAX_ENTRIES".to_string(), "250".to_string()),
        ]);
        let config = EngineConfig::init_from_hashmap(&env).unwrap();
        assert_eq!(config.algorithm, Algorithm::TokenBucket);
        assert_eq!(config.key_prefix, "rl");
        assert_eq!(config.circuit_breaker.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.distributed.instance_id.as_deref(), Some("node-1"));
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.local_cache.max_entries, 250);
        assert!(config.validate().is_ok());

        let json = serde_json::to_value(&config.local_cache).unwrap();
        assert_eq!(json["maxEntries"], 250);
    }

    #[test]
    fn test_rejects_invalid_settings() {
        let mut config = EngineConfig::default();
        config.key_prefix = "bad prefix".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.max_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.distributed.instance_id = Some("a:b".to_string());
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.distributed.instance_ttl_ms = Some(10);
        assert!(config.validate().is_err());
    }
}
