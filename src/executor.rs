//! Atomic execution layer.
//!
//! Builds procedure calls from validated keys and limits, runs them through
//! the store and decodes the replies. When the store reports an unknown
//! procedure handle on a single call, the registry re-registers everything
//! and the call is retried exactly once. Pipelines are never retried: their
//! procedures are verified before sending instead.

use std::sync::Arc;

use tracing::warn;
use uuid::Uuid;

use crate::algorithms::{Algorithm, Decision, REPLY_LEN};
use crate::error::{RateLimitError, Result};
use crate::key::RateLimitKey;
use crate::scripts::{ProcedureKind, ScriptRegistry};
use crate::store::{ProcedureCall, Store, StoreError, StoreOp, StoreResult, StoreReply};
use crate::validation::{MAX_LIMIT, MAX_WINDOW_MS};

/// One admission to run as part of a multi-item call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub key: RateLimitKey,
    pub limit: u64,
    pub window_ms: u64,
}

/// An admission against a global counter and this instance's share of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedAdmission {
    pub global: Admission,
    pub instance: RateLimitKey,
    pub instance_limit: u64,
}

#[derive(Debug)]
pub struct AtomicExecutor {
    store: Arc<dyn Store>,
    registry: Arc<ScriptRegistry>,
    ttl_buffer_ms: u64,
}

fn new_member() -> String {
    Uuid::new_v4().simple().to_string()
}

fn ensure_bounds(limit: u64, window_ms: u64) -> Result<()> {
    if limit > MAX_LIMIT || window_ms == 0 || window_ms > MAX_WINDOW_MS {
        return Err(RateLimitError::Validation(format!(
            "limit {} / window {}ms outside accepted bounds",
            limit, window_ms
        )));
    }
    Ok(())
}

fn decode(reply: StoreResult<StoreReply>) -> Result<Decision> {
    let values = reply?.into_integers()?;
    Decision::from_reply(&values)
}

impl AtomicExecutor {
    pub fn new(store: Arc<dyn Store>, registry: Arc<ScriptRegistry>, ttl_buffer_ms: u64) -> Self {
        Self {
            store,
            registry,
            ttl_buffer_ms,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Register all procedures with the store.
    pub async fn initialize(&self) -> Result<()> {
        self.registry.register_all(self.store.as_ref()).await
    }

    /// Register lazily when the store was down at startup.
    async fn ensure_registered(&self) -> Result<()> {
        if self.registry.handle(ProcedureKind::Coordinated).is_none() {
            self.initialize().await?;
        }
        Ok(())
    }

    fn handle(&self, kind: ProcedureKind) -> Result<String> {
        self.registry.handle(kind).ok_or_else(|| {
            RateLimitError::Security(format!("procedure {} is not registered", kind.name()))
        })
    }

    /// Keys and arguments of a single-key procedure call.
    fn single_args(&self, admission: &Admission, now: u64) -> (Vec<String>, Vec<String>) {
        let ttl = admission
            .key
            .algorithm
            .state_ttl_ms(admission.window_ms, now, self.ttl_buffer_ms);
        (
            vec![admission.key.to_string()],
            vec![
                admission.limit.to_string(),
                admission.window_ms.to_string(),
                now.to_string(),
                ttl.to_string(),
                new_member(),
            ],
        )
    }

    fn single_call(&self, admission: &Admission, now: u64) -> Result<StoreOp> {
        ensure_bounds(admission.limit, admission.window_ms)?;
        let handle = self.handle(ProcedureKind::Single(admission.key.algorithm))?;
        let (keys, args) = self.single_args(admission, now);
        Ok(StoreOp::Execute(ProcedureCall { handle, keys, args }))
    }

    fn coordinated_args(&self, shared: &SharedAdmission, now: u64) -> (Vec<String>, Vec<String>) {
        let global = &shared.global;
        let algorithm: Algorithm = global.key.algorithm;
        let ttl = algorithm.state_ttl_ms(global.window_ms, now, self.ttl_buffer_ms);
        (
            vec![global.key.to_string(), shared.instance.to_string()],
            vec![
                algorithm.as_str().to_string(),
                global.limit.to_string(),
                shared.instance_limit.to_string(),
                global.window_ms.to_string(),
                now.to_string(),
                ttl.to_string(),
                new_member(),
            ],
        )
    }

    fn coordinated_call(&self, shared: &SharedAdmission, now: u64) -> Result<StoreOp> {
        ensure_bounds(shared.global.limit, shared.global.window_ms)?;
        let handle = self.handle(ProcedureKind::Coordinated)?;
        let (keys, args) = self.coordinated_args(shared, now);
        Ok(StoreOp::Execute(ProcedureCall { handle, keys, args }))
    }

    async fn run(&self, kind: ProcedureKind, keys: Vec<String>, args: Vec<String>) -> Result<Vec<i64>> {
        self.ensure_registered().await?;
        let call = ProcedureCall {
            handle: self.handle(kind)?,
            keys,
            args,
        };

        match self.store.execute(&call).await {
            Err(StoreError::UnknownProcedure(_)) => {
                warn!(procedure = %kind.name(), "Procedure unknown to store, reloading");
                self.registry.reload(self.store.as_ref(), &call.handle).await?;
                let retry = ProcedureCall {
                    handle: self.handle(kind)?,
                    ..call
                };
                Ok(self.store.execute(&retry).await?)
            }
            other => Ok(other?),
        }
    }

    /// One admission step for one key.
    pub async fn check(&self, admission: &Admission, now: u64) -> Result<Decision> {
        ensure_bounds(admission.limit, admission.window_ms)?;
        let (keys, args) = self.single_args(admission, now);
        let reply = self
            .run(ProcedureKind::Single(admission.key.algorithm), keys, args)
            .await?;
        Decision::from_reply(&reply)
    }

    /// Admit against the global counter and this instance's share of it.
    /// Both counters are updated, or neither.
    pub async fn check_coordinated(&self, shared: &SharedAdmission, now: u64) -> Result<Decision> {
        ensure_bounds(shared.global.limit, shared.global.window_ms)?;
        let (keys, args) = self.coordinated_args(shared, now);
        let reply = self.run(ProcedureKind::Coordinated, keys, args).await?;
        Decision::from_reply(&reply)
    }

    /// Sliding window admissions for many keys in one procedure call.
    /// The call succeeds or fails as a whole.
    pub async fn check_sliding_batch(&self, admissions: &[Admission], now: u64) -> Result<Vec<Decision>> {
        if admissions.is_empty() {
            return Ok(Vec::new());
        }

        let mut keys = Vec::with_capacity(admissions.len());
        let mut args = Vec::with_capacity(2 + admissions.len() * 3);
        args.push(now.to_string());
        args.push(self.ttl_buffer_ms.to_string());
        for admission in admissions {
            ensure_bounds(admission.limit, admission.window_ms)?;
            keys.push(admission.key.to_string());
            args.push(admission.limit.to_string());
            args.push(admission.window_ms.to_string());
            args.push(new_member());
        }

        let reply = self.run(ProcedureKind::SlidingWindowBatch, keys, args).await?;
        if reply.len() != admissions.len() * REPLY_LEN {
            return Err(RateLimitError::Security(format!(
                "batch reply has {} fields for {} items",
                reply.len(),
                admissions.len()
            )));
        }
        reply.chunks(REPLY_LEN).map(Decision::from_reply).collect()
    }

    /// Make sure the store knows `kind` before a pipeline relies on it.
    pub async fn verify(&self, kind: ProcedureKind) -> Result<()> {
        self.ensure_registered().await?;
        let handle = self.handle(kind)?;
        let known = self
            .store
            .procedures_exist(std::slice::from_ref(&handle))
            .await?;
        if known.first().copied().unwrap_or(false) {
            return Ok(());
        }
        warn!(procedure = %kind.name(), "Procedure unknown to store, reloading");
        self.registry.reload(self.store.as_ref(), &handle).await
    }

    /// Send `ops` in one round trip. Stale handles trigger a reload for
    /// later calls; the affected items fail.
    async fn send(&self, ops: Vec<StoreOp>) -> Result<Vec<Result<Decision>>> {
        let replies = self.store.pipeline(&ops).await?;
        if replies.len() != ops.len() {
            return Err(RateLimitError::Security(format!(
                "pipeline returned {} replies for {} operations",
                replies.len(),
                ops.len()
            )));
        }

        let stale = replies
            .iter()
            .zip(&ops)
            .find_map(|(reply, op)| match (reply, op) {
                (Err(StoreError::UnknownProcedure(_)), StoreOp::Execute(call)) => {
                    Some(call.handle.clone())
                }
                _ => None,
            });
        if let Some(handle) = stale {
            warn!("Pipelined procedure unknown to store, reloading");
            if let Err(e) = self.registry.reload(self.store.as_ref(), &handle).await {
                warn!(error = %e, "Procedure reload failed");
            }
        }

        Ok(replies.into_iter().map(decode).collect())
    }

    /// Single-key admissions for many keys in one pipelined round trip.
    /// The outer error means the round trip failed; inner errors are per item.
    pub async fn check_pipelined(
        &self,
        admissions: &[Admission],
        now: u64,
    ) -> Result<Vec<Result<Decision>>> {
        if admissions.is_empty() {
            return Ok(Vec::new());
        }

        self.ensure_registered().await?;
        let ops = admissions
            .iter()
            .map(|a| self.single_call(a, now))
            .collect::<Result<Vec<_>>>()?;
        self.send(ops).await
    }

    /// Coordinated admissions for many keys in one pipelined round trip.
    pub async fn check_coordinated_pipelined(
        &self,
        admissions: &[SharedAdmission],
        now: u64,
    ) -> Result<Vec<Result<Decision>>> {
        if admissions.is_empty() {
            return Ok(Vec::new());
        }

        self.ensure_registered().await?;
        let ops = admissions
            .iter()
            .map(|a| self.coordinated_call(a, now))
            .collect::<Result<Vec<_>>>()?;
        self.send(ops).await
    }

    pub async fn delete(&self, keys: &[String]) -> Result<u64> {
        Ok(self.store.delete(keys).await?)
    }

    pub async fn scan(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self.store.scan(pattern).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::store::MemoryStore;

    async fn executor() -> (AtomicExecutor, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let executor = AtomicExecutor::new(store.clone(), Arc::new(ScriptRegistry::new()), 1_000);
        executor.initialize().await.unwrap();
        (executor, store, clock)
    }

    fn admission(algorithm: Algorithm, id: &str, limit: u64, now: u64) -> Admission {
        Admission {
            key: RateLimitKey::new("rl", algorithm, 1_000, id, now),
            limit,
            window_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_check_runs_procedure() {
        let (executor, _, clock) = executor().await;
        let now = clock.now_ms();
        let a = admission(Algorithm::SlidingWindow, "u", 2, now);

        assert!(executor.check(&a, now).await.unwrap().allowed);
        assert!(executor.check(&a, now).await.unwrap().allowed);
        assert!(!executor.check(&a, now).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_reloads_once_after_store_restart() {
        let (executor, store, clock) = executor().await;
        let now = clock.now_ms();
        let a = admission(Algorithm::TokenBucket, "u", 5, now);

        store.flush_procedures();
        let decision = executor.check(&a, now).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_registers_on_first_use() {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let executor = AtomicExecutor::new(store, Arc::new(ScriptRegistry::new()), 1_000);
        let now = clock.now_ms();
        let decision = executor
            .check(&admission(Algorithm::SlidingWindow, "u", 1, now), now)
            .await
            .unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn test_outage_surfaces_store_unavailable() {
        let (executor, store, clock) = executor().await;
        let now = clock.now_ms();
        store.set_available(false);
        let err = executor
            .check(&admission(Algorithm::FixedWindow, "u", 5, now), now)
            .await
            .unwrap_err();
        assert!(matches!(err, RateLimitError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_sliding_batch_is_one_call() {
        let (executor, store, clock) = executor().await;
        let now = clock.now_ms();
        let admissions: Vec<Admission> = (0..5)
            .map(|i| admission(Algorithm::SlidingWindow, &format!("u{}", i % 2), 2, now))
            .collect();

        let before = store.round_trips();
        let decisions = executor.check_sliding_batch(&admissions, now).await.unwrap();
        assert_eq!(store.round_trips() - before, 1);

        let allowed: Vec<bool> = decisions.iter().map(|d| d.allowed).collect();
        assert_eq!(allowed, vec![true, true, true, true, false]);
    }

    #[tokio::test]
    async fn test_verify_reloads_before_pipeline() {
        let (executor, store, clock) = executor().await;
        let now = clock.now_ms();
        let admissions = vec![
            admission(Algorithm::LeakyBucket, "a", 3, now),
            admission(Algorithm::LeakyBucket, "b", 3, now),
        ];

        store.flush_procedures();
        executor
            .verify(ProcedureKind::Single(Algorithm::LeakyBucket))
            .await
            .unwrap();
        let results = executor.check_pipelined(&admissions, now).await.unwrap();
        for result in results {
            let decision = result.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.total_hits, 1);
        }
    }

    #[tokio::test]
    async fn test_stale_pipeline_is_not_resent() {
        let (executor, store, clock) = executor().await;
        let now = clock.now_ms();
        let admissions = vec![
            admission(Algorithm::FixedWindow, "a", 3, now),
            admission(Algorithm::FixedWindow, "b", 3, now),
        ];

        store.flush_procedures();
        let before = store.round_trips();
        let results = executor.check_pipelined(&admissions, now).await.unwrap();
        assert!(results.iter().all(|r| r.is_err()));
        // One pipeline plus the re-registration, nothing sent twice
        let registrations = ProcedureKind::all().len() as u64;
        assert_eq!(store.round_trips() - before, 1 + registrations);

        let results = executor.check_pipelined(&admissions, now).await.unwrap();
        for result in results {
            assert_eq!(result.unwrap().total_hits, 1);
        }
    }

    #[tokio::test]
    async fn test_coordinated_respects_instance_share() {
        let (executor, _, clock) = executor().await;
        let now = clock.now_ms();
        let global = admission(Algorithm::SlidingWindow, "u", 10, now);
        let shared = SharedAdmission {
            instance: global.key.for_instance("node-a"),
            global,
            instance_limit: 5,
        };

        for _ in 0..5 {
            assert!(executor.check_coordinated(&shared, now).await.unwrap().allowed);
        }
        let denied = executor.check_coordinated(&shared, now).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.total_hits, 5);
        assert_eq!(denied.remaining, 5);
    }

    #[tokio::test]
    async fn test_coordinated_pipeline_matches_single_calls() {
        let (executor, _, clock) = executor().await;
        let now = clock.now_ms();
        let global = admission(Algorithm::FixedWindow, "u", 4, now);
        let shared = SharedAdmission {
            instance: global.key.for_instance("node-a"),
            global,
            instance_limit: 2,
        };

        let batch = vec![shared.clone(), shared.clone(), shared];
        let allowed: Vec<bool> = executor
            .check_coordinated_pipelined(&batch, now)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.unwrap().allowed)
            .collect();
        assert_eq!(allowed, vec![true, true, false]);
    }
}
