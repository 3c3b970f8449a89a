//! In-process store.
//!
//! Behaves like a single Redis node: string, sorted-set and hash values with
//! millisecond expiry, registered procedures addressed by handle, and one
//! lock around everything so each procedure runs atomically. Procedures are
//! executed with the Rust algorithm implementations.
//!
//! Used by `--memory` mode and throughout the test suite, which is why it
//! can simulate outages and a store restart that forgets procedures.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{glob_match, ProcedureCall, Store, StoreError, StoreOp, StoreReply, StoreResult};
use crate::algorithms::{
    Algorithm, AlgorithmState, Decision, FixedWindow, LeakyBucket, SlidingWindow, TokenBucket,
};
use crate::clock::SharedClock;
use crate::scripts::{Procedure, ProcedureKind};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    /// `(score, member)` ordered by score.
    SortedSet(Vec<(f64, String)>),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

#[derive(Debug, Default)]
struct Inner {
    data: HashMap<String, Entry>,
    procedures: HashMap<String, ProcedureKind>,
}

impl Inner {
    fn live(&mut self, key: &str, now: u64) -> Option<&mut Entry> {
        let expired = matches!(
            self.data.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= now
        );
        if expired {
            self.data.remove(key);
        }
        self.data.get_mut(key)
    }

    fn get(&mut self, key: &str, now: u64) -> StoreResult<Option<String>> {
        match self.live(key, now) {
            None => Ok(None),
            Some(Entry { value: Value::Text(text), .. }) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn set(&mut self, key: &str, value: &str, ttl_ms: Option<u64>, now: u64) {
        self.data.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: ttl_ms.map(|ttl| now + ttl),
            },
        );
    }

    fn increment(&mut self, key: &str, by: i64, now: u64) -> StoreResult<i64> {
        let current = match self.get(key, now)? {
            Some(text) => text
                .parse::<i64>()
                .map_err(|_| StoreError::Malformed(format!("value at {} is not an integer", key)))?,
            None => 0,
        };
        let next = current + by;
        let expires_at = self.live(key, now).and_then(|entry| entry.expires_at);
        self.data.insert(
            key.to_string(),
            Entry {
                value: Value::Text(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    fn expire(&mut self, key: &str, ttl_ms: u64, now: u64) -> bool {
        match self.live(key, now) {
            Some(entry) => {
                entry.expires_at = Some(now + ttl_ms);
                true
            }
            None => false,
        }
    }

    fn delete(&mut self, key: &str, now: u64) -> bool {
        let existed = self.live(key, now).is_some();
        self.data.remove(key);
        existed
    }

    fn load_state(
        &mut self,
        key: &str,
        algorithm: Algorithm,
        limit: u64,
        now: u64,
    ) -> StoreResult<AlgorithmState> {
        let entry = match self.live(key, now) {
            Some(entry) => entry,
            None => return Ok(AlgorithmState::fresh(algorithm, limit, now)),
        };

        let state = match (algorithm, &entry.value) {
            (Algorithm::SlidingWindow, Value::SortedSet(members)) => {
                AlgorithmState::SlidingWindow(SlidingWindow::from_entries(
                    members
                        .iter()
                        .map(|(score, member)| (*score as u64, member.clone()))
                        .collect(),
                ))
            }
            (Algorithm::TokenBucket, Value::Hash(fields)) => {
                match (field_f64(fields, "tokens"), field_u64(fields, "last_refill")) {
                    (Some(tokens), Some(last)) => {
                        AlgorithmState::TokenBucket(TokenBucket::from_parts(tokens, last))
                    }
                    _ => AlgorithmState::fresh(algorithm, limit, now),
                }
            }
            (Algorithm::LeakyBucket, Value::Hash(fields)) => AlgorithmState::LeakyBucket(
                LeakyBucket::from_parts(
                    field_f64(fields, "volume").unwrap_or(0.0),
                    field_u64(fields, "last_leak").unwrap_or(now),
                ),
            ),
            (Algorithm::FixedWindow, Value::Text(count)) => AlgorithmState::FixedWindow(
                FixedWindow::with_count(count.parse().map_err(|_| {
                    StoreError::Malformed(format!("value at {} is not an integer", key))
                })?),
            ),
            _ => return Err(wrong_type(key)),
        };
        Ok(state)
    }

    fn store_state(&mut self, key: &str, state: &AlgorithmState, expires_at: Option<u64>) {
        let value = match state {
            AlgorithmState::SlidingWindow(window) => {
                if window.is_empty() {
                    self.data.remove(key);
                    return;
                }
                Value::SortedSet(
                    window
                        .entries()
                        .map(|(ts, member)| (*ts as f64, member.clone()))
                        .collect(),
                )
            }
            AlgorithmState::TokenBucket(bucket) => Value::Hash(HashMap::from([
                ("tokens".to_string(), bucket.tokens().to_string()),
                ("last_refill".to_string(), bucket.last_refill().to_string()),
            ])),
            AlgorithmState::LeakyBucket(bucket) => Value::Hash(HashMap::from([
                ("volume".to_string(), bucket.volume().to_string()),
                ("last_leak".to_string(), bucket.last_leak().to_string()),
            ])),
            AlgorithmState::FixedWindow(window) => Value::Text(window.count().to_string()),
        };
        self.data
            .insert(key.to_string(), Entry { value, expires_at });
    }

    /// One admission step against `key`, mirroring the Lua routines.
    #[allow(clippy::too_many_arguments)]
    fn admit(
        &mut self,
        key: &str,
        algorithm: Algorithm,
        limit: u64,
        window_ms: u64,
        now: u64,
        ttl_ms: u64,
        member: &str,
        commit: bool,
    ) -> StoreResult<Decision> {
        let mut state = self.load_state(key, algorithm, limit, now)?;
        let decision = state.evaluate(limit, window_ms, now, member);

        if commit {
            let refresh = decision.allowed
                || matches!(algorithm, Algorithm::TokenBucket | Algorithm::LeakyBucket);
            let expires_at = if refresh {
                Some(now + ttl_ms)
            } else {
                self.live(key, now).and_then(|entry| entry.expires_at)
            };
            self.store_state(key, &state, expires_at);
        }
        Ok(decision)
    }

    fn execute(&mut self, call: &ProcedureCall, now: u64) -> StoreResult<Vec<i64>> {
        let kind = *self
            .procedures
            .get(&call.handle)
            .ok_or_else(|| StoreError::UnknownProcedure(call.handle.clone()))?;
        let args = &call.args;

        match kind {
            ProcedureKind::Single(algorithm) => {
                let key = key_at(&call.keys, 0)?;
                let decision = self.admit(
                    key,
                    algorithm,
                    arg_u64(args, 0)?,
                    arg_u64(args, 1)?,
                    arg_u64(args, 2)?,
                    arg_u64(args, 3)?,
                    arg_str(args, 4)?,
                    true,
                )?;
                Ok(decision.to_reply())
            }
            ProcedureKind::SlidingWindowBatch => {
                let call_now = arg_u64(args, 0)?;
                let buffer = arg_u64(args, 1)?;
                let mut reply = Vec::with_capacity(call.keys.len() * 7);
                for (i, key) in call.keys.iter().enumerate() {
                    let base = 2 + i * 3;
                    let window_ms = arg_u64(args, base + 1)?;
                    let decision = self.admit(
                        key,
                        Algorithm::SlidingWindow,
                        arg_u64(args, base)?,
                        window_ms,
                        call_now,
                        window_ms + buffer,
                        arg_str(args, base + 2)?,
                        true,
                    )?;
                    reply.extend(decision.to_reply());
                }
                Ok(reply)
            }
            ProcedureKind::Coordinated => {
                let algorithm: Algorithm = arg_str(args, 0)?
                    .parse()
                    .map_err(|_| StoreError::Malformed("unknown algorithm".to_string()))?;
                let global_key = key_at(&call.keys, 0)?;
                let instance_key = key_at(&call.keys, 1)?;
                let limit = arg_u64(args, 1)?;
                let instance_limit = arg_u64(args, 2)?;
                let window_ms = arg_u64(args, 3)?;
                let call_now = arg_u64(args, 4)?;
                let ttl_ms = arg_u64(args, 5)?;
                let member = arg_str(args, 6)?;

                let global = self.admit(
                    global_key, algorithm, limit, window_ms, call_now, ttl_ms, member, false,
                )?;
                if !global.allowed {
                    return Ok(global.to_reply());
                }

                let instance = self.admit(
                    instance_key,
                    algorithm,
                    instance_limit,
                    window_ms,
                    call_now,
                    ttl_ms,
                    member,
                    false,
                )?;
                if !instance.allowed {
                    let total = (global.total_hits - 1).max(0);
                    let denied = Decision {
                        allowed: false,
                        total_hits: total,
                        remaining: limit.saturating_sub(total as u64),
                        reset_time: global.reset_time.max(instance.reset_time),
                        window_start: global.window_start,
                        window_end: global.window_end,
                        retry_after: instance.retry_after,
                    };
                    return Ok(denied.to_reply());
                }

                self.admit(
                    instance_key,
                    algorithm,
                    instance_limit,
                    window_ms,
                    call_now,
                    ttl_ms,
                    member,
                    true,
                )?;
                let committed = self.admit(
                    global_key, algorithm, limit, window_ms, call_now, ttl_ms, member, true,
                )?;
                Ok(committed.to_reply())
            }
        }
    }

    fn apply(&mut self, op: &StoreOp, now: u64) -> StoreResult<StoreReply> {
        match op {
            StoreOp::Get { key } => Ok(self
                .get(key, now)?
                .map(StoreReply::Text)
                .unwrap_or(StoreReply::Nil)),
            StoreOp::Set { key, value, ttl_ms } => {
                self.set(key, value, *ttl_ms, now);
                Ok(StoreReply::Ok)
            }
            StoreOp::Increment { key, by } => self.increment(key, *by, now).map(StoreReply::Integer),
            StoreOp::Expire { key, ttl_ms } => {
                Ok(StoreReply::Integer(self.expire(key, *ttl_ms, now) as i64))
            }
            StoreOp::Delete { key } => Ok(StoreReply::Integer(self.delete(key, now) as i64)),
            StoreOp::Execute(call) => self.execute(call, now).map(StoreReply::Integers),
        }
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::Malformed(format!(
        "WRONGTYPE operation against key {} holding the wrong kind of value",
        key
    ))
}

fn field_f64(fields: &HashMap<String, String>, name: &str) -> Option<f64> {
    fields.get(name).and_then(|v| v.parse().ok())
}

fn field_u64(fields: &HashMap<String, String>, name: &str) -> Option<u64> {
    fields.get(name).and_then(|v| v.parse().ok())
}

fn key_at(keys: &[String], idx: usize) -> StoreResult<&str> {
    keys.get(idx)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Malformed(format!("missing key #{}", idx + 1)))
}

fn arg_str(args: &[String], idx: usize) -> StoreResult<&str> {
    args.get(idx)
        .map(String::as_str)
        .ok_or_else(|| StoreError::Malformed(format!("missing argument #{}", idx + 1)))
}

fn arg_u64(args: &[String], idx: usize) -> StoreResult<u64> {
    arg_str(args, idx)?
        .parse()
        .map_err(|_| StoreError::Malformed(format!("argument #{} is not a number", idx + 1)))
}

#[derive(Debug)]
pub struct MemoryStore {
    clock: SharedClock,
    inner: Mutex<Inner>,
    available: AtomicBool,
    round_trips: AtomicU64,
}

impl MemoryStore {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
            round_trips: AtomicU64::new(0),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Forget all registered procedures, as a restarted Redis would.
    pub fn flush_procedures(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.procedures.clear();
        }
    }

    /// Number of round trips served (or refused) so far.
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::SeqCst)
    }

    pub fn key_count(&self) -> usize {
        let now = self.clock.now_ms();
        self.inner
            .lock()
            .map(|inner| {
                inner
                    .data
                    .values()
                    .filter(|e| e.expires_at.map_or(true, |at| at > now))
                    .count()
            })
            .unwrap_or(0)
    }

    fn begin(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".to_string()))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now_ms();
        self.begin()?.get(key, now)
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> StoreResult<()> {
        let now = self.clock.now_ms();
        self.begin()?.set(key, value, ttl_ms, now);
        Ok(())
    }

    async fn increment(&self, key: &str, by: i64) -> StoreResult<i64> {
        let now = self.clock.now_ms();
        self.begin()?.increment(key, by, now)
    }

    async fn z_add(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        let now = self.clock.now_ms();
        let mut inner = self.begin()?;
        if inner.live(key, now).is_none() {
            inner.data.insert(
                key.to_string(),
                Entry {
                    value: Value::SortedSet(Vec::new()),
                    expires_at: None,
                },
            );
        }
        let entry = inner.live(key, now).ok_or_else(|| wrong_type(key))?;
        match &mut entry.value {
            Value::SortedSet(members) => {
                members.retain(|(_, m)| m != member);
                let idx = members.partition_point(|(s, _)| *s <= score);
                members.insert(idx, (score, member.to_string()));
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn z_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>> {
        let now = self.clock.now_ms();
        let mut inner = self.begin()?;
        match inner.live(key, now) {
            None => Ok(Vec::new()),
            Some(Entry { value: Value::SortedSet(members), .. }) => Ok(members
                .iter()
                .filter(|(s, _)| *s >= min && *s <= max)
                .map(|(s, m)| (m.clone(), *s))
                .collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn z_rem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        let now = self.clock.now_ms();
        let mut inner = self.begin()?;
        match inner.live(key, now) {
            None => Ok(0),
            Some(Entry { value: Value::SortedSet(members), .. }) => {
                let before = members.len();
                members.retain(|(s, _)| *s < min || *s > max);
                Ok((before - members.len()) as u64)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl_ms: u64) -> StoreResult<bool> {
        let now = self.clock.now_ms();
        Ok(self.begin()?.expire(key, ttl_ms, now))
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        let now = self.clock.now_ms();
        let mut inner = self.begin()?;
        Ok(keys.iter().filter(|key| inner.delete(key, now)).count() as u64)
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let now = self.clock.now_ms();
        let inner = self.begin()?;
        let mut keys: Vec<String> = inner
            .data
            .iter()
            .filter(|(_, e)| e.expires_at.map_or(true, |at| at > now))
            .filter(|(k, _)| glob_match(pattern, k))
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn load_procedure(&self, procedure: &Procedure) -> StoreResult<String> {
        let mut inner = self.begin()?;
        let mut hasher = DefaultHasher::new();
        procedure.source.hash(&mut hasher);
        let handle = format!("{:016x}", hasher.finish());
        inner.procedures.insert(handle.clone(), procedure.kind);
        Ok(handle)
    }

    async fn procedures_exist(&self, handles: &[String]) -> StoreResult<Vec<bool>> {
        let inner = self.begin()?;
        Ok(handles
            .iter()
            .map(|handle| inner.procedures.contains_key(handle))
            .collect())
    }

    async fn execute(&self, call: &ProcedureCall) -> StoreResult<Vec<i64>> {
        let now = self.clock.now_ms();
        self.begin()?.execute(call, now)
    }

    async fn pipeline(&self, ops: &[StoreOp]) -> StoreResult<Vec<StoreResult<StoreReply>>> {
        let now = self.clock.now_ms();
        let mut inner = self.begin()?;
        Ok(ops.iter().map(|op| inner.apply(op, now)).collect())
    }

    async fn ping(&self) -> StoreResult<Duration> {
        let started = Instant::now();
        drop(self.begin()?);
        Ok(started.elapsed())
    }
}
