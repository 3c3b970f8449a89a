//! Store adapter.
//!
//! Thin I/O contract over the external key-value / sorted-set store. No
//! algorithmic knowledge lives behind this trait except for what the
//! server-side procedures carry with them.

mod memory;
mod redis;

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::scripts::Procedure;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Network failure, timeout or any other reason the store did not answer.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store does not know the procedure handle (e.g. after a restart).
    #[error("unknown procedure: {0}")]
    UnknownProcedure(String),

    /// The store answered with something of the wrong shape.
    #[error("malformed store reply: {0}")]
    Malformed(String),

    /// A procedure raised an error while running. The store itself is fine
    /// and running the call again would fail the same way.
    #[error("procedure failed: {0}")]
    Script(String),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        match err.kind() {
            ::redis::ErrorKind::NoScriptError => StoreError::UnknownProcedure(err.to_string()),
            ::redis::ErrorKind::TypeError => StoreError::Malformed(err.to_string()),
            ::redis::ErrorKind::ResponseError | ::redis::ErrorKind::ExtensionError => {
                StoreError::Script(err.to_string())
            }
            _ => StoreError::Unavailable(err.to_string()),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// One invocation of a registered server-side procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcedureCall {
    pub handle: String,
    pub keys: Vec<String>,
    pub args: Vec<String>,
}

/// A single operation inside a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Get { key: String },
    Set { key: String, value: String, ttl_ms: Option<u64> },
    Increment { key: String, by: i64 },
    Expire { key: String, ttl_ms: u64 },
    Delete { key: String },
    Execute(ProcedureCall),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreReply {
    Nil,
    Ok,
    Integer(i64),
    Text(String),
    Integers(Vec<i64>),
}

impl StoreReply {
    pub fn into_integers(self) -> StoreResult<Vec<i64>> {
        match self {
            StoreReply::Integers(values) => Ok(values),
            other => Err(StoreError::Malformed(format!(
                "expected an integer array, got {:?}",
                other
            ))),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync + Debug {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> StoreResult<()>;

    async fn increment(&self, key: &str, by: i64) -> StoreResult<i64>;

    async fn z_add(&self, key: &str, score: f64, member: &str) -> StoreResult<()>;

    async fn z_range_by_score(&self, key: &str, min: f64, max: f64)
        -> StoreResult<Vec<(String, f64)>>;

    async fn z_rem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64>;

    async fn expire(&self, key: &str, ttl_ms: u64) -> StoreResult<bool>;

    async fn delete(&self, keys: &[String]) -> StoreResult<u64>;

    /// All keys matching a glob pattern (`*` and `?`).
    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>>;

    /// Register a procedure and return the handle used to invoke it.
    async fn load_procedure(&self, procedure: &Procedure) -> StoreResult<String>;

    /// Which of `handles` the store currently knows.
    async fn procedures_exist(&self, handles: &[String]) -> StoreResult<Vec<bool>>;

    async fn execute(&self, call: &ProcedureCall) -> StoreResult<Vec<i64>>;

    /// Run several operations in one round trip. The outer error means the
    /// round trip itself failed; inner errors belong to single operations.
    /// Operations are sent once and never re-sent.
    async fn pipeline(&self, ops: &[StoreOp]) -> StoreResult<Vec<StoreResult<StoreReply>>>;

    /// Round-trip latency of a no-op command.
    async fn ping(&self) -> StoreResult<Duration>;
}

/// Redis `MATCH` semantics on top of `glob::Pattern`. Redis escapes a
/// character with a backslash; glob wants it bracketed instead.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let mut translated = String::with_capacity(pattern.len() + 8);
    let mut chars = pattern.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped @ ('*' | '?' | '[' | ']')) => {
                    translated.push('[');
                    translated.push(escaped);
                    translated.push(']');
                }
                Some(escaped) => translated.push(escaped),
                None => translated.push('\\'),
            },
            _ => translated.push(c),
        }
    }

    glob::Pattern::new(&translated)
        .map(|compiled| compiled.matches(text))
        .unwrap_or(false)
}
