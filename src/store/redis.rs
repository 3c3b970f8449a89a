use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Cmd, RedisError, Value};
use tracing::{debug, warn};

use super::{ProcedureCall, Store, StoreError, StoreOp, StoreReply, StoreResult};
use crate::distributed::RedisEventBus;
use crate::scripts::Procedure;

const SCAN_BATCH: usize = 500;

/// Store backed by a Redis server through a multiplexed, auto-reconnecting
/// connection.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("server", &self.client.get_connection_info().addr)
            .finish()
    }
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = Client::open(redis_url).map_err(|e| {
            StoreError::Unavailable(format!("Failed to create Redis client: {}", e))
        })?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to connect to Redis: {}", e)))?;

        debug!(url = %redis_url, "Connected to Redis");
        Ok(Self { client, connection })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Pub/sub bus on the same server.
    pub fn event_bus(&self) -> RedisEventBus {
        RedisEventBus::new(self.client.clone(), self.connection.clone())
    }

    async fn query<T: redis::FromRedisValue>(&self, cmd: &Cmd) -> StoreResult<T> {
        let mut conn = self.connection.clone();
        cmd.query_async::<_, T>(&mut conn).await.map_err(StoreError::from)
    }
}

fn evalsha(call: &ProcedureCall) -> Cmd {
    let mut cmd = redis::cmd("EVALSHA");
    cmd.arg(&call.handle).arg(call.keys.len());
    for key in &call.keys {
        cmd.arg(key);
    }
    for arg in &call.args {
        cmd.arg(arg);
    }
    cmd
}

fn command_for(op: &StoreOp) -> Cmd {
    match op {
        StoreOp::Get { key } => {
            let mut cmd = redis::cmd("GET");
            cmd.arg(key);
            cmd
        }
        StoreOp::Set { key, value, ttl_ms } => {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl_ms {
                cmd.arg("PX").arg(*ttl);
            }
            cmd
        }
        StoreOp::Increment { key, by } => {
            let mut cmd = redis::cmd("INCRBY");
            cmd.arg(key).arg(*by);
            cmd
        }
        StoreOp::Expire { key, ttl_ms } => {
            let mut cmd = redis::cmd("PEXPIRE");
            cmd.arg(key).arg(*ttl_ms);
            cmd
        }
        StoreOp::Delete { key } => {
            let mut cmd = redis::cmd("DEL");
            cmd.arg(key);
            cmd
        }
        StoreOp::Execute(call) => evalsha(call),
    }
}

fn reply_from_value(value: Value) -> StoreResult<StoreReply> {
    match value {
        Value::Nil => Ok(StoreReply::Nil),
        Value::Okay => Ok(StoreReply::Ok),
        Value::Status(status) => Ok(StoreReply::Text(status)),
        Value::Int(n) => Ok(StoreReply::Integer(n)),
        Value::Data(bytes) => String::from_utf8(bytes)
            .map(StoreReply::Text)
            .map_err(|_| StoreError::Malformed("reply is not valid UTF-8".to_string())),
        Value::Bulk(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Int(n) => Ok(n),
                other => Err(StoreError::Malformed(format!(
                    "non-integer element in reply: {:?}",
                    other
                ))),
            })
            .collect::<StoreResult<Vec<i64>>>()
            .map(StoreReply::Integers),
    }
}

/// A failed round trip that still reached the server. Every operation in it
/// has already run; only the first error reply is known.
fn is_server_reply(err: &RedisError) -> bool {
    !(err.is_io_error() || err.is_connection_dropped() || err.is_timeout())
}

/// The same error for every operation of a pipeline whose replies were lost.
fn failed_replies(err: StoreError, count: usize) -> Vec<StoreResult<StoreReply>> {
    vec![Err(err); count]
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl_ms: Option<u64>) -> StoreResult<()> {
        let cmd = command_for(&StoreOp::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl_ms,
        });
        self.query::<()>(&cmd).await
    }

    async fn increment(&self, key: &str, by: i64) -> StoreResult<i64> {
        self.query(redis::cmd("INCRBY").arg(key).arg(by)).await
    }

    async fn z_add(&self, key: &str, score: f64, member: &str) -> StoreResult<()> {
        self.query::<i64>(redis::cmd("ZADD").arg(key).arg(score).arg(member))
            .await
            .map(|_| ())
    }

    async fn z_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<Vec<(String, f64)>> {
        self.query(
            redis::cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(min)
                .arg(max)
                .arg("WITHSCORES"),
        )
        .await
    }

    async fn z_rem_range_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<u64> {
        self.query(redis::cmd("ZREMRANGEBYSCORE").arg(key).arg(min).arg(max))
            .await
    }

    async fn expire(&self, key: &str, ttl_ms: u64) -> StoreResult<bool> {
        self.query(redis::cmd("PEXPIRE").arg(key).arg(ttl_ms)).await
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.query(redis::cmd("DEL").arg(keys)).await
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .query(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(SCAN_BATCH),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn load_procedure(&self, procedure: &Procedure) -> StoreResult<String> {
        self.query(redis::cmd("SCRIPT").arg("LOAD").arg(&procedure.source))
            .await
    }

    async fn procedures_exist(&self, handles: &[String]) -> StoreResult<Vec<bool>> {
        if handles.is_empty() {
            return Ok(Vec::new());
        }
        self.query(redis::cmd("SCRIPT").arg("EXISTS").arg(handles))
            .await
    }

    async fn execute(&self, call: &ProcedureCall) -> StoreResult<Vec<i64>> {
        self.query(&evalsha(call)).await
    }

    async fn pipeline(&self, ops: &[StoreOp]) -> StoreResult<Vec<StoreResult<StoreReply>>> {
        let mut pipe = redis::pipe();
        for op in ops {
            pipe.add_command(command_for(op));
        }

        let mut conn = self.connection.clone();
        match pipe.query_async::<_, Vec<Value>>(&mut conn).await {
            Ok(values) => Ok(values.into_iter().map(reply_from_value).collect()),
            Err(err) if is_server_reply(&err) => {
                warn!(error = %err, ops = ops.len(), "Pipeline reply carried an error");
                Ok(failed_replies(StoreError::from(err), ops.len()))
            }
            Err(err) => Err(StoreError::from(err)),
        }
    }

    async fn ping(&self) -> StoreResult<Duration> {
        let started = Instant::now();
        self.query::<String>(&redis::cmd("PING")).await?;
        Ok(started.elapsed())
    }
}
