//! Coalescing of identical concurrent checks.
//!
//! The first caller for a key becomes the leader and goes to the store.
//! Callers arriving while it is in flight wait for its result, up to a
//! timeout after which they go to the store themselves.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::result::RateLimitResult;

#[derive(Debug)]
pub struct SingleFlight {
    inflight: Mutex<HashMap<String, broadcast::Sender<RateLimitResult>>>,
    wait_timeout: Duration,
}

pub enum Flight<'a> {
    Leader(FlightGuard<'a>),
    Follower(broadcast::Receiver<RateLimitResult>),
}

/// Held by the leader. Completing it wakes the followers; dropping it
/// without completing releases them to run on their own. Either way only
/// the leader's own entry is removed.
pub struct FlightGuard<'a> {
    owner: &'a SingleFlight,
    key: String,
    sender: Option<broadcast::Sender<RateLimitResult>>,
}

impl FlightGuard<'_> {
    pub fn complete(mut self, result: &RateLimitResult) {
        if let Some(sender) = self.sender.take() {
            self.owner.release(&self.key, &sender);
            // No receivers is fine
            let _ = sender.send(result.clone());
        }
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            self.owner.release(&self.key, &sender);
        }
    }
}

impl SingleFlight {
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
            wait_timeout,
        }
    }

    pub fn join(&self, key: &str) -> Flight<'_> {
        let mut inflight = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(sender) = inflight.get(key) {
            return Flight::Follower(sender.subscribe());
        }

        let (sender, _) = broadcast::channel(1);
        inflight.insert(key.to_string(), sender.clone());
        Flight::Leader(FlightGuard {
            owner: self,
            key: key.to_string(),
            sender: Some(sender),
        })
    }

    /// The leader's result, or `None` if it failed or took too long.
    pub async fn wait(&self, mut receiver: broadcast::Receiver<RateLimitResult>) -> Option<RateLimitResult> {
        match timeout(self.wait_timeout, receiver.recv()).await {
            Ok(Ok(result)) => Some(result),
            _ => None,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inflight.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Remove `key` if it still belongs to `sender`.
    fn release(&self, key: &str, sender: &broadcast::Sender<RateLimitResult>) {
        let mut inflight = match self.inflight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if inflight
            .get(key)
            .is_some_and(|current| current.same_channel(sender))
        {
            inflight.remove(key);
        }
    }
}
