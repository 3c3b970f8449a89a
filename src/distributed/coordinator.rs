use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::bus::{BusMessage, EventBus};
use super::event::{DistributedEvent, EventType, EVENTS_CHANNEL, RESET_CHANNEL, SYNC_CHANNEL};
use crate::algorithms::Algorithm;
use crate::cache::LocalCache;
use crate::clock::SharedClock;
use crate::config::DistributedConfig;
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CoordinatorSnapshot {
    pub instance_id: String,
    pub active_instances: usize,
    pub peers: Vec<String>,
    pub drift_warnings: u64,
    pub last_drift_ms: u64,
    pub events_received: u64,
    pub publish_failures: u64,
}

#[derive(Debug)]
pub struct Coordinator {
    instance_id: String,
    config: DistributedConfig,
    bus: Arc<dyn EventBus>,
    clock: SharedClock,
    cache: Option<Arc<LocalCache>>,
    /// Peer instance id -> time its last heartbeat was received.
    peers: Mutex<HashMap<String, u64>>,
    drift_warnings: AtomicU64,
    last_drift_ms: AtomicU64,
    events_received: AtomicU64,
    publish_failures: AtomicU64,
    /// Publishes handed off by `publish_detached`, drained on shutdown.
    detached: Mutex<JoinSet<()>>,
}

impl Coordinator {
    pub fn new(
        config: DistributedConfig,
        bus: Arc<dyn EventBus>,
        clock: SharedClock,
        cache: Option<Arc<LocalCache>>,
    ) -> Self {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            instance_id,
            config,
            bus,
            clock,
            cache,
            peers: Mutex::new(HashMap::new()),
            drift_warnings: AtomicU64::new(0),
            last_drift_ms: AtomicU64::new(0),
            events_received: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
            detached: Mutex::new(JoinSet::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn live_peers(&self) -> Vec<String> {
        let now = self.clock.now_ms();
        let ttl = self.config.instance_ttl_ms();
        let Ok(mut peers) = self.peers.lock() else {
            return Vec::new();
        };
        peers.retain(|_, seen| now.saturating_sub(*seen) < ttl);
        let mut ids: Vec<String> = peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// This instance plus every peer heard from recently, never below the
    /// configured minimum.
    pub fn active_instance_count(&self) -> usize {
        (1 + self.live_peers().len()).max(self.config.min_instance_count)
    }

    /// This instance's share of `limit`.
    pub fn instance_limit(&self, limit: u64) -> u64 {
        limit.div_ceil(self.active_instance_count() as u64)
    }

    /// Publish an event. Failures are logged and never reach the caller.
    pub async fn publish(&self, event_type: EventType, payload: Value) {
        let event = DistributedEvent::new(
            &self.instance_id,
            event_type,
            self.clock.now_ms(),
            payload,
        );
        let encoded = match serde_json::to_string(&event) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(error = %e, "Failed to encode distributed event");
                return;
            }
        };

        if let Err(e) = self.bus.publish(event_type.channel(), encoded).await {
            self.publish_failures.fetch_add(1, Ordering::Relaxed);
            warn!(error = %e, event = ?event_type, "Failed to publish distributed event");
        }
    }

    /// Publish without making the caller wait.
    pub fn publish_detached(self: &Arc<Self>, event_type: EventType, payload: Value) {
        let coordinator = Arc::clone(self);
        let Ok(mut detached) = self.detached.lock() else {
            warn!(event = ?event_type, "Dropping distributed event, publish queue poisoned");
            return;
        };
        while detached.try_join_next().is_some() {}
        detached.spawn(async move {
            coordinator.publish(event_type, payload).await;
        });
    }

    pub fn publish_denied(
        self: &Arc<Self>,
        identifier: &str,
        limit: u64,
        window_ms: u64,
        algorithm: Algorithm,
    ) {
        self.publish_detached(
            EventType::Denied,
            json!({
                "identifier": identifier,
                "limit": limit,
                "windowMs": window_ms,
                "algorithm": algorithm,
            }),
        );
    }

    /// Wait for every detached publish still in flight.
    pub async fn drain(&self) {
        let mut pending = match self.detached.lock() {
            Ok(mut detached) => std::mem::take(&mut *detached),
            Err(_) => return,
        };
        while let Some(outcome) = pending.join_next().await {
            if let Err(e) = outcome {
                warn!(error = %e, "Detached publish ended abnormally");
            }
        }
    }

    pub async fn heartbeat(&self) {
        let active = self.active_instance_count();
        self.publish(EventType::Heartbeat, json!({ "activeInstances": active }))
            .await;
    }

    /// Apply one message received from the bus.
    pub fn handle_message(&self, message: &BusMessage) {
        let event: DistributedEvent = match serde_json::from_str(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "Ignoring malformed distributed event");
                return;
            }
        };
        if event.instance_id == self.instance_id {
            return;
        }
        self.events_received.fetch_add(1, Ordering::Relaxed);

        let now = self.clock.now_ms();
        match event.event_type {
            EventType::Heartbeat => {
                let drift = now.abs_diff(event.timestamp);
                if drift > self.config.max_drift_ms {
                    self.drift_warnings.fetch_add(1, Ordering::Relaxed);
                    self.last_drift_ms.store(drift, Ordering::Relaxed);
                    warn!(
                        peer = %event.instance_id,
                        drift_ms = drift,
                        max_drift_ms = self.config.max_drift_ms,
                        "Clock drift to peer exceeds tolerance"
                    );
                }
                if let Ok(mut peers) = self.peers.lock() {
                    if peers.insert(event.instance_id.clone(), now).is_none() {
                        info!(peer = %event.instance_id, "Discovered peer instance");
                    }
                }
            }
            EventType::Reset => {
                if let (Some(cache), Some(identifier)) = (&self.cache, event.identifier()) {
                    cache.invalidate_identifier(identifier);
                }
                debug!(peer = %event.instance_id, identifier = ?event.identifier(), "Peer reset");
            }
            EventType::Denied => {
                debug!(peer = %event.instance_id, identifier = ?event.identifier(), "Peer denied request");
            }
        }
    }

    /// Subscribe and run the heartbeat loop until `shutdown` flips.
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<JoinHandle<()>> {
        let mut subscription = self
            .bus
            .subscribe(&[SYNC_CHANNEL, RESET_CHANNEL, EVENTS_CHANNEL])
            .await?;
        info!(instance_id = %self.instance_id, "Distributed coordination started");

        let period = Duration::from_millis(self.config.sync_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => self.heartbeat().await,
                    message = subscription.recv() => match message {
                        Some(message) => self.handle_message(&message),
                        None => {
                            warn!("Event bus subscription closed");
                            break;
                        }
                    },
                }
            }
            info!(instance_id = %self.instance_id, "Distributed coordination stopped");
        });
        Ok(handle)
    }

    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let peers = self.live_peers();
        CoordinatorSnapshot {
            instance_id: self.instance_id.clone(),
            active_instances: (1 + peers.len()).max(self.config.min_instance_count),
            peers,
            drift_warnings: self.drift_warnings.load(Ordering::Relaxed),
            last_drift_ms: self.last_drift_ms.load(Ordering::Relaxed),
            events_received: self.events_received.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::FailurePolicy;
    use crate::clock::ManualClock;
    use crate::distributed::MemoryEventBus;
    use crate::result::RateLimitResult;

    fn coordinator(id: &str, clock: &ManualClock, cache: Option<Arc<LocalCache>>) -> Coordinator {
        let config = DistributedConfig {
            enabled: true,
            instance_id: Some(id.to_string()),
            sync_interval_ms: 1_000,
            max_drift_ms: 500,
            min_instance_count: 1,
            instance_ttl_ms: None,
        };
        Coordinator::new(config, Arc::new(MemoryEventBus::new()), Arc::new(clock.clone()), cache)
    }

    fn message(event: DistributedEvent) -> BusMessage {
        BusMessage {
            channel: event.event_type.channel().to_string(),
            payload: serde_json::to_string(&event).unwrap(),
        }
    }

    #[test]
    fn test_single_instance_gets_full_limit() {
        let clock = ManualClock::new(10_000);
        let coordinator = coordinator("a", &clock, None);
        assert_eq!(coordinator.active_instance_count(), 1);
        assert_eq!(coordinator.instance_limit(10), 10);
    }

    #[test]
    fn test_peers_split_limit_and_expire() {
        let clock = ManualClock::new(10_000);
        let coordinator = coordinator("a", &clock, None);
        for peer in ["b", "c"] {
            coordinator.handle_message(&message(DistributedEvent::new(
                peer,
                EventType::Heartbeat,
                10_000,
                Value::Null,
            )));
        }
        assert_eq!(coordinator.active_instance_count(), 3);
        assert_eq!(coordinator.instance_limit(10), 4);

        // Three missed heartbeats
        clock.advance(Duration::from_millis(3_000));
        assert_eq!(coordinator.active_instance_count(), 1);
    }

    #[test]
    fn test_own_events_are_ignored() {
        let clock = ManualClock::new(10_000);
        let coordinator = coordinator("a", &clock, None);
        coordinator.handle_message(&message(DistributedEvent::new(
            "a",
            EventType::Heartbeat,
            10_000,
            Value::Null,
        )));
        assert_eq!(coordinator.active_instance_count(), 1);
        assert_eq!(coordinator.snapshot().events_received, 0);
    }

    #[test]
    fn test_drift_is_counted_not_fatal() {
        let clock = ManualClock::new(10_000);
        let coordinator = coordinator("a", &clock, None);
        coordinator.handle_message(&message(DistributedEvent::new(
            "b",
            EventType::Heartbeat,
            12_000,
            Value::Null,
        )));
        let snapshot = coordinator.snapshot();
        assert_eq!(snapshot.drift_warnings, 1);
        assert_eq!(snapshot.last_drift_ms, 2_000);
        assert_eq!(snapshot.active_instances, 2);
    }

    #[test]
    fn test_reset_event_invalidates_cache() {
        let clock = ManualClock::new(10_000);
        let cache = Arc::new(LocalCache::new(10, 1_000, Arc::new(clock.clone())));
        let result = RateLimitResult::safe_default(
            FailurePolicy::FailOpen,
            Algorithm::SlidingWindow,
            10,
            60_000,
            10_000,
        );
        cache.insert("user:10:60000:sliding_window", "user", &result);

        let coordinator = coordinator("a", &clock, Some(cache.clone()));
        coordinator.handle_message(&message(DistributedEvent::new(
            "b",
            EventType::Reset,
            10_000,
            json!({ "identifier": "user" }),
        )));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_drain_waits_for_detached_publishes() {
        let clock = ManualClock::new(10_000);
        let bus = MemoryEventBus::new();
        let config = DistributedConfig {
            enabled: true,
            instance_id: Some("a".to_string()),
            ..DistributedConfig::default()
        };
        let coordinator = Arc::new(Coordinator::new(
            config,
            Arc::new(bus.clone()),
            Arc::new(clock),
            None,
        ));

        for i in 0..3 {
            coordinator.publish_denied(&format!("user:{}", i), 10, 1_000, Algorithm::FixedWindow);
        }
        coordinator.drain().await;
        assert_eq!(bus.published(), 3);
    }

    #[test]
    fn test_malformed_message_is_ignored() {
        let clock = ManualClock::new(10_000);
        let coordinator = coordinator("a", &clock, None);
        coordinator.handle_message(&BusMessage {
            channel: SYNC_CHANNEL.to_string(),
            payload: "not json".to_string(),
        });
        assert_eq!(coordinator.snapshot().events_received, 0);
    }
}
