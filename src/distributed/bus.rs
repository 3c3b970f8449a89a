use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::Client;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::{StoreError, StoreResult};

const SUBSCRIPTION_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

/// Messages from subscribed channels. Dropping it stops delivery.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::Receiver<BusMessage>,
    forwarder: JoinHandle<()>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

/// Publish/subscribe channel shared by all instances.
#[async_trait]
pub trait EventBus: Send + Sync + Debug {
    async fn publish(&self, channel: &str, payload: String) -> StoreResult<()>;

    async fn subscribe(&self, channels: &[&str]) -> StoreResult<Subscription>;
}

/// Redis pub/sub.
#[derive(Clone)]
pub struct RedisEventBus {
    client: Client,
    publisher: ConnectionManager,
}

impl Debug for RedisEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisEventBus")
            .field("server", &self.client.get_connection_info().addr)
            .finish()
    }
}

impl RedisEventBus {
    pub fn new(client: Client, publisher: ConnectionManager) -> Self {
        Self { client, publisher }
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, channel: &str, payload: String) -> StoreResult<()> {
        let mut conn = self.publisher.clone();
        redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async::<_, i64>(&mut conn)
            .await
            .map(|_| ())
            .map_err(StoreError::from)
    }

    async fn subscribe(&self, channels: &[&str]) -> StoreResult<Subscription> {
        // Subscribed connections cannot run other commands, so this one is dedicated
        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        for channel in channels {
            pubsub.subscribe(*channel).await?;
        }

        let (tx, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let forwarder = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable pub/sub message");
                        continue;
                    }
                };
                let message = BusMessage {
                    channel: msg.get_channel_name().to_string(),
                    payload,
                };
                if tx.send(message).await.is_err() {
                    break;
                }
            }
            debug!("Pub/sub forwarder stopped");
        });

        Ok(Subscription {
            receiver,
            forwarder,
        })
    }
}

/// In-process bus; clones share the same channels.
#[derive(Debug, Clone)]
pub struct MemoryEventBus {
    sender: broadcast::Sender<BusMessage>,
    published: Arc<AtomicU64>,
}

impl Default for MemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1_024);
        Self {
            sender,
            published: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventBus for MemoryEventBus {
    async fn publish(&self, channel: &str, payload: String) -> StoreResult<()> {
        self.published.fetch_add(1, Ordering::SeqCst);
        // Like Redis, a message with no subscribers is simply lost
        let _ = self.sender.send(BusMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> StoreResult<Subscription> {
        let wanted: Vec<String> = channels.iter().map(|c| c.to_string()).collect();
        let mut source = self.sender.subscribe();
        let (tx, receiver) = mpsc::channel(SUBSCRIPTION_BUFFER);

        let forwarder = tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(message) if wanted.contains(&message.channel) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Event bus subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription {
            receiver,
            forwarder,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_memory_bus_filters_channels() {
        let bus = MemoryEventBus::new();
        let mut sub = bus.subscribe(&["a"]).await.unwrap();

        bus.publish("b", "ignored".into()).await.unwrap();
        bus.publish("a", "hello".into()).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg, BusMessage { channel: "a".into(), payload: "hello".into() });
        assert_eq!(bus.published(), 2);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_succeeds() {
        let bus = MemoryEventBus::new();
        assert!(bus.publish("a", "x".into()).await.is_ok());
    }
}
