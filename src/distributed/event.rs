use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const SYNC_CHANNEL: &str = "ratelimit.sync";
pub const RESET_CHANNEL: &str = "ratelimit.reset";
pub const EVENTS_CHANNEL: &str = "ratelimit.events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Heartbeat,
    Reset,
    Denied,
}

impl EventType {
    pub fn channel(&self) -> &'static str {
        match self {
            EventType::Heartbeat => SYNC_CHANNEL,
            EventType::Reset => RESET_CHANNEL,
            EventType::Denied => EVENTS_CHANNEL,
        }
    }
}

/// Message exchanged between instances, JSON encoded on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedEvent {
    pub instance_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: u64,
    #[serde(default)]
    pub payload: Value,
}

impl DistributedEvent {
    pub fn new(instance_id: &str, event_type: EventType, timestamp: u64, payload: Value) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            event_type,
            timestamp,
            payload,
        }
    }

    /// Identifier carried by reset and denied events.
    pub fn identifier(&self) -> Option<&str> {
        self.payload.get("identifier").and_then(Value::as_str)
    }
}
