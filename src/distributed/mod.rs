//! Cross-instance coordination.
//!
//! Instances announce themselves with heartbeats on a shared event bus,
//! broadcast resets and denials, and split every limit evenly between the
//! instances currently alive.

mod bus;
mod coordinator;
mod event;

pub use bus::{BusMessage, EventBus, MemoryEventBus, RedisEventBus, Subscription};
pub use coordinator::{Coordinator, CoordinatorSnapshot};
pub use event::{DistributedEvent, EventType, EVENTS_CHANNEL, RESET_CHANNEL, SYNC_CHANNEL};
