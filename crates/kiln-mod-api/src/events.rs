//! Event bus between mods and the host.
//!
//! Scripts publish through their capability API; the host and other
//! subscribers receive every event with the publishing mod attached.
//! Publishing never blocks: slow subscribers lag and lose the oldest events.

use chrono::{DateTime, Utc};
use kiln_runtime::ParamValue;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Events buffered per subscriber before lagging.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// An event published by a mod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModEvent {
    pub source_mod: String,
    pub name: String,
    pub payload: ParamValue,
    pub published_at: DateTime<Utc>,
}

impl ModEvent {
    pub fn new(source_mod: impl Into<String>, name: impl Into<String>, payload: ParamValue) -> Self {
        Self {
            source_mod: source_mod.into(),
            name: name.into(),
            payload,
            published_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ModEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to every current subscriber. Returns how many received it.
    pub fn publish(&self, event: ModEvent) -> usize {
        trace!(mod_id = %event.source_mod, event = %event.name, "Event published");
        // No subscribers is not an error.
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ModEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::default();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        let delivered = bus.publish(ModEvent::new("weather", "rain_started", ParamValue::Int(3)));
        assert_eq!(delivered, 2);

        let event = first.recv().await.unwrap();
        assert_eq!(event.source_mod, "weather");
        assert_eq!(event.name, "rain_started");
        assert_eq!(second.recv().await.unwrap().payload, ParamValue::Int(3));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.publish(ModEvent::new("m", "e", ParamValue::Null)), 0);
        assert_eq!(bus.subscriber_count(), 0);
    }
}
