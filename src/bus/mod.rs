//! In-process event bus
//!
//! Typed pub/sub between the pipeline/supervisor and the session hub.
//! One topic per event variant; every subscriber owns a bounded queue.
//! Publishing never blocks: a full queue drops that event for that
//! subscriber and bumps a per-(subscriber, topic) counter. Ordering per
//! topic and publisher is preserved as long as nothing is dropped.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::types::{NewMessageEvent, StatusEvent};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    NewMessage,
    Status,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::NewMessage => f.write_str("new_message"),
            Topic::Status => f.write_str("status"),
        }
    }
}

/// Closed union of everything the bus carries.
#[derive(Debug, Clone)]
pub enum BusEvent {
    NewMessage(NewMessageEvent),
    Status(StatusEvent),
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::NewMessage(_) => Topic::NewMessage,
            BusEvent::Status(_) => Topic::Status,
        }
    }
}

struct SubscriberSlot {
    label: String,
    topic: Topic,
    tx: flume::Sender<BusEvent>,
    dropped: Arc<AtomicU64>,
}

/// A subscriber's end of the bus: the receiving queue plus its drop counter.
pub struct Subscription {
    pub rx: flume::Receiver<BusEvent>,
    dropped: Arc<AtomicU64>,
}

impl Subscription {
    /// Events dropped for this subscriber because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<SubscriberSlot>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, label: &str, topic: Topic) -> Subscription {
        self.subscribe_with_capacity(label, topic, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, label: &str, topic: Topic, capacity: usize) -> Subscription {
        let (tx, rx) = flume::bounded(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        self.subscribers.lock().unwrap().push(SubscriberSlot {
            label: label.to_string(),
            topic,
            tx,
            dropped: dropped.clone(),
        });
        Subscription { rx, dropped }
    }

    /// Deliver an event to every subscriber of its topic. Never blocks.
    pub fn publish(&self, event: BusEvent) {
        let topic = event.topic();
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|slot| {
            if slot.topic != topic {
                return true;
            }
            match slot.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(_)) => {
                    slot.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(subscriber = %slot.label, %topic, "Subscriber queue full, event dropped");
                    true
                }
                // Receiver gone; prune the slot.
                Err(flume::TrySendError::Disconnected(_)) => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AgentState;
    use chrono::Utc;

    fn status_event(email: &str, state: AgentState) -> BusEvent {
        BusEvent::Status(StatusEvent {
            user_id: "u1".to_string(),
            email: email.to_string(),
            state,
            at: Utc::now(),
        })
    }

    #[test]
    fn delivers_in_publish_order() {
        let bus = EventBus::new();
        let sub = bus.subscribe("test", Topic::Status);

        bus.publish(status_event("a@x.com", AgentState::Starting));
        bus.publish(status_event("a@x.com", AgentState::Syncing));
        bus.publish(status_event("a@x.com", AgentState::Idle));

        let states: Vec<String> = sub
            .rx
            .drain()
            .map(|e| match e {
                BusEvent::Status(s) => s.state.label().to_string(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(states, ["starting", "syncing", "idle"]);
    }

    #[test]
    fn full_queue_drops_and_counts() {
        let bus = EventBus::new();
        let sub = bus.subscribe_with_capacity("slow", Topic::Status, 2);

        bus.publish(status_event("a@x.com", AgentState::Starting));
        bus.publish(status_event("a@x.com", AgentState::Syncing));
        bus.publish(status_event("a@x.com", AgentState::Idle));

        assert_eq!(sub.dropped(), 1);
        assert_eq!(sub.rx.len(), 2);
    }

    #[test]
    fn topics_are_independent() {
        let bus = EventBus::new();
        let status_sub = bus.subscribe("status", Topic::Status);
        let message_sub = bus.subscribe("messages", Topic::NewMessage);

        bus.publish(status_event("a@x.com", AgentState::Idle));

        assert_eq!(status_sub.rx.len(), 1);
        assert_eq!(message_sub.rx.len(), 0);
    }

    #[test]
    fn disconnected_subscribers_are_pruned() {
        let bus = EventBus::new();
        let sub = bus.subscribe("gone", Topic::Status);
        drop(sub);

        bus.publish(status_event("a@x.com", AgentState::Idle));
        assert!(bus.subscribers.lock().unwrap().is_empty());
    }
}
