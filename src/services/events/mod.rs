//! In-process event bus keyed by topic
//!
//! `publish` stamps each event with the next per-topic sequence number and
//! pushes it, synchronously and under one lock, into every matching
//! subscription record in registration order. Delivery order per topic and
//! subscriber therefore equals publish order even with concurrent publishers.
//! Events published while nobody is subscribed are dropped.

pub mod record;
pub mod topics;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

pub use record::{BackpressurePolicy, CloseReason, PushOutcome, SubscriptionRecord, SubscriptionState};
pub use topics::TopicFilter;

/// Identifier of one subscription, unique per bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A published event. Immutable; cloning shares the payload.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: Arc<str>,
    /// Monotonic per topic, starting at 1
    pub sequence: u64,
    pub payload: Arc<serde_json::Value>,
    pub published_at: DateTime<Utc>,
}

/// What one publish did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub sequence: u64,
    /// Subscriptions that accepted the event
    pub delivered: usize,
    /// Subscriptions that had to evict an older event to accept it
    pub dropped_oldest: usize,
    /// Subscriptions closed because their queue overflowed
    pub disconnected: Vec<SubscriptionId>,
}

struct BusState {
    sequences: HashMap<Arc<str>, u64>,
    /// Registration order
    subscribers: Vec<Arc<SubscriptionRecord>>,
    next_id: u64,
}

pub struct EventBus {
    state: Mutex<BusState>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BusState {
                sequences: HashMap::new(),
                subscribers: Vec::new(),
                next_id: 0,
            }),
        }
    }

    /// Register a subscription record in the Pending state.
    pub fn subscribe(
        &self,
        filter: TopicFilter,
        capacity: usize,
        policy: BackpressurePolicy,
    ) -> Arc<SubscriptionRecord> {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = SubscriptionId::new(state.next_id);
        let record = Arc::new(SubscriptionRecord::new(id, filter, capacity, policy));
        state.subscribers.push(record.clone());
        debug!(
            subscription = %id,
            filter = %record.filter(),
            capacity = record.capacity(),
            policy = ?record.policy(),
            "Bus subscription registered"
        );
        record
    }

    /// Stop routing events to `id` and start draining it.
    pub fn unsubscribe(&self, id: SubscriptionId, reason: CloseReason) -> bool {
        match self.remove(id) {
            Some(record) => {
                record.begin_drain(reason);
                true
            }
            None => false,
        }
    }

    /// Detach a record from routing without touching its state.
    pub(crate) fn remove(&self, id: SubscriptionId) -> Option<Arc<SubscriptionRecord>> {
        let mut state = self.state.lock();
        let index = state.subscribers.iter().position(|r| r.id() == id)?;
        Some(state.subscribers.remove(index))
    }

    /// Publish `payload` on `topic`.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> PublishReport {
        let mut state = self.state.lock();

        let (topic, sequence) = match state.sequences.get_key_value(topic) {
            Some((key, &last)) => (key.clone(), last + 1),
            None => (Arc::<str>::from(topic), 1),
        };
        state.sequences.insert(topic.clone(), sequence);

        let event = Event {
            topic,
            sequence,
            payload: Arc::new(payload),
            published_at: Utc::now(),
        };

        let mut report = PublishReport {
            sequence,
            ..Default::default()
        };
        let mut matched = false;
        for record in state.subscribers.iter() {
            if !record.filter().matches(&event.topic) {
                continue;
            }
            matched = true;
            match record.push(event.clone()) {
                PushOutcome::Queued => report.delivered += 1,
                PushOutcome::DroppedOldest => {
                    report.delivered += 1;
                    report.dropped_oldest += 1;
                }
                PushOutcome::Overflow => report.disconnected.push(record.id()),
                PushOutcome::Rejected => {}
            }
        }

        // Nobody can have seen this topic's numbering, so it may restart at 1
        if !matched {
            state.sequences.remove(&event.topic);
        }

        if !report.disconnected.is_empty() {
            state
                .subscribers
                .retain(|record| !report.disconnected.contains(&record.id()));
            warn!(
                topic = %event.topic,
                sequence,
                disconnected = ?report.disconnected,
                "Disconnected subscribers on queue overflow"
            );
        }

        trace!(
            topic = %event.topic,
            sequence,
            delivered = report.delivered,
            "Event published"
        );
        report
    }

    /// Sequence number of the last event published on `topic`. `None` when
    /// that event reached no subscription.
    pub fn last_sequence(&self, topic: &str) -> Option<u64> {
        self.state.lock().sequences.get(topic).copied()
    }

    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }
}
