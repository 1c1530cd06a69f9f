//! Per-subscription delivery record: bounded queue plus lifecycle state
//!
//! The record is shared by the [`EventBus`](super::EventBus), which pushes into
//! it while publishing, and the delivery task that drains it. Queue contents and
//! state sit behind one lock so every transition is atomic with respect to
//! publishing.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::topics::TopicFilter;
use super::{Event, SubscriptionId};

/// What happens when a publish finds the delivery queue full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Evict the queue head to admit the new event
    DropOldest,
    /// Close the subscription
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Waiting for the transport to confirm it is ready
    Pending,
    /// Events are being delivered
    Active,
    /// No new events accepted; queued events still flushed
    Draining,
    /// Terminal
    Closed,
}

/// Why a subscription ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Unsubscribed,
    ClientDisconnected,
    BackpressureOverflow { capacity: usize },
    TransportFailed(Arc<str>),
    Shutdown,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unsubscribed => f.write_str("unsubscribed"),
            Self::ClientDisconnected => f.write_str("client disconnected"),
            Self::BackpressureOverflow { capacity } => {
                write!(f, "delivery queue overflowed (capacity {capacity})")
            }
            Self::TransportFailed(cause) => write!(f, "transport failed: {cause}"),
            Self::Shutdown => f.write_str("server shutting down"),
        }
    }
}

/// Result of offering one event to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest queued event
    DroppedOldest,
    /// Queue was full under [`BackpressurePolicy::Disconnect`]; the record is now closed
    Overflow,
    /// The record is draining or closed
    Rejected,
}

struct RecordState {
    state: SubscriptionState,
    queue: VecDeque<Event>,
    /// Topic and sequence of the last delivered event
    cursor: Option<(Arc<str>, u64)>,
    delivered: u64,
    dropped: u64,
    close_reason: Option<CloseReason>,
}

pub struct SubscriptionRecord {
    id: SubscriptionId,
    filter: TopicFilter,
    capacity: usize,
    policy: BackpressurePolicy,
    inner: Mutex<RecordState>,
    notify: Notify,
}

impl SubscriptionRecord {
    pub(super) fn new(
        id: SubscriptionId,
        filter: TopicFilter,
        capacity: usize,
        policy: BackpressurePolicy,
    ) -> Self {
        let capacity = capacity.max(1);
        Self {
            id,
            filter,
            capacity,
            policy,
            inner: Mutex::new(RecordState {
                state: SubscriptionState::Pending,
                queue: VecDeque::with_capacity(capacity),
                cursor: None,
                delivered: 0,
                dropped: 0,
                close_reason: None,
            }),
            notify: Notify::new(),
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn filter(&self) -> &TopicFilter {
        &self.filter
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner.lock().state
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.lock().close_reason.clone()
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn delivered(&self) -> u64 {
        self.inner.lock().delivered
    }

    pub fn dropped(&self) -> u64 {
        self.inner.lock().dropped
    }

    /// Topic and sequence of the last delivered event
    pub fn cursor(&self) -> Option<(Arc<str>, u64)> {
        self.inner.lock().cursor.clone()
    }

    /// Offer an event, applying the backpressure policy when the queue is full.
    pub fn push(&self, event: Event) -> PushOutcome {
        let mut inner = self.inner.lock();
        match inner.state {
            SubscriptionState::Pending | SubscriptionState::Active => {}
            SubscriptionState::Draining | SubscriptionState::Closed => return PushOutcome::Rejected,
        }

        let outcome = if inner.queue.len() < self.capacity {
            inner.queue.push_back(event);
            PushOutcome::Queued
        } else {
            match self.policy {
                BackpressurePolicy::DropOldest => {
                    inner.queue.pop_front();
                    inner.queue.push_back(event);
                    inner.dropped += 1;
                    PushOutcome::DroppedOldest
                }
                BackpressurePolicy::Disconnect => {
                    inner.state = SubscriptionState::Closed;
                    inner.queue.clear();
                    inner.close_reason = Some(CloseReason::BackpressureOverflow {
                        capacity: self.capacity,
                    });
                    PushOutcome::Overflow
                }
            }
        };
        drop(inner);

        self.notify.notify_one();
        outcome
    }

    /// Pending -> Active. Returns false from any other state.
    pub fn activate(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.state != SubscriptionState::Pending {
            return false;
        }
        inner.state = SubscriptionState::Active;
        true
    }

    /// Pending/Active -> Draining. Returns false when already draining or closed.
    pub fn begin_drain(&self, reason: CloseReason) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            SubscriptionState::Pending | SubscriptionState::Active => {
                inner.state = SubscriptionState::Draining;
                inner.close_reason.get_or_insert(reason);
            }
            SubscriptionState::Draining | SubscriptionState::Closed => return false,
        }
        drop(inner);

        self.notify.notify_one();
        true
    }

    /// Any state -> Closed, discarding queued events. Keeps an earlier close reason.
    /// Returns the effective reason.
    pub fn close(&self, reason: CloseReason) -> CloseReason {
        let mut inner = self.inner.lock();
        inner.state = SubscriptionState::Closed;
        inner.queue.clear();
        let reason = inner.close_reason.get_or_insert(reason).clone();
        drop(inner);

        self.notify.notify_one();
        reason
    }

    /// Next queued event. `None` once closed, or once draining with an empty queue.
    pub async fn next(&self) -> Option<Event> {
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.state == SubscriptionState::Closed {
                    return None;
                }
                if let Some(event) = inner.queue.pop_front() {
                    return Some(event);
                }
                if inner.state == SubscriptionState::Draining {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Advance the delivery cursor past `event`.
    pub fn mark_delivered(&self, event: &Event) {
        let mut inner = self.inner.lock();
        inner.delivered += 1;
        inner.cursor = Some((event.topic.clone(), event.sequence));
    }
}

impl std::fmt::Debug for SubscriptionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SubscriptionRecord")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("state", &inner.state)
            .field("queued", &inner.queue.len())
            .finish()
    }
}
