//! Subscription manager: lifecycle, filtering and delivery of live events
//!
//! Each subscription gets a record on the [`EventBus`] and its own delivery task.
//! The task waits for the transport to report ready (Pending -> Active), then
//! pulls events from the record's bounded queue, shapes them with the
//! subscriber's transform and hands them to the transport. A slow transport
//! only ever blocks its own subscription; the bus applies the backpressure
//! policy once that subscription's queue is full.
//!
//! Failures are isolated per subscription. Transform errors skip one event and
//! are reported on the fault channel; transport errors and queue overflow close
//! the subscription and are passed to [`Transport::closed`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::services::events::{
    BackpressurePolicy, CloseReason, Event, EventBus, SubscriptionId, SubscriptionRecord,
    SubscriptionState, TopicFilter,
};

/// Error raised by a payload transform. Skips one event.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransformError(pub String);

impl From<serde_json::Error> for TransformError {
    fn from(e: serde_json::Error) -> Self {
        Self(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("subscriber disconnected")]
    Disconnected,
    #[error("transport error: {0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubscriptionError {
    #[error("subscription {id} closed: delivery queue overflowed (capacity {capacity})")]
    BackpressureOverflow { id: SubscriptionId, capacity: usize },

    #[error("subscription {id} skipped event {topic}#{sequence}: {cause}")]
    TransformFailure {
        id: SubscriptionId,
        topic: Arc<str>,
        sequence: u64,
        cause: Arc<str>,
    },

    #[error("subscription {id} transport failed: {cause}")]
    Transport { id: SubscriptionId, cause: Arc<str> },

    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),
}

impl SubscriptionError {
    /// Failure to hand to the subscriber for a close reason, if the close was a failure
    pub fn from_close(id: SubscriptionId, reason: &CloseReason) -> Option<Self> {
        match reason {
            CloseReason::BackpressureOverflow { capacity } => Some(Self::BackpressureOverflow {
                id,
                capacity: *capacity,
            }),
            CloseReason::TransportFailed(cause) => Some(Self::Transport {
                id,
                cause: cause.clone(),
            }),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BackpressureOverflow { .. } => "BACKPRESSURE_OVERFLOW",
            Self::TransformFailure { .. } => "TRANSFORM_FAILED",
            Self::Transport { .. } => "TRANSPORT_FAILED",
            Self::UnknownSubscription(_) => "UNKNOWN_SUBSCRIPTION",
        }
    }
}

/// Shapes a raw event payload into what the subscriber asked for.
pub type Transform<S> = Arc<dyn Fn(&Event) -> Result<S, TransformError> + Send + Sync>;

/// Delivers shaped payloads to one remote subscriber.
#[async_trait]
pub trait Transport<S: Send + 'static>: Send + Sync + 'static {
    /// Resolves once the underlying channel can carry events.
    async fn ready(&self, _id: SubscriptionId) -> Result<(), TransportError> {
        Ok(())
    }

    async fn deliver(&self, id: SubscriptionId, payload: S) -> Result<(), TransportError>;

    /// Called once, after the subscription reached Closed.
    async fn closed(&self, _id: SubscriptionId, _reason: &CloseReason) {}
}

/// What a client asks for when subscribing.
pub struct SubscribeRequest<S> {
    pub pattern: String,
    pub transform: Transform<S>,
    pub policy: Option<BackpressurePolicy>,
    pub capacity: Option<usize>,
}

impl<S> SubscribeRequest<S> {
    pub fn new<F>(pattern: impl Into<String>, transform: F) -> Self
    where
        F: Fn(&Event) -> Result<S, TransformError> + Send + Sync + 'static,
    {
        Self {
            pattern: pattern.into(),
            transform: Arc::new(transform),
            policy: None,
            capacity: None,
        }
    }

    pub fn policy(mut self, policy: Option<BackpressurePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn capacity(mut self, capacity: Option<usize>) -> Self {
        self.capacity = capacity;
        self
    }
}

/// Returned by [`SubscriptionManager::subscribe`]; pass back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

/// Entry on the fault channel.
#[derive(Debug, Clone)]
pub struct SubscriptionFault {
    pub error: SubscriptionError,
}

#[derive(Debug, Clone)]
pub struct SubscriptionDefaults {
    pub queue_capacity: usize,
    pub fault_channel_capacity: usize,
}

impl Default for SubscriptionDefaults {
    fn default() -> Self {
        Self {
            queue_capacity: 64,
            fault_channel_capacity: 256,
        }
    }
}

pub struct SubscriptionManager {
    bus: Arc<EventBus>,
    defaults: SubscriptionDefaults,
    records: Mutex<HashMap<SubscriptionId, Arc<SubscriptionRecord>>>,
    faults: broadcast::Sender<SubscriptionFault>,
}

impl SubscriptionManager {
    pub fn new(bus: Arc<EventBus>, defaults: SubscriptionDefaults) -> Arc<Self> {
        let (faults, _) = broadcast::channel(defaults.fault_channel_capacity.max(1));
        Arc::new(Self {
            bus,
            defaults,
            records: Mutex::new(HashMap::new()),
            faults,
        })
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Error-reporting channel for transform failures and forced closes.
    pub fn faults(&self) -> broadcast::Receiver<SubscriptionFault> {
        self.faults.subscribe()
    }

    /// Open a subscription delivering through `transport`.
    pub fn subscribe<S, T>(self: &Arc<Self>, request: SubscribeRequest<S>, transport: Arc<T>) -> SubscriptionHandle
    where
        S: Send + 'static,
        T: Transport<S>,
    {
        let filter = TopicFilter::parse(&request.pattern);
        let policy = request.policy.unwrap_or_else(|| filter.default_policy());
        let capacity = request.capacity.unwrap_or(self.defaults.queue_capacity);

        let record = self.bus.subscribe(filter, capacity, policy);
        let id = record.id();
        self.records.lock().insert(id, record.clone());

        let manager = Arc::clone(self);
        tokio::spawn(manager.run_delivery(record, request.transform, transport));

        SubscriptionHandle { id }
    }

    /// Open a subscription whose shaped payloads arrive on the returned stream.
    /// Dropping the stream counts as a client disconnect.
    pub fn subscribe_stream<S>(self: &Arc<Self>, request: SubscribeRequest<S>, buffer: usize) -> SubscriptionStream<S>
    where
        S: Send + 'static,
    {
        let (transport, rx) = ChannelTransport::new(buffer);
        let handle = self.subscribe(request, transport);
        SubscriptionStream {
            rx: ReceiverStream::new(rx),
            handle,
            manager: Arc::clone(self),
        }
    }

    /// Stop accepting events and flush what is queued, then close.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), SubscriptionError> {
        self.drain(handle.id, CloseReason::Unsubscribed)
    }

    /// Same as [`unsubscribe`](Self::unsubscribe), recording a client disconnect.
    pub fn disconnect(&self, id: SubscriptionId) -> Result<(), SubscriptionError> {
        self.drain(id, CloseReason::ClientDisconnected)
    }

    fn drain(&self, id: SubscriptionId, reason: CloseReason) -> Result<(), SubscriptionError> {
        let record = self
            .records
            .lock()
            .get(&id)
            .cloned()
            .ok_or(SubscriptionError::UnknownSubscription(id))?;
        self.bus.remove(id);
        if record.begin_drain(reason.clone()) {
            debug!(subscription = %id, reason = %reason, "Subscription draining");
        }
        Ok(())
    }

    /// Close every subscription immediately.
    pub fn shutdown(&self) {
        let records: Vec<_> = self.records.lock().values().cloned().collect();
        for record in &records {
            self.bus.remove(record.id());
            record.close(CloseReason::Shutdown);
        }
        info!(count = records.len(), "Closed all subscriptions");
    }

    /// Current state; `None` once the subscription is closed and discarded.
    pub fn state(&self, id: SubscriptionId) -> Option<SubscriptionState> {
        self.records.lock().get(&id).map(|record| record.state())
    }

    pub fn active_count(&self) -> usize {
        self.records.lock().len()
    }

    fn report(&self, error: SubscriptionError) {
        error!(code = error.code(), error = %error, "Subscription fault");
        let _ = self.faults.send(SubscriptionFault { error });
    }

    async fn run_delivery<S, T>(
        self: Arc<Self>,
        record: Arc<SubscriptionRecord>,
        transform: Transform<S>,
        transport: Arc<T>,
    ) where
        S: Send + 'static,
        T: Transport<S>,
    {
        let id = record.id();

        match transport.ready(id).await {
            Ok(()) => {
                if record.activate() {
                    debug!(subscription = %id, filter = %record.filter(), "Subscription active");
                }
            }
            Err(e) => {
                warn!(subscription = %id, error = %e, "Transport never became ready");
                record.close(CloseReason::TransportFailed(e.to_string().into()));
            }
        }

        while let Some(event) = record.next().await {
            let shaped = match transform(&event) {
                Ok(shaped) => shaped,
                Err(e) => {
                    self.report(SubscriptionError::TransformFailure {
                        id,
                        topic: event.topic.clone(),
                        sequence: event.sequence,
                        cause: e.0.into(),
                    });
                    continue;
                }
            };

            if let Err(e) = transport.deliver(id, shaped).await {
                debug!(subscription = %id, error = %e, "Delivery failed");
                let reason = match e {
                    TransportError::Disconnected => CloseReason::ClientDisconnected,
                    TransportError::Failed(cause) => CloseReason::TransportFailed(cause.into()),
                };
                record.close(reason);
                break;
            }
            record.mark_delivered(&event);
        }

        let reason = record.close(CloseReason::Unsubscribed);
        self.bus.remove(id);
        self.records.lock().remove(&id);

        if let Some(error) = SubscriptionError::from_close(id, &reason) {
            self.report(error);
        }
        transport.closed(id, &reason).await;

        info!(
            subscription = %id,
            reason = %reason,
            delivered = record.delivered(),
            dropped = record.dropped(),
            "Subscription closed"
        );
    }
}

/// Transport that forwards shaped payloads into a bounded channel.
pub struct ChannelTransport<S> {
    tx: mpsc::Sender<Result<S, SubscriptionError>>,
}

impl<S: Send + 'static> ChannelTransport<S> {
    pub fn new(buffer: usize) -> (Arc<Self>, mpsc::Receiver<Result<S, SubscriptionError>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl<S: Send + 'static> Transport<S> for ChannelTransport<S> {
    async fn deliver(&self, _id: SubscriptionId, payload: S) -> Result<(), TransportError> {
        self.tx
            .send(Ok(payload))
            .await
            .map_err(|_| TransportError::Disconnected)
    }

    async fn closed(&self, id: SubscriptionId, reason: &CloseReason) {
        if let Some(error) = SubscriptionError::from_close(id, reason) {
            let _ = self.tx.send(Err(error)).await;
        }
    }
}

/// Stream side of [`SubscriptionManager::subscribe_stream`].
pub struct SubscriptionStream<S> {
    rx: ReceiverStream<Result<S, SubscriptionError>>,
    handle: SubscriptionHandle,
    manager: Arc<SubscriptionManager>,
}

impl<S> SubscriptionStream<S> {
    pub fn handle(&self) -> SubscriptionHandle {
        self.handle
    }
}

impl<S> Stream for SubscriptionStream<S> {
    type Item = Result<S, SubscriptionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl<S> Drop for SubscriptionStream<S> {
    fn drop(&mut self) {
        // Already gone when the subscription closed on its own
        let _ = self.manager.disconnect(self.handle.id);
    }
}
