//! Per-request resolution context
//!
//! Every resolver gets exactly two capabilities: the request's loaders and the
//! ability to publish events. The context is created when a GraphQL request
//! arrives and disposed when its response has been produced. Subscription
//! events get a fresh context each, so nested fields of a pushed payload never
//! read from a cache older than the event.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::DropGuard;
use tracing::debug;

use crate::services::events::{EventBus, PublishReport};
use crate::services::loader::{BatchFn, BatchLoader, LoaderFactories, LoaderRegistry, RegistryError};

/// Creates a [`ResolutionContext`] per request.
#[derive(Clone)]
pub struct ContextFactory {
    factories: Arc<LoaderFactories>,
    bus: Arc<EventBus>,
}

impl ContextFactory {
    pub fn new(factories: LoaderFactories, bus: Arc<EventBus>) -> Self {
        Self {
            factories: Arc::new(factories),
            bus,
        }
    }

    pub fn create(&self) -> ResolutionContext {
        ResolutionContext::new(self.factories.clone(), self.bus.clone())
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }
}

#[derive(Clone)]
pub struct ResolutionContext {
    loaders: Arc<LoaderRegistry>,
    bus: Arc<EventBus>,
}

impl ResolutionContext {
    pub fn new(factories: Arc<LoaderFactories>, bus: Arc<EventBus>) -> Self {
        Self {
            loaders: Arc::new(LoaderRegistry::new(factories)),
            bus,
        }
    }

    pub fn loaders(&self) -> &LoaderRegistry {
        &self.loaders
    }

    /// Shorthand for `loaders().get(name)`
    pub fn loader<F: BatchFn>(&self, name: &str) -> Result<BatchLoader<F>, RegistryError> {
        self.loaders.get(name)
    }

    /// Publish `payload` on `topic`.
    pub fn publish<T: Serialize>(&self, topic: &str, payload: &T) -> Result<PublishReport, serde_json::Error> {
        let payload = serde_json::to_value(payload)?;
        let report = self.bus.publish(topic, payload);
        debug!(
            topic,
            sequence = report.sequence,
            delivered = report.delivered,
            "Published from resolver"
        );
        Ok(report)
    }

    /// Cancels this request's loaders when the guard is dropped.
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.loaders.cancel_on_drop()
    }

    pub fn cancel(&self) {
        self.loaders.cancel();
    }

    /// Release every request-scoped loader.
    pub fn dispose(&self) {
        self.loaders.dispose_all();
    }
}
