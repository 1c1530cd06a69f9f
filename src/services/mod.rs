//! Resolution core: batch loading, event fan-out and subscriptions

pub mod context;
pub mod events;
pub mod loader;
pub mod subscriptions;

pub use context::{ContextFactory, ResolutionContext};
pub use events::{BackpressurePolicy, Event, EventBus, SubscriptionId, TopicFilter};
pub use loader::{BatchFn, BatchLoader, CachePolicy, LoadError, LoaderFactories, LoaderOptions, LoaderRegistry};
pub use subscriptions::{
    SubscribeRequest, SubscriptionDefaults, SubscriptionError, SubscriptionManager, Transport, TransportError,
};
