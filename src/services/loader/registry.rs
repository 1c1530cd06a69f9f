//! Per-request loader registry
//!
//! [`LoaderFactories`] is built once at startup and describes every loader by
//! name. Each request gets its own [`LoaderRegistry`] from it, which creates
//! request-scoped loaders lazily and shares the process-wide ones.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

use super::{BatchFn, BatchLoader, CachePolicy, LoaderOptions, SharedSafe};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("no loader registered under '{0}'")]
    UnknownLoader(String),

    #[error("loader '{name}' is not backed by {expected}")]
    TypeMismatch { name: String, expected: &'static str },
}

/// Object-safe view of a [`BatchLoader`] so loaders of different key and value
/// types can live in one map.
trait ErasedLoader: Send + Sync {
    fn as_any(&self) -> &(dyn Any + Send + Sync);
    fn clear_all(&self);
}

impl<F: BatchFn> ErasedLoader for BatchLoader<F> {
    fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }

    fn clear_all(&self) {
        BatchLoader::clear_all(self);
    }
}

type Factory = Arc<dyn Fn(CancellationToken) -> Arc<dyn ErasedLoader> + Send + Sync>;

/// Named loader definitions shared by every request.
#[derive(Clone, Default)]
pub struct LoaderFactories {
    factories: HashMap<&'static str, Factory>,
    shared: HashMap<&'static str, Arc<dyn ErasedLoader>>,
}

impl LoaderFactories {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request-scoped loader. `make` builds a fresh batch function
    /// for every request that touches `name`.
    pub fn register<F, M>(mut self, name: &'static str, options: LoaderOptions, make: M) -> Self
    where
        F: BatchFn,
        M: Fn() -> F + Send + Sync + 'static,
    {
        let options = LoaderOptions {
            cache: CachePolicy::Request,
            ..options
        };
        let factory: Factory = Arc::new(move |cancel| {
            Arc::new(BatchLoader::with_cancellation(
                name,
                make(),
                options.clone(),
                cancel,
            ))
        });
        self.factories.insert(name, factory);
        self
    }

    /// Register a process-wide loader. Every request sees this same instance;
    /// it ignores request cancellation and survives [`LoaderRegistry::dispose_all`].
    pub fn register_shared<F: SharedSafe>(mut self, loader: BatchLoader<F>) -> Self {
        self.shared.insert(loader.name(), Arc::new(loader));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name) || self.shared.contains_key(name)
    }
}

/// Loaders for one request. Dropped (or disposed) when the request finishes.
pub struct LoaderRegistry {
    factories: Arc<LoaderFactories>,
    loaders: Mutex<HashMap<&'static str, Arc<dyn ErasedLoader>>>,
    cancel: CancellationToken,
}

impl LoaderRegistry {
    pub fn new(factories: Arc<LoaderFactories>) -> Self {
        Self {
            factories,
            loaders: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// The loader registered as `name`, created on first access.
    pub fn get<F: BatchFn>(&self, name: &str) -> Result<BatchLoader<F>, RegistryError> {
        if let Some(shared) = self.factories.shared.get(name) {
            return downcast::<F>(name, shared.as_ref());
        }

        let mut loaders = self.loaders.lock();
        if let Some(existing) = loaders.get(name) {
            return downcast::<F>(name, existing.as_ref());
        }

        let (&key, factory) = self
            .factories
            .factories
            .get_key_value(name)
            .ok_or_else(|| RegistryError::UnknownLoader(name.to_string()))?;
        let loader = factory(self.cancel.child_token());
        let typed = downcast::<F>(name, loader.as_ref())?;
        loaders.insert(key, loader);
        debug!(loader = key, "Created request-scoped loader");
        Ok(typed)
    }

    /// Cancel every request-scoped loader: pending loads reject with
    /// [`LoadError::Cancelled`](super::LoadError::Cancelled).
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Guard that cancels this registry when dropped unless disarmed.
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.cancel.clone().drop_guard()
    }

    /// Drop all request-scoped loaders and their caches. Process-wide loaders are untouched.
    pub fn dispose_all(&self) {
        let loaders: Vec<_> = self.loaders.lock().drain().collect();
        for (_, loader) in &loaders {
            loader.clear_all();
        }
        if !loaders.is_empty() {
            debug!(count = loaders.len(), "Disposed request-scoped loaders");
        }
    }

    /// Number of request-scoped loaders created so far
    pub fn active_count(&self) -> usize {
        self.loaders.lock().len()
    }
}

fn downcast<F: BatchFn>(name: &str, loader: &dyn ErasedLoader) -> Result<BatchLoader<F>, RegistryError> {
    loader
        .as_any()
        .downcast_ref::<BatchLoader<F>>()
        .cloned()
        .ok_or_else(|| RegistryError::TypeMismatch {
            name: name.to_string(),
            expected: std::any::type_name::<F>(),
        })
}
