//! Keyed batch loading for GraphQL field resolution
//!
//! A [`BatchLoader`] collects the keys requested by independently written
//! resolvers, deduplicates them, and hands them to a [`BatchFn`] as one ordered
//! batch once the current resolution pass has had a chance to register its keys.
//!
//! # Dispatch cycle
//!
//! 1. [`BatchLoader::load`] registers the key eagerly and returns a shared future.
//!    A second `load` of the same key returns a clone of that same future.
//! 2. The first `load` of a cycle spawns a flush task that waits for
//!    [`LoaderOptions::delay`] (or a single yield when the delay is zero).
//! 3. The flush drains the pending keys and dispatches them in sub-batches of at
//!    most [`LoaderOptions::max_batch_size`], sequentially.
//! 4. Results are matched to keys by position. Per-key failures settle only that
//!    key; a failing batch function rejects every key of that dispatch.
//!
//! Failed keys are evicted after settling so a later `load` retries them.

pub mod cache;
pub mod registry;

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use cache::TtlLruCache;
pub use registry::{LoaderFactories, LoaderRegistry, RegistryError};

/// Failure settled into a single key's future.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// The batch function failed for the whole dispatch.
    #[error("batch fetch failed: {0}")]
    BatchFetch(Arc<str>),

    /// This key failed while its siblings may have succeeded.
    #[error("failed to resolve key: {0}")]
    KeyResolution(Arc<str>),

    /// The key resolved to nothing. A specialised key failure.
    #[error("{entity} {key} not found")]
    NotFound { entity: &'static str, key: Arc<str> },

    /// The owning request was cancelled before the key settled.
    #[error("request cancelled before the value was loaded")]
    Cancelled,
}

impl LoadError {
    pub fn batch(cause: impl ToString) -> Self {
        Self::BatchFetch(cause.to_string().into())
    }

    pub fn key(cause: impl ToString) -> Self {
        Self::KeyResolution(cause.to_string().into())
    }

    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            entity,
            key: key.to_string().into(),
        }
    }

    /// Stable error code for API consumers
    pub fn code(&self) -> &'static str {
        match self {
            Self::BatchFetch(_) => "BATCH_FETCH_FAILED",
            Self::KeyResolution(_) => "KEY_RESOLUTION_FAILED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Cancelled => "CANCELLED",
        }
    }
}

/// Outcome for one key of a dispatch.
pub type KeyResult<V> = Result<V, LoadError>;

/// Future returned by [`BatchLoader::load`]. Cloning it shares the same computation.
pub type LoadFuture<V> = Shared<BoxFuture<'static, KeyResult<V>>>;

/// The bulk fetch behind a [`BatchLoader`].
///
/// `load` receives the distinct keys of one dispatch in request order and must
/// return exactly one result per key, in the same order. Returning `Err` fails
/// the whole dispatch.
#[async_trait]
pub trait BatchFn: Send + Sync + 'static {
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    async fn load(&self, keys: &[Self::Key]) -> anyhow::Result<Vec<KeyResult<Self::Value>>>;
}

/// Marker for batch functions whose values are identical for every viewer and
/// may therefore live in a process-wide cache.
pub trait SharedSafe: BatchFn {}

/// Where settled values are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Kept until the owning registry is disposed.
    Request,
    /// Kept process-wide with a TTL and least-recently-used eviction.
    Process { ttl: Duration, max_entries: usize },
}

#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Dispatches larger than this are split into sequential sub-batches
    pub max_batch_size: usize,
    /// How long the flush task waits for more keys before dispatching
    pub delay: Duration,
    pub cache: CachePolicy,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            delay: Duration::from_millis(1),
            cache: CachePolicy::Request,
        }
    }
}

impl LoaderOptions {
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_cache(mut self, cache: CachePolicy) -> Self {
        self.cache = cache;
        self
    }
}

#[derive(Clone)]
struct Slot<V> {
    ticket: u64,
    future: LoadFuture<V>,
}

struct LoaderState<K, V> {
    /// Keys awaiting dispatch, in first-request order
    pending: Vec<K>,
    pending_index: HashMap<K, Slot<V>>,
    dispatch_scheduled: bool,
    cache: HashMap<K, Slot<V>>,
    /// Settlement senders for pending and in-flight keys, by ticket
    waiters: HashMap<u64, oneshot::Sender<KeyResult<V>>>,
    next_ticket: u64,
}

impl<K, V> LoaderState<K, V> {
    fn ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }
}

struct LoaderInner<F: BatchFn> {
    name: &'static str,
    batch_fn: F,
    options: LoaderOptions,
    shared: Option<TtlLruCache<F::Key, F::Value>>,
    cancel: CancellationToken,
    state: Mutex<LoaderState<F::Key, F::Value>>,
}

/// Deduplicating, caching batch loader. Cheap to clone; clones share state.
pub struct BatchLoader<F: BatchFn> {
    inner: Arc<LoaderInner<F>>,
}

impl<F: BatchFn> Clone for BatchLoader<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: BatchFn> std::fmt::Debug for BatchLoader<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchLoader")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .field("cancelled", &self.inner.cancel.is_cancelled())
            .finish()
    }
}

fn settled<V: Clone + Send + Sync + 'static>(result: KeyResult<V>) -> LoadFuture<V> {
    future::ready(result).boxed().shared()
}

impl<F: BatchFn> BatchLoader<F> {
    /// Create a loader that is never cancelled.
    pub fn new(name: &'static str, batch_fn: F, options: LoaderOptions) -> Self {
        Self::with_cancellation(name, batch_fn, options, CancellationToken::new())
    }

    /// Create a loader whose pending and in-flight loads reject with
    /// [`LoadError::Cancelled`] once `cancel` fires.
    pub fn with_cancellation(
        name: &'static str,
        batch_fn: F,
        options: LoaderOptions,
        cancel: CancellationToken,
    ) -> Self {
        let shared = match options.cache {
            CachePolicy::Request => None,
            CachePolicy::Process { ttl, max_entries } => Some(TtlLruCache::new(ttl, max_entries)),
        };

        Self {
            inner: Arc::new(LoaderInner {
                name,
                batch_fn,
                options,
                shared,
                cancel,
                state: Mutex::new(LoaderState {
                    pending: Vec::new(),
                    pending_index: HashMap::new(),
                    dispatch_scheduled: false,
                    cache: HashMap::new(),
                    waiters: HashMap::new(),
                    next_ticket: 0,
                }),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Request one value. The key is registered immediately, not on first poll.
    pub fn load(&self, key: F::Key) -> LoadFuture<F::Value> {
        self.inner.load(key)
    }

    /// Request several values; the output is aligned with `keys`.
    pub fn load_many<I>(&self, keys: I) -> impl Future<Output = Vec<KeyResult<F::Value>>> + Send + 'static
    where
        I: IntoIterator<Item = F::Key>,
    {
        let futures: Vec<_> = keys.into_iter().map(|key| self.load(key)).collect();
        future::join_all(futures)
    }

    /// Seed the cache with a known value. Does nothing and returns `false` when
    /// the key is already cached or in flight.
    pub fn prime(&self, key: F::Key, value: F::Value) -> bool {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.cache.contains_key(&key) || state.pending_index.contains_key(&key) {
            return false;
        }

        if let Some(shared) = &inner.shared {
            if shared.get(&key).is_some() {
                return false;
            }
            shared.insert(key, value);
        } else {
            let ticket = state.ticket();
            state.cache.insert(
                key,
                Slot {
                    ticket,
                    future: settled(Ok(value)),
                },
            );
        }
        true
    }

    /// Evict one key. In-flight dispatches still settle their waiters.
    pub fn clear(&self, key: &F::Key) {
        self.inner.state.lock().cache.remove(key);
        if let Some(shared) = &self.inner.shared {
            shared.remove(key);
        }
    }

    /// Evict every key. In-flight dispatches still settle their waiters.
    pub fn clear_all(&self) {
        self.inner.state.lock().cache.clear();
        if let Some(shared) = &self.inner.shared {
            shared.clear();
        }
    }
}

impl<F: BatchFn> LoaderInner<F> {
    fn load(self: &Arc<Self>, key: F::Key) -> LoadFuture<F::Value> {
        if self.cancel.is_cancelled() {
            return settled(Err(LoadError::Cancelled));
        }

        if let Some(value) = self.shared.as_ref().and_then(|shared| shared.get(&key)) {
            return settled(Ok(value));
        }

        let mut state = self.state.lock();
        if let Some(slot) = state.cache.get(&key) {
            return slot.future.clone();
        }

        // Cleared while still pending: reattach to the pending computation
        if let Some(slot) = state.pending_index.get(&key).cloned() {
            let future = slot.future.clone();
            state.cache.insert(key, slot);
            return future;
        }

        let ticket = state.ticket();
        let (tx, rx) = oneshot::channel();
        let future = rx
            .map(|received| received.unwrap_or(Err(LoadError::Cancelled)))
            .boxed()
            .shared();
        let slot = Slot {
            ticket,
            future: future.clone(),
        };

        state.waiters.insert(ticket, tx);
        state.cache.insert(key.clone(), slot.clone());
        state.pending_index.insert(key.clone(), slot);
        state.pending.push(key);

        if !state.dispatch_scheduled {
            state.dispatch_scheduled = true;
            drop(state);
            self.schedule_flush();
        }

        future
    }

    fn schedule_flush(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let delay = inner.options.delay;
            tokio::select! {
                biased;
                _ = inner.cancel.cancelled() => {
                    inner.reject_all();
                    return;
                }
                _ = async {
                    if delay.is_zero() {
                        tokio::task::yield_now().await;
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                } => {}
            }
            inner.flush().await;
        });
    }

    async fn flush(&self) {
        let batch: Vec<(F::Key, u64)> = {
            let mut state = self.state.lock();
            state.dispatch_scheduled = false;
            let keys = std::mem::take(&mut state.pending);
            let mut batch = Vec::with_capacity(keys.len());
            for key in keys {
                if let Some(slot) = state.pending_index.remove(&key) {
                    batch.push((key, slot.ticket));
                }
            }
            batch
        };

        if batch.is_empty() {
            return;
        }

        let max = self.options.max_batch_size.max(1);
        if batch.len() > max {
            debug!(
                loader = self.name,
                keys = batch.len(),
                max_batch_size = max,
                "Splitting dispatch into sub-batches"
            );
        }

        for chunk in batch.chunks(max) {
            if self.cancel.is_cancelled() {
                self.reject_all();
                break;
            }
            self.dispatch(chunk.to_vec()).await;
        }
    }

    async fn dispatch(&self, batch: Vec<(F::Key, u64)>) {
        let keys: Vec<F::Key> = batch.iter().map(|(key, _)| key.clone()).collect();
        debug!(loader = self.name, batch_size = keys.len(), "Dispatching batch");

        let mut fetch = self.batch_fn.load(&keys);
        let outcome = tokio::select! {
            outcome = &mut fetch => outcome,
            _ = self.cancel.cancelled() => {
                self.reject_all();
                // Let the fetch finish, then drop what it returned
                let _ = fetch.await;
                debug!(loader = self.name, batch_size = keys.len(), "Discarded result of cancelled dispatch");
                return;
            }
        };

        self.settle(batch, outcome);
    }

    fn settle(&self, batch: Vec<(F::Key, u64)>, outcome: anyhow::Result<Vec<KeyResult<F::Value>>>) {
        let expected = batch.len();
        let results: Vec<KeyResult<F::Value>> = match outcome {
            Ok(values) if values.len() == expected => values,
            Ok(values) => {
                let error = LoadError::batch(format!(
                    "batch function returned {} results for {} keys",
                    values.len(),
                    expected
                ));
                warn!(loader = self.name, error = %error, "Misaligned batch result");
                vec![Err(error); expected]
            }
            Err(e) => {
                let error = LoadError::batch(format!("{e:#}"));
                warn!(loader = self.name, keys = expected, error = %error, "Batch fetch failed");
                vec![Err(error); expected]
            }
        };

        let mut state = self.state.lock();
        for ((key, ticket), result) in batch.into_iter().zip(results) {
            let is_current = state
                .cache
                .get(&key)
                .is_some_and(|slot| slot.ticket == ticket);

            // A key cleared (and maybe re-primed) since dispatch keeps its newer value
            match (&result, &self.shared) {
                (Ok(value), Some(shared)) => {
                    if is_current {
                        shared.insert(key.clone(), value.clone());
                        state.cache.remove(&key);
                    }
                }
                (Ok(_), None) => {}
                (Err(_), _) => {
                    if is_current {
                        state.cache.remove(&key);
                    }
                }
            }

            if let Some(tx) = state.waiters.remove(&ticket) {
                let _ = tx.send(result);
            }
        }
    }

    /// Reject every pending and in-flight key with [`LoadError::Cancelled`].
    fn reject_all(&self) {
        let mut state = self.state.lock();
        let waiters: HashMap<u64, _> = state.waiters.drain().collect();
        state.pending.clear();
        state.pending_index.clear();
        state.dispatch_scheduled = false;
        state.cache.retain(|_, slot| !waiters.contains_key(&slot.ticket));
        drop(state);

        if !waiters.is_empty() {
            debug!(loader = self.name, count = waiters.len(), "Cancelled outstanding loads");
        }
        for (_, tx) in waiters {
            let _ = tx.send(Err(LoadError::Cancelled));
        }
    }
}
