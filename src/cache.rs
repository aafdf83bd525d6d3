use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::signature::{signature_for, QuerySignature};
use crate::store::{Document, DocumentStore, QuerySpec, StoreError, StoreSubscription};

/// Event fanned out to a subscriber: the latest full snapshot in store
/// order, or a store-side delivery error.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Snapshot(Arc<Vec<Document>>),
    Error(StoreError),
}

pub type ChangeCallback = dyn Fn(ChangeEvent) + Send + Sync;

/// Typed failure for cache operations.
#[derive(Debug, Clone, Serialize)]
pub struct CacheError {
    pub code: String,
    pub message: String,
}

impl CacheError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for CacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for CacheError {}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Snapshots older than this are not replayed on subscribe, and the
    /// sweep may drop zero-listener entries past this age.
    pub staleness_window: Duration,
    /// Entry cap enforced by [`SubscriptionCache::sweep`].
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            staleness_window: Duration::from_secs(300),
            max_entries: 50,
        }
    }
}

/// Point-in-time view of one cache entry, for diagnostics and tests.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntrySnapshot {
    pub signature: String,
    pub listener_count: usize,
    pub item_count: usize,
    pub errored: bool,
}

#[derive(Clone)]
struct ConsumerSlot {
    id: u64,
    callback: Arc<ChangeCallback>,
    active: Arc<AtomicBool>,
    last_version: Arc<AtomicU64>,
    // Serializes deliveries to one consumer so snapshot versions reach
    // the callback in strictly increasing order.
    delivery: Arc<Mutex<()>>,
}

impl ConsumerSlot {
    fn new(id: u64, callback: Arc<ChangeCallback>) -> Self {
        Self {
            id,
            callback,
            active: Arc::new(AtomicBool::new(true)),
            last_version: Arc::new(AtomicU64::new(0)),
            delivery: Arc::new(Mutex::new(())),
        }
    }
}

struct Entry {
    // Bumped whenever the underlying subscription is replaced; pushes
    // from a superseded subscription are dropped by epoch mismatch.
    epoch: u64,
    items: Arc<Vec<Document>>,
    has_data: bool,
    version: u64,
    last_updated: Instant,
    error: Option<StoreError>,
    consumers: Vec<ConsumerSlot>,
    // None when the store-side open itself failed (errored entry).
    store_sub: Option<Box<dyn StoreSubscription>>,
}

struct CacheState {
    entries: HashMap<QuerySignature, Entry>,
    shut_down: bool,
    next_consumer: u64,
    next_epoch: u64,
}

fn lock_state(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn deliver_to(slot: &ConsumerSlot, version: u64, event: ChangeEvent) {
    let _serialized = match slot.delivery.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if !slot.active.load(Ordering::Acquire) {
        return;
    }
    // Last write wins: a consumer never sees an older snapshot after a
    // newer one, regardless of which thread fans out first.
    let previous = slot.last_version.fetch_max(version, Ordering::AcqRel);
    if previous >= version {
        return;
    }
    (slot.callback)(event);
}

/// Process-wide coordinator mapping query signatures to live store
/// subscriptions. One underlying subscription per distinct signature,
/// shared by every attached consumer; warm snapshots replay
/// synchronously on subscribe; the entry is reclaimed the moment its
/// last consumer detaches.
///
/// Subscribe and unsubscribe serialize on one lock around listener
/// bookkeeping and the open/close of underlying subscriptions, so at
/// most one store subscription exists per signature at any instant.
/// Store implementations must therefore not call back into the cache
/// from `open`/`close`; pushes arrive after `open` returns.
///
/// Construct one instance per process (or per test) and inject it;
/// there is no hidden singleton. `shutdown` closes everything.
pub struct SubscriptionCache {
    store: Arc<dyn DocumentStore>,
    config: CacheConfig,
    state: Arc<Mutex<CacheState>>,
}

impl SubscriptionCache {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_config(store, CacheConfig::default())
    }

    pub fn with_config(store: Arc<dyn DocumentStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                shut_down: false,
                next_consumer: 1,
                next_epoch: 1,
            })),
        }
    }

    /// Attaches a consumer to the live query described by `query`.
    ///
    /// If a fresh, non-empty entry already exists its snapshot is
    /// delivered synchronously before this returns, so the consumer
    /// never renders a visible empty state. The listener count is
    /// incremented on every subscribe regardless of cache freshness.
    /// A store subscription is opened only when no live entry exists
    /// for the signature; an errored entry is retried from a clean
    /// underlying connection.
    ///
    /// Fails with `bad_query` on a malformed query and `cache_shut_down`
    /// after [`SubscriptionCache::shutdown`]. Store-side failures are
    /// not an error here: they surface on the consumer's error channel.
    pub fn subscribe<F>(
        &self,
        query: &QuerySpec,
        on_change: F,
    ) -> Result<SubscriptionHandle, CacheError>
    where
        F: Fn(ChangeEvent) + Send + Sync + 'static,
    {
        if query.collection.trim().is_empty() {
            return Err(CacheError::new("bad_query", "collection name is empty"));
        }
        if query.limit == Some(0) {
            return Err(CacheError::new("bad_query", "limit must be at least 1"));
        }

        let signature = signature_for(query);
        let callback: Arc<ChangeCallback> = Arc::new(on_change);

        enum Deliver {
            Nothing,
            Warm(Arc<Vec<Document>>, u64),
            OpenError(StoreError, Vec<ConsumerSlot>, u64),
        }

        let (slot, deliver) = {
            let mut st = lock_state(&self.state);
            if st.shut_down {
                return Err(CacheError::new("cache_shut_down", "cache has been shut down"));
            }
            let id = st.next_consumer;
            st.next_consumer += 1;
            // Reserved up front; goes unused when we attach to a live entry.
            let epoch = st.next_epoch;
            st.next_epoch += 1;
            let slot = ConsumerSlot::new(id, callback);

            let needs_open = match st.entries.get_mut(&signature) {
                Some(entry) if entry.error.is_none() => {
                    entry.consumers.push(slot.clone());
                    let fresh = entry.last_updated.elapsed() < self.config.staleness_window;
                    let deliver = if entry.has_data && fresh && !entry.items.is_empty() {
                        Deliver::Warm(entry.items.clone(), entry.version)
                    } else {
                        Deliver::Nothing
                    };
                    Some(deliver)
                }
                Some(entry) => {
                    // Errored entry: retry from a clean underlying
                    // connection, keeping already-attached consumers.
                    if let Some(mut dead) = entry.store_sub.take() {
                        dead.close();
                    }
                    entry.epoch = epoch;
                    entry.error = None;
                    entry.has_data = false;
                    entry.items = Arc::new(Vec::new());
                    entry.consumers.push(slot.clone());
                    None
                }
                None => {
                    st.entries.insert(
                        signature.clone(),
                        Entry {
                            epoch,
                            items: Arc::new(Vec::new()),
                            has_data: false,
                            version: 0,
                            last_updated: Instant::now(),
                            error: None,
                            consumers: vec![slot.clone()],
                            store_sub: None,
                        },
                    );
                    None
                }
            };

            let deliver = match needs_open {
                Some(deliver) => deliver,
                None => {
                    tracing::debug!(signature = %signature, "opening store subscription");
                    let push = Self::make_push(Arc::downgrade(&self.state), signature.clone(), epoch);
                    match self.store.open(query, push) {
                        Ok(sub) => {
                            if let Some(entry) = st.entries.get_mut(&signature) {
                                entry.store_sub = Some(sub);
                            }
                            Deliver::Nothing
                        }
                        Err(error) => {
                            if let Some(entry) = st.entries.get_mut(&signature) {
                                entry.error = Some(error.clone());
                                entry.version += 1;
                                Deliver::OpenError(error, entry.consumers.clone(), entry.version)
                            } else {
                                Deliver::Nothing
                            }
                        }
                    }
                }
            };
            (slot, deliver)
        };

        match deliver {
            Deliver::Nothing => {}
            Deliver::Warm(items, version) => {
                deliver_to(&slot, version, ChangeEvent::Snapshot(items));
            }
            Deliver::OpenError(error, consumers, version) => {
                tracing::warn!(signature = %signature, code = %error.code, "store subscription failed to open");
                for consumer in consumers {
                    deliver_to(&consumer, version, ChangeEvent::Error(error.clone()));
                }
            }
        }

        Ok(SubscriptionHandle {
            state: Arc::downgrade(&self.state),
            signature,
            consumer_id: slot.id,
            disposed: false,
        })
    }

    fn make_push(
        state: Weak<Mutex<CacheState>>,
        signature: QuerySignature,
        epoch: u64,
    ) -> crate::store::StorePush {
        Arc::new(move |batch: Result<Vec<Document>, StoreError>| {
            Self::on_push(&state, &signature, epoch, batch);
        })
    }

    fn on_push(
        state: &Weak<Mutex<CacheState>>,
        signature: &QuerySignature,
        epoch: u64,
        batch: Result<Vec<Document>, StoreError>,
    ) {
        let Some(state) = state.upgrade() else {
            return;
        };
        let (event, consumers, version) = {
            let mut st = lock_state(&state);
            let Some(entry) = st.entries.get_mut(signature) else {
                // Evicted while the push was in flight.
                return;
            };
            if entry.epoch != epoch {
                return;
            }
            entry.version += 1;
            entry.last_updated = Instant::now();
            let event = match batch {
                Ok(items) => {
                    entry.items = Arc::new(items);
                    entry.has_data = true;
                    entry.error = None;
                    ChangeEvent::Snapshot(entry.items.clone())
                }
                Err(error) => {
                    entry.error = Some(error.clone());
                    ChangeEvent::Error(error)
                }
            };
            (event, entry.consumers.clone(), entry.version)
        };

        if let ChangeEvent::Error(error) = &event {
            tracing::warn!(signature = %signature, code = %error.code, "store delivery error");
        }
        for slot in consumers {
            deliver_to(&slot, version, event.clone());
        }
    }

    /// Memory-pressure safeguard, not a correctness mechanism: evicts
    /// zero-listener entries that are stale, then the least recently
    /// updated zero-listener entries beyond the entry cap. Entries with
    /// listeners are never touched. Returns the number evicted.
    pub fn sweep(&self) -> usize {
        let mut st = lock_state(&self.state);
        let stale: Vec<QuerySignature> = st
            .entries
            .iter()
            .filter(|(_, e)| {
                e.consumers.is_empty()
                    && e.last_updated.elapsed() >= self.config.staleness_window
            })
            .map(|(sig, _)| sig.clone())
            .collect();
        let mut evicted = 0usize;
        for sig in &stale {
            if let Some(mut entry) = st.entries.remove(sig) {
                if let Some(mut sub) = entry.store_sub.take() {
                    sub.close();
                }
                evicted += 1;
            }
        }

        if st.entries.len() > self.config.max_entries {
            let mut idle: Vec<(QuerySignature, Instant)> = st
                .entries
                .iter()
                .filter(|(_, e)| e.consumers.is_empty())
                .map(|(sig, e)| (sig.clone(), e.last_updated))
                .collect();
            idle.sort_by_key(|(_, updated)| *updated);
            for (sig, _) in idle {
                if st.entries.len() <= self.config.max_entries {
                    break;
                }
                if let Some(mut entry) = st.entries.remove(&sig) {
                    if let Some(mut sub) = entry.store_sub.take() {
                        sub.close();
                    }
                    evicted += 1;
                }
            }
        }

        if evicted > 0 {
            tracing::debug!(evicted, "cache sweep evicted idle entries");
        }
        evicted
    }

    /// Closes every underlying subscription and clears the map. Further
    /// subscribes fail with `cache_shut_down`.
    pub fn shutdown(&self) {
        let mut st = lock_state(&self.state);
        st.shut_down = true;
        for (_, mut entry) in st.entries.drain() {
            for slot in &entry.consumers {
                slot.active.store(false, Ordering::Release);
            }
            if let Some(mut sub) = entry.store_sub.take() {
                sub.close();
            }
        }
    }

    pub fn entry_count(&self) -> usize {
        lock_state(&self.state).entries.len()
    }

    /// Listener count for the entry matching `query`, 0 when absent.
    pub fn listener_count(&self, query: &QuerySpec) -> usize {
        let signature = signature_for(query);
        lock_state(&self.state)
            .entries
            .get(&signature)
            .map(|e| e.consumers.len())
            .unwrap_or(0)
    }

    pub fn entries(&self) -> Vec<EntrySnapshot> {
        let st = lock_state(&self.state);
        st.entries
            .iter()
            .map(|(sig, e)| EntrySnapshot {
                signature: sig.as_hex().to_string(),
                listener_count: e.consumers.len(),
                item_count: e.items.len(),
                errored: e.error.is_some(),
            })
            .collect()
    }
}

impl Drop for SubscriptionCache {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Owned consumer registration returned by
/// [`SubscriptionCache::subscribe`]. Disposing it (explicitly or on
/// drop) is the only way the listener count decrements; a second
/// dispose is a no-op. After `unsubscribe` returns, no new delivery is
/// started for this consumer, including pushes already in flight; a
/// delivery that already passed its liveness check may still complete
/// concurrently.
pub struct SubscriptionHandle {
    state: Weak<Mutex<CacheState>>,
    signature: QuerySignature,
    consumer_id: u64,
    disposed: bool,
}

impl SubscriptionHandle {
    pub fn signature(&self) -> &QuerySignature {
        &self.signature
    }

    pub fn unsubscribe(mut self) {
        self.dispose();
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut evicted = false;
        {
            let mut st = lock_state(&state);
            let Some(entry) = st.entries.get_mut(&self.signature) else {
                return;
            };
            let Some(pos) = entry
                .consumers
                .iter()
                .position(|c| c.id == self.consumer_id)
            else {
                return;
            };
            let slot = entry.consumers.remove(pos);
            slot.active.store(false, Ordering::Release);
            if entry.consumers.is_empty() {
                if let Some(mut entry) = st.entries.remove(&self.signature) {
                    if let Some(mut sub) = entry.store_sub.take() {
                        sub.close();
                    }
                }
                evicted = true;
            }
        }
        if evicted {
            tracing::debug!(signature = %self.signature, "last consumer detached, entry evicted");
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}
