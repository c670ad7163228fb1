// Query cache store.
// Holds query results in memory with stale-while-revalidate, invalidation and cancellation.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::connectivity::Connectivity;
use crate::error::{Result, SyncError};

use super::entry::{CacheEntry, EntryPolicy, FetchStatus};
use super::key::QueryKey;

/// Loads the data for a key, usually through the transport.
pub type Loader = Arc<dyn Fn(QueryKey) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Wrap an async closure as a [`Loader`].
pub fn loader<F, Fut>(f: F) -> Loader
where
    F: Fn(QueryKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |key| f(key).boxed())
}

/// A key bound to the loader that produces its data.
#[derive(Clone)]
pub struct Query {
    key: QueryKey,
    loader: Loader,
    policy: Option<EntryPolicy>,
}

impl Query {
    pub fn new(key: QueryKey, loader: Loader) -> Self {
        Self {
            key,
            loader,
            policy: None,
        }
    }

    /// Override the cache-wide freshness and retention windows for this key.
    pub fn with_policy(mut self, policy: EntryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.key)
            .field("policy", &self.policy)
            .finish()
    }
}

struct Slot {
    entry: CacheEntry,
    /// Bumped whenever a fetch starts or is cancelled; a load only lands if
    /// the generation it started with is still current.
    generation: u64,
    loader: Option<Loader>,
    task: Option<JoinHandle<()>>,
    observers: usize,
    last_touched: Instant,
    tx: watch::Sender<Option<CacheEntry>>,
}

impl Slot {
    fn new(key: QueryKey, policy: EntryPolicy, now: Instant) -> Self {
        let entry = CacheEntry::empty(key, policy);
        let (tx, _rx) = watch::channel(Some(entry.clone()));
        Self {
            entry,
            generation: 0,
            loader: None,
            task: None,
            observers: 0,
            last_touched: now,
            tx,
        }
    }

    fn bind(&mut self, query: &Query, now: Instant) {
        self.loader = Some(query.loader.clone());
        if let Some(policy) = query.policy {
            self.entry.stale_after = policy.stale_after;
            self.entry.evict_after = policy.evict_after;
        }
        self.last_touched = now;
    }

    fn notify(&self) {
        self.tx.send_replace(Some(self.entry.clone()));
    }

    /// Abort the running load, if any. The entry keeps whatever data it had.
    fn cancel(&mut self) -> bool {
        let Some(task) = self.task.take() else {
            return false;
        };
        task.abort();
        self.generation += 1;
        if self.entry.status == FetchStatus::Fetching {
            self.entry.status = FetchStatus::Idle;
        }
        true
    }

    fn is_evictable(&self, now: Instant) -> bool {
        self.observers == 0
            && self.task.is_none()
            && now.saturating_duration_since(self.last_touched) >= self.entry.evict_after
    }

    fn close(mut self) -> CacheEntry {
        self.cancel();
        self.tx.send_replace(None);
        self.entry
    }
}

#[derive(Default)]
struct Inner {
    slots: HashMap<QueryKey, Slot>,
}

impl Inner {
    fn slot(&mut self, key: &QueryKey, policy: EntryPolicy, now: Instant) -> &mut Slot {
        // Drop an entry whose retention lapsed so it reads as a miss.
        if self.slots.get(key).is_some_and(|slot| slot.is_evictable(now)) {
            if let Some(slot) = self.slots.remove(key) {
                tracing::debug!(key = %key, "Evicting expired entry on access");
                slot.close();
            }
        }
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Slot::new(key.clone(), policy, now))
    }
}

/// Shared query cache. Cloning yields another handle to the same store.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Mutex<Inner>>,
    connectivity: Connectivity,
    policy: EntryPolicy,
}

impl QueryCache {
    pub fn new(policy: EntryPolicy, connectivity: Connectivity) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            connectivity,
            policy,
        }
    }

    pub fn policy(&self) -> EntryPolicy {
        self.policy
    }

    /// Serve the cached entry, starting a background load on a miss or when stale.
    ///
    /// Returns `None` on a miss. Stale data is returned as-is while the refetch
    /// runs. Offline, nothing is fetched and the last known data is served.
    pub fn read(&self, query: &Query) -> Option<CacheEntry> {
        let now = Instant::now();
        let mut inner = self.lock();
        let slot = inner.slot(&query.key, self.policy, now);
        slot.bind(query, now);
        if slot.entry.is_stale_at(now) {
            self.start_fetch(slot, false);
        }
        slot.entry.data.is_some().then(|| slot.entry.clone())
    }

    /// Read-through: return fresh data, or wait for a load to settle.
    pub async fn fetch(&self, query: &Query) -> Result<Value> {
        let mut rx = {
            let now = Instant::now();
            let mut inner = self.lock();
            let slot = inner.slot(&query.key, self.policy, now);
            slot.bind(query, now);

            if !slot.entry.is_stale_at(now) {
                if let Some(data) = &slot.entry.data {
                    return Ok(data.clone());
                }
            }
            if !self.connectivity.is_online() {
                return slot.entry.data.clone().ok_or(SyncError::NetworkUnavailable);
            }
            self.start_fetch(slot, false);
            slot.tx.subscribe()
        };

        let settled = rx
            .wait_for(|entry| entry.as_ref().is_none_or(|e| !e.is_fetching()))
            .await;
        let Ok(settled) = settled else {
            return Err(SyncError::CacheMiss);
        };
        match settled.as_ref() {
            None => Err(SyncError::CacheMiss),
            Some(entry) if entry.status == FetchStatus::Error => {
                Err(entry.last_error.clone().unwrap_or(SyncError::CacheMiss))
            }
            Some(entry) => entry.data.clone().ok_or(SyncError::CacheMiss),
        }
    }

    /// Current entry without side effects.
    pub fn peek(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.lock().slots.get(key).map(|slot| slot.entry.clone())
    }

    /// Current data without side effects.
    pub fn data(&self, key: &QueryKey) -> Option<Value> {
        self.lock()
            .slots
            .get(key)
            .and_then(|slot| slot.entry.data.clone())
    }

    /// Replace the data for a key. Does not cancel a running load.
    pub fn write(&self, key: &QueryKey, data: Value) {
        self.set_data(key, Some(data));
    }

    /// Replace the data for a key, or clear it back to a miss with `None`.
    pub fn set_data(&self, key: &QueryKey, data: Option<Value>) {
        let now = Instant::now();
        let mut inner = self.lock();
        let slot = inner.slot(key, self.policy, now);
        slot.entry.fetched_at = data.as_ref().map(|_| now);
        slot.entry.data = data;
        slot.entry.invalidated = false;
        slot.last_touched = now;
        slot.notify();
    }

    /// Put back an entry captured with [`peek`](Self::peek), freshness included.
    /// `None` clears the key to a miss. An observed entry that comes back stale
    /// is refetched.
    pub fn restore(&self, key: &QueryKey, prior: Option<CacheEntry>) {
        let Some(prior) = prior else {
            self.set_data(key, None);
            return;
        };
        let now = Instant::now();
        let mut inner = self.lock();
        let slot = inner.slot(key, self.policy, now);
        slot.entry.data = prior.data;
        slot.entry.fetched_at = prior.fetched_at;
        slot.entry.invalidated = prior.invalidated;
        slot.entry.last_error = prior.last_error;
        if slot.entry.status != FetchStatus::Fetching {
            slot.entry.status = match prior.status {
                FetchStatus::Fetching => FetchStatus::Idle,
                status => status,
            };
        }
        slot.last_touched = now;
        slot.notify();
        if slot.observers > 0 && slot.entry.is_stale_at(now) {
            self.start_fetch(slot, false);
        }
    }

    /// Mark every entry under `prefix` stale. Observed entries refetch now,
    /// restarting any load already running; the rest refetch on next read.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let mut inner = self.lock();
        let mut count = 0;
        for (key, slot) in inner.slots.iter_mut() {
            if !key.starts_with(prefix) {
                continue;
            }
            count += 1;
            slot.entry.invalidated = true;
            if slot.observers > 0 {
                self.start_fetch(slot, true);
            } else {
                slot.notify();
            }
        }
        tracing::debug!(prefix = %prefix, count, "Invalidated entries");
        count
    }

    /// Refetch every observed entry that went stale, typically after reconnecting.
    pub fn revalidate_observed(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let mut count = 0;
        for slot in inner.slots.values_mut() {
            if slot.observers > 0 && slot.task.is_none() && slot.entry.is_stale_at(now) {
                self.start_fetch(slot, false);
                count += 1;
            }
        }
        if count > 0 {
            tracing::debug!(count, "Revalidating observed entries");
        }
        count
    }

    /// Abort running loads under `prefix`; their results will never land.
    pub fn cancel_in_flight(&self, prefix: &QueryKey) -> usize {
        let mut inner = self.lock();
        let mut count = 0;
        for (key, slot) in inner.slots.iter_mut() {
            if key.starts_with(prefix) && slot.cancel() {
                count += 1;
                slot.notify();
            }
        }
        if count > 0 {
            tracing::debug!(prefix = %prefix, count, "Cancelled in-flight loads");
        }
        count
    }

    /// Observe a key. The entry is loaded if needed, kept alive while the
    /// subscription exists, and refetched immediately when invalidated.
    pub fn subscribe(&self, query: &Query) -> Subscription {
        let now = Instant::now();
        let mut inner = self.lock();
        let slot = inner.slot(&query.key, self.policy, now);
        slot.bind(query, now);
        slot.observers += 1;
        if slot.entry.is_stale_at(now) {
            self.start_fetch(slot, false);
        }
        Subscription {
            key: query.key.clone(),
            rx: slot.tx.subscribe(),
            cache: Arc::downgrade(&self.inner),
        }
    }

    pub fn remove(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.lock().slots.remove(key).map(Slot::close)
    }

    /// Drop every entry and abort every load (logout).
    pub fn clear(&self) {
        let mut inner = self.lock();
        let count = inner.slots.len();
        for (_, slot) in inner.slots.drain() {
            slot.close();
        }
        tracing::info!(count, "Cleared query cache");
    }

    /// Remove unobserved entries whose retention window has lapsed.
    pub fn collect_garbage(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.lock();
        let expired: Vec<QueryKey> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_evictable(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(slot) = inner.slots.remove(key) {
                slot.close();
            }
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "Evicted unobserved entries");
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    pub fn observer_count(&self, key: &QueryKey) -> usize {
        self.lock().slots.get(key).map_or(0, |slot| slot.observers)
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn start_fetch(&self, slot: &mut Slot, restart: bool) {
        if slot.task.is_some() {
            if !restart {
                return;
            }
            slot.cancel();
        }
        if !self.connectivity.is_online() {
            tracing::debug!(key = %slot.entry.key, "Offline, serving cached data");
            return;
        }
        let Some(loader) = slot.loader.clone() else {
            return;
        };

        slot.generation += 1;
        let generation = slot.generation;
        slot.entry.status = FetchStatus::Fetching;
        slot.notify();

        let key = slot.entry.key.clone();
        tracing::debug!(key = %key, generation, "Starting load");
        let load = loader(key.clone());
        let cache = Arc::downgrade(&self.inner);
        slot.task = Some(tokio::spawn(async move {
            let result = load.await;
            if let Some(inner) = cache.upgrade() {
                settle(&inner, &key, generation, result);
            }
        }));
    }
}

/// Apply a finished load, unless it was cancelled or superseded.
fn settle(inner: &Mutex<Inner>, key: &QueryKey, generation: u64, result: Result<Value>) {
    let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
    let Some(slot) = inner.slots.get_mut(key) else {
        return;
    };
    if slot.generation != generation {
        tracing::debug!(key = %key, generation, "Discarding superseded load");
        return;
    }

    let now = Instant::now();
    slot.task = None;
    match result {
        Ok(data) => {
            slot.entry.data = Some(data);
            slot.entry.fetched_at = Some(now);
            slot.entry.status = FetchStatus::Idle;
            slot.entry.last_error = None;
            slot.entry.invalidated = false;
        }
        Err(e) => {
            // Prior data stays servable, flagged as errored.
            tracing::warn!(key = %key, error = %e, "Load failed");
            slot.entry.status = FetchStatus::Error;
            slot.entry.last_error = Some(e);
        }
    }
    slot.last_touched = now;
    slot.notify();
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.len())
            .field("policy", &self.policy)
            .finish()
    }
}

/// Live view of one key. Dropping it releases the observation.
pub struct Subscription {
    key: QueryKey,
    rx: watch::Receiver<Option<CacheEntry>>,
    cache: Weak<Mutex<Inner>>,
}

impl Subscription {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Latest entry state, `None` once the entry was removed.
    pub fn current(&self) -> Option<CacheEntry> {
        self.rx.borrow().clone()
    }

    /// Wait for the next change. Returns false once the entry is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok() && self.rx.borrow().is_some()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.cache.upgrade() else {
            return;
        };
        let mut inner = inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = inner.slots.get_mut(&self.key) {
            slot.observers = slot.observers.saturating_sub(1);
            if slot.observers == 0 {
                slot.last_touched = Instant::now();
            }
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}
