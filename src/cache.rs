// Query cache store.
// Holds the last good value per resource key with freshness tracking, and the
// registry of fetches currently in flight so concurrent callers share one.

use crate::descriptor::ResourceKey;
use crate::error::QueryError;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

pub type CachedValue = Arc<dyn Any + Send + Sync>;
pub type FetchOutcome = Result<CacheEntry, QueryError>;
pub type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

#[derive(Clone)]
pub struct CacheEntry {
    pub value: CachedValue,
    pub fetched_at: Instant,
    pub freshness: Duration,
}

impl CacheEntry {
    pub fn new(value: CachedValue, fetched_at: Instant, freshness: Duration) -> Self {
        Self {
            value,
            fetched_at,
            freshness,
        }
    }

    pub fn is_stale(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.fetched_at) > self.freshness
    }

    pub fn downcast<R: Send + Sync + 'static>(&self) -> Option<Arc<R>> {
        Arc::clone(&self.value).downcast::<R>().ok()
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("fetched_at", &self.fetched_at)
            .field("freshness", &self.freshness)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Updated(ResourceKey),
    Invalidated(ResourceKey),
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub puts: AtomicUsize,
    pub invalidations: AtomicUsize,
    pub fetches_started: AtomicUsize,
    pub fetches_joined: AtomicUsize,
    pub fetches_superseded: AtomicUsize,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CacheStatsReport {
    pub items_count: usize,
    pub in_flight: usize,
    pub puts: usize,
    pub invalidations: usize,
    pub fetches_started: usize,
    pub fetches_joined: usize,
    pub fetches_superseded: usize,
}

struct InFlight {
    id: u64,
    fetch: SharedFetch,
    consumers: Arc<AtomicUsize>,
}

pub enum Lookup {
    Fresh(CacheEntry),
    Pending(PendingFetch),
}

/// A consumer's claim on an in-flight fetch. Counts towards the key's pending
/// consumers until it settles or is dropped.
pub struct PendingFetch {
    fetch: SharedFetch,
    consumers: Arc<AtomicUsize>,
    started: bool,
}

impl PendingFetch {
    // True for the consumer whose lookup started the fetch
    pub fn started(&self) -> bool {
        self.started
    }

    pub async fn wait(self) -> FetchOutcome {
        let fetch = self.fetch.clone();
        fetch.await
    }
}

impl Drop for PendingFetch {
    fn drop(&mut self) {
        self.consumers.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct CacheStore {
    entries: DashMap<ResourceKey, CacheEntry>,
    // Check-and-register and settle happen under this lock, never interleaved
    in_flight: Mutex<HashMap<ResourceKey, InFlight>>,
    next_fetch_id: AtomicU64,
    events: broadcast::Sender<CacheEvent>,
    stats: CacheStats,
}

impl CacheStore {
    pub fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            entries: DashMap::new(),
            in_flight: Mutex::new(HashMap::new()),
            next_fetch_id: AtomicU64::new(1),
            events,
            stats: CacheStats::default(),
        }
    }

    pub fn get(&self, key: &ResourceKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|entry| entry.clone())
    }

    /// Returns the entry only if it is still within its freshness window.
    pub fn get_fresh(&self, key: &ResourceKey, now: Instant) -> Option<CacheEntry> {
        self.get(key).filter(|entry| !entry.is_stale(now))
    }

    pub fn is_stale(&self, key: &ResourceKey, now: Instant) -> bool {
        self.entries
            .get(key)
            .map_or(true, |entry| entry.is_stale(now))
    }

    pub fn put(&self, key: ResourceKey, value: CachedValue, fetched_at: Instant, freshness: Duration) {
        self.insert_entry(key, CacheEntry::new(value, fetched_at, freshness));
    }

    fn insert_entry(&self, key: ResourceKey, entry: CacheEntry) {
        self.entries.insert(key.clone(), entry);
        self.stats.puts.fetch_add(1, Ordering::SeqCst);
        // No receivers is fine; nobody is observing
        let _ = self.events.send(CacheEvent::Updated(key));
    }

    pub fn invalidate(&self, key: &ResourceKey) -> bool {
        let target = key.clone();
        self.invalidate_where(move |candidate| *candidate == target) > 0
    }

    /// Removes every entry whose key matches and detaches matching in-flight
    /// fetches: their current consumers still get the outcome, but it is not
    /// stored. Returns the number of cached entries removed.
    pub fn invalidate_where(&self, predicate: impl Fn(&ResourceKey) -> bool) -> usize {
        let mut touched = BTreeSet::new();
        let mut removed = 0;

        let mut in_flight = self.in_flight.lock();
        self.entries.retain(|key, _| {
            if predicate(key) {
                touched.insert(key.clone());
                removed += 1;
                false
            } else {
                true
            }
        });
        in_flight.retain(|key, fetch| {
            if predicate(key) {
                debug!(key = %key, fetch_id = fetch.id, "detaching in-flight fetch");
                self.stats.fetches_superseded.fetch_add(1, Ordering::SeqCst);
                touched.insert(key.clone());
                false
            } else {
                true
            }
        });
        drop(in_flight);

        self.stats.invalidations.fetch_add(removed, Ordering::SeqCst);
        for key in touched {
            let _ = self.events.send(CacheEvent::Invalidated(key));
        }
        removed
    }

    pub fn clear(&self) -> usize {
        self.invalidate_where(|_| true)
    }

    /// Joins the fetch in flight for `key`, or serves a fresh entry, or
    /// registers the fetch built by `start`. `force` skips the fresh-entry
    /// check but still joins a fetch that is already running.
    pub fn join_or_start<F>(&self, key: &ResourceKey, now: Instant, force: bool, start: F) -> Lookup
    where
        F: FnOnce(u64) -> SharedFetch,
    {
        let mut in_flight = self.in_flight.lock();

        if let Some(existing) = in_flight.get(key) {
            existing.consumers.fetch_add(1, Ordering::SeqCst);
            self.stats.fetches_joined.fetch_add(1, Ordering::SeqCst);
            debug!(key = %key, fetch_id = existing.id, "joining in-flight fetch");
            return Lookup::Pending(PendingFetch {
                fetch: existing.fetch.clone(),
                consumers: Arc::clone(&existing.consumers),
                started: false,
            });
        }

        if !force {
            if let Some(entry) = self.get_fresh(key, now) {
                return Lookup::Fresh(entry);
            }
        }

        let id = self.next_fetch_id.fetch_add(1, Ordering::SeqCst);
        let fetch = start(id);
        let consumers = Arc::new(AtomicUsize::new(1));
        in_flight.insert(
            key.clone(),
            InFlight {
                id,
                fetch: fetch.clone(),
                consumers: Arc::clone(&consumers),
            },
        );
        self.stats.fetches_started.fetch_add(1, Ordering::SeqCst);

        Lookup::Pending(PendingFetch {
            fetch,
            consumers,
            started: true,
        })
    }

    /// Records the outcome of fetch `fetch_id`. Successes replace the entry;
    /// failures are never cached. A fetch detached by invalidation changes
    /// nothing.
    pub fn settle(&self, key: &ResourceKey, fetch_id: u64, outcome: &FetchOutcome) {
        let mut in_flight = self.in_flight.lock();
        let current = in_flight.get(key).map_or(false, |fetch| fetch.id == fetch_id);
        if !current {
            warn!(key = %key, fetch_id, "fetch settled after invalidation, result not cached");
            return;
        }

        if let Ok(entry) = outcome {
            self.insert_entry(key.clone(), entry.clone());
        }
        in_flight.remove(key);
    }

    pub fn is_in_flight(&self, key: &ResourceKey) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    pub fn pending_consumers(&self, key: &ResourceKey) -> usize {
        self.in_flight
            .lock()
            .get(key)
            .map_or(0, |fetch| fetch.consumers.load(Ordering::SeqCst))
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.entries.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub fn stats(&self) -> CacheStatsReport {
        CacheStatsReport {
            items_count: self.entries.len(),
            in_flight: self.in_flight.lock().len(),
            puts: self.stats.puts.load(Ordering::SeqCst),
            invalidations: self.stats.invalidations.load(Ordering::SeqCst),
            fetches_started: self.stats.fetches_started.load(Ordering::SeqCst),
            fetches_joined: self.stats.fetches_joined.load(Ordering::SeqCst),
            fetches_superseded: self.stats.fetches_superseded.load(Ordering::SeqCst),
        }
    }
}
