//! Identity-keyed cache of live persistent objects
//!
//! The cache keeps at most one live instance per identity so that every
//! caller asking for the same record shares the same object. Entries carry
//! the lineage of the revision they were loaded from and a dirty state that
//! tracks local changes not yet written back.
//!
//! Liveness follows `Arc` strong counts: an entry whose object is held only
//! by the cache is unreferenced and is the first choice for eviction. Dirty
//! entries are never evicted.

use dashmap::DashMap;
use parking_lot::Mutex;
use persistio_common::{CacheConfig, Error, Identity, Result};
use persistio_version::VersionLineage;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Write state of a cached entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyState {
    /// Matches the stored revision
    Clean,
    /// A write is in flight and nothing changed since it started
    Updating,
    /// Has local changes waiting for a write
    Dirty,
}

impl DirtyState {
    #[must_use]
    pub const fn is_clean(self) -> bool {
        matches!(self, Self::Clean)
    }
}

struct EntryState<E> {
    object: Arc<E>,
    version: VersionLineage,
    dirty: DirtyState,
    /// Next lookup must reload
    expired: bool,
    /// Entry left the map while a write was in flight
    removed: bool,
}

/// Individual cache entry with LRU tracking and dirty state
struct CacheEntry<E> {
    state: Mutex<EntryState<E>>,
    /// Serializes writes of this entry
    write_lock: Mutex<()>,
    /// Milliseconds since the cache epoch, for idle eviction
    last_access: AtomicU64,
    /// Logical clock value, for LRU ordering
    last_tick: AtomicU64,
}

impl<E> CacheEntry<E> {
    fn new(object: Arc<E>, version: VersionLineage, dirty: DirtyState, now: u64, tick: u64) -> Self {
        Self {
            state: Mutex::new(EntryState {
                object,
                version,
                dirty,
                expired: false,
                removed: false,
            }),
            write_lock: Mutex::new(()),
            last_access: AtomicU64::new(now),
            last_tick: AtomicU64::new(tick),
        }
    }

    fn touch(&self, now: u64, tick: u64) {
        self.last_access.store(now, Ordering::Relaxed);
        self.last_tick.store(tick, Ordering::Relaxed);
    }

    fn last_access(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    fn is_clean(&self) -> bool {
        self.state.lock().dirty.is_clean()
    }
}

/// Cache statistics for monitoring
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Number of cache hits
    pub hits: AtomicU64,
    /// Number of cache misses
    pub misses: AtomicU64,
    /// Number of loader invocations
    pub loads: AtomicU64,
    /// Number of entries evicted
    pub evictions: AtomicU64,
    /// Number of dirty entries written back
    pub writebacks: AtomicU64,
    /// Current number of dirty entries
    pub dirty_count: AtomicU64,
}

impl CacheStats {
    /// Calculate hit ratio (0.0 to 1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }
}

/// Result of marking an object as changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkOutcome {
    /// Lineage of the revision the change is based on
    pub previous: VersionLineage,
    /// The identity was new and has just been provisioned in the backend
    pub created: bool,
}

/// Result of offering a reloaded revision to a cached entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refresh {
    /// Nothing cached under the identity
    Absent,
    /// Local changes are pending; the reload was ignored
    Skipped,
    /// The live instance absorbed the reloaded state
    Accepted,
    /// The reloaded object replaced the live instance
    Replaced,
}

type EvictionHook<E> = Box<dyn Fn(&E) + Send + Sync>;

/// Cache holding one live instance per identity
pub struct PersistenceCache<E> {
    entries: DashMap<Identity, Arc<CacheEntry<E>>>,
    /// Per-identity locks so concurrent misses load once
    load_locks: DashMap<Identity, Arc<Mutex<()>>>,
    capacity: usize,
    idle_timeout: Option<Duration>,
    epoch: Instant,
    /// Logical clock for LRU ordering
    clock: AtomicU64,
    stats: CacheStats,
    /// Told about still-referenced instances that leave the cache
    on_evict: Option<EvictionHook<E>>,
    /// Instances evicted while the application still held them
    evicted: DashMap<Identity, Weak<E>>,
}

impl<E> PersistenceCache<E> {
    /// Create a new cache from configuration
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            load_locks: DashMap::new(),
            capacity: config.capacity.max(1),
            idle_timeout: config.idle_timeout(),
            epoch: Instant::now(),
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
            on_evict: None,
            evicted: DashMap::new(),
        }
    }

    /// Install the hook called when a referenced instance leaves the cache
    #[must_use]
    pub fn with_eviction_hook(mut self, hook: impl Fn(&E) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Box::new(hook));
        self
    }

    /// Get cache statistics
    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the current number of entries in the cache
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &Identity) -> bool {
        self.entries.contains_key(id)
    }

    /// Return the live instance, loading it on a miss
    ///
    /// Concurrent misses for the same identity run `loader` once; the other
    /// callers observe the installed instance. A force-expired entry is
    /// reloaded in place.
    pub fn get<F>(&self, id: &Identity, loader: F) -> Result<Option<Arc<E>>>
    where
        F: FnOnce(&Identity) -> Result<Option<(E, VersionLineage)>>,
    {
        if let Some(object) = self.lookup(id) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(object));
        }
        self.stats.misses.fetch_add(1, Ordering::Relaxed);

        self.with_load_lock(id, || {
            // Another caller may have installed it while we waited
            if let Some(object) = self.lookup(id) {
                return Ok(Some(object));
            }
            self.stats.loads.fetch_add(1, Ordering::Relaxed);
            match loader(id)? {
                Some((object, version)) => Ok(Some(self.install(id, object, version))),
                None => {
                    self.discard_expired(id);
                    Ok(None)
                }
            }
        })
    }

    /// Return the cached instance without loading, touching or counting
    pub fn peek(&self, id: &Identity) -> Option<Arc<E>> {
        self.entry(id).map(|entry| Arc::clone(&entry.state.lock().object))
    }

    /// Lineage of the cached revision
    pub fn version(&self, id: &Identity) -> Option<VersionLineage> {
        self.entry(id).map(|entry| entry.state.lock().version.clone())
    }

    /// Dirty state of the cached entry
    pub fn dirty_state(&self, id: &Identity) -> Option<DirtyState> {
        self.entry(id).map(|entry| entry.state.lock().dirty)
    }

    /// Whether the entry has local changes not yet written back
    pub fn is_dirty(&self, id: &Identity) -> bool {
        self.dirty_state(id).is_some_and(|state| !state.is_clean())
    }

    /// Record a local change to `object`
    ///
    /// A cached entry becomes dirty and the lineage it was based on is
    /// returned. An identity new to the cache is provisioned synchronously
    /// through `provision` and installed clean, so no further write is
    /// needed for it.
    pub fn mark_updating<P>(&self, id: &Identity, object: &Arc<E>, provision: P) -> Result<MarkOutcome>
    where
        P: FnOnce() -> Result<VersionLineage>,
    {
        if let Some(outcome) = self.mark_existing(id, object)? {
            return Ok(outcome);
        }
        self.with_load_lock(id, || {
            if let Some(outcome) = self.mark_existing(id, object)? {
                return Ok(outcome);
            }
            if self.was_evicted(id, object) {
                return Err(Error::invariant(format!(
                    "instance of {id} was evicted and marked deleted, get it again"
                )));
            }
            let version = provision()?;
            debug!("Provisioned {} at {}", id, version);
            self.insert(id, Arc::clone(object), version.clone(), DirtyState::Clean);
            Ok(MarkOutcome {
                previous: version,
                created: true,
            })
        })
    }

    fn was_evicted(&self, id: &Identity, object: &Arc<E>) -> bool {
        self.evicted
            .get(id)
            .and_then(|held| held.upgrade())
            .is_some_and(|held| Arc::ptr_eq(&held, object))
    }

    fn mark_existing(&self, id: &Identity, object: &Arc<E>) -> Result<Option<MarkOutcome>> {
        let Some(entry) = self.entry(id) else {
            return Ok(None);
        };
        let mut state = entry.state.lock();
        if !Arc::ptr_eq(&state.object, object) {
            return Err(Error::invariant(format!(
                "a different instance of {id} is already cached"
            )));
        }
        if state.dirty.is_clean() {
            self.stats.dirty_count.fetch_add(1, Ordering::Relaxed);
        }
        // Marking during a write leaves the entry dirty once the write lands
        state.dirty = DirtyState::Dirty;
        state.expired = false;
        entry.touch(self.now(), self.tick());
        Ok(Some(MarkOutcome {
            previous: state.version.clone(),
            created: false,
        }))
    }

    /// Write a dirty entry back through `writer`
    ///
    /// `writer` receives the object and the lineage it is based on and
    /// returns the lineage of the stored revision. Returns `false` when
    /// there was nothing to write. A failed write leaves the entry dirty.
    pub fn flush<W>(&self, id: &Identity, writer: W) -> Result<bool>
    where
        W: FnOnce(&Arc<E>, &VersionLineage) -> Result<VersionLineage>,
    {
        let Some(entry) = self.entry(id) else {
            debug!("Flush of {} skipped: not cached", id);
            return Ok(false);
        };
        let _write = entry.write_lock.lock();

        let (object, previous) = {
            let mut state = entry.state.lock();
            if state.dirty != DirtyState::Dirty {
                warn!("Flush requested for clean entry {}", id);
                return Ok(false);
            }
            state.dirty = DirtyState::Updating;
            (Arc::clone(&state.object), state.version.clone())
        };

        let result = writer(&object, &previous);

        let mut state = entry.state.lock();
        if state.removed {
            return result.map(|_| true);
        }
        match result {
            Ok(version) => {
                state.version = version;
                if state.dirty == DirtyState::Updating {
                    state.dirty = DirtyState::Clean;
                    self.stats.dirty_count.fetch_sub(1, Ordering::Relaxed);
                }
                self.stats.writebacks.fetch_add(1, Ordering::Relaxed);
                Ok(true)
            }
            Err(e) => {
                state.dirty = DirtyState::Dirty;
                Err(e)
            }
        }
    }

    /// Evict and return the instance; it is told it was deleted
    pub fn remove(&self, id: &Identity) -> Option<Arc<E>> {
        let (_, entry) = self.entries.remove(id)?;
        let (object, _) = self.detach(&entry);
        if let Some(hook) = &self.on_evict {
            hook(&object);
        }
        Some(object)
    }

    /// Drop the entry and any local changes without telling the instance
    ///
    /// Used to recover from a lost write: the next `get` loads the stored
    /// revision.
    pub fn discard(&self, id: &Identity) -> Option<Arc<E>> {
        let (_, entry) = self.entries.remove(id)?;
        let (object, _) = self.detach(&entry);
        debug!("Discarded {}", id);
        Some(object)
    }

    /// Force the next `get` to reload. Ignored while local changes are pending.
    pub fn expire(&self, id: &Identity) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        let mut state = entry.state.lock();
        if !state.dirty.is_clean() {
            warn!("Not expiring {}: local changes pending", id);
            return false;
        }
        state.expired = true;
        true
    }

    /// Offer a freshly loaded revision to the cached entry
    ///
    /// `accept` receives the live instance and the reloaded peer; returning
    /// `true` keeps the live instance (it absorbed the peer's state),
    /// `false` replaces it.
    pub fn refresh<A>(&self, id: &Identity, object: E, version: VersionLineage, accept: A) -> Refresh
    where
        A: FnOnce(&E, &E) -> bool,
    {
        let Some(entry) = self.entry(id) else {
            return Refresh::Absent;
        };
        let mut state = entry.state.lock();
        if !state.dirty.is_clean() {
            debug!("Reload of {} ignored: local changes pending", id);
            return Refresh::Skipped;
        }
        state.expired = false;
        state.version = version;
        if accept(&state.object, &object) {
            Refresh::Accepted
        } else {
            state.object = Arc::new(object);
            Refresh::Replaced
        }
    }

    /// Evict clean entries idle past the configured timeout
    ///
    /// Returns the number of evicted entries.
    pub fn sweep(&self) -> usize {
        let Some(timeout) = self.idle_timeout else {
            return 0;
        };
        let timeout = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let now = self.now();
        let idle: Vec<Identity> = self
            .entries
            .iter()
            .filter(|e| now.saturating_sub(e.value().last_access()) >= timeout)
            .map(|e| e.key().clone())
            .collect();

        self.evicted.retain(|_, held| held.strong_count() > 0);

        let mut evicted = 0;
        for id in idle {
            if let Some((_, entry)) = self.entries.remove_if(&id, |_, e| e.is_clean()) {
                self.evict(&id, &entry);
                evicted += 1;
            }
        }
        if evicted > 0 {
            debug!("Swept {} idle entries", evicted);
        }
        evicted
    }

    fn entry(&self, id: &Identity) -> Option<Arc<CacheEntry<E>>> {
        self.entries.get(id).map(|e| Arc::clone(e.value()))
    }

    fn lookup(&self, id: &Identity) -> Option<Arc<E>> {
        let entry = self.entry(id)?;
        let state = entry.state.lock();
        if state.expired {
            return None;
        }
        entry.touch(self.now(), self.tick());
        Some(Arc::clone(&state.object))
    }

    fn with_load_lock<T>(&self, id: &Identity, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = Arc::clone(self.load_locks.entry(id.clone()).or_default().value());
        let result = {
            let _guard = lock.lock();
            f()
        };
        // The map and this call hold the only references when nobody waits
        self.load_locks
            .remove_if(id, |_, l| Arc::ptr_eq(l, &lock) && Arc::strong_count(l) <= 2);
        result
    }

    /// Install a loaded object, reusing a force-expired entry in place
    fn install(&self, id: &Identity, object: E, version: VersionLineage) -> Arc<E> {
        if let Some(entry) = self.entry(id) {
            let mut state = entry.state.lock();
            state.object = Arc::new(object);
            state.version = version;
            state.expired = false;
            entry.touch(self.now(), self.tick());
            return Arc::clone(&state.object);
        }
        let object = Arc::new(object);
        self.insert(id, Arc::clone(&object), version, DirtyState::Clean);
        object
    }

    fn insert(&self, id: &Identity, object: Arc<E>, version: VersionLineage, dirty: DirtyState) {
        let entry = CacheEntry::new(object, version, dirty, self.now(), self.tick());
        self.entries.insert(id.clone(), Arc::new(entry));
        self.evicted.remove_if(id, |_, held| held.strong_count() == 0);
        self.enforce_capacity(id);
    }

    /// A reload found the record gone: drop the stale expired entry
    fn discard_expired(&self, id: &Identity) {
        let removed = self.entries.remove_if(id, |_, e| {
            let state = e.state.lock();
            state.expired && state.dirty.is_clean()
        });
        if let Some((_, entry)) = removed {
            self.evict(id, &entry);
        }
    }

    fn enforce_capacity(&self, keep: &Identity) {
        while self.entries.len() > self.capacity {
            let Some(victim) = self.find_lru_entry(keep) else {
                debug!("Cache over capacity with only dirty entries");
                break;
            };
            if let Some((_, entry)) = self.entries.remove_if(&victim, |_, e| e.is_clean()) {
                self.evict(&victim, &entry);
            }
        }
    }

    /// Find the LRU clean entry, preferring ones nobody else holds
    fn find_lru_entry(&self, keep: &Identity) -> Option<Identity> {
        self.entries
            .iter()
            .filter(|e| e.key() != keep)
            .filter_map(|e| {
                let state = e.value().state.lock();
                if !state.dirty.is_clean() {
                    return None;
                }
                let referenced = Arc::strong_count(&state.object) > 1;
                Some((e.key().clone(), referenced, e.value().last_tick.load(Ordering::Relaxed)))
            })
            .min_by_key(|(_, referenced, access)| (*referenced, *access))
            .map(|(id, _, _)| id)
    }

    fn evict(&self, id: &Identity, entry: &CacheEntry<E>) {
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        let (object, referenced) = self.detach(entry);
        if referenced {
            debug!("Evicted {} while still referenced", id);
            self.evicted.insert(id.clone(), Arc::downgrade(&object));
            if let Some(hook) = &self.on_evict {
                hook(&object);
            }
        }
    }

    /// Take the object out of a removed entry; reports whether anyone
    /// outside the cache still holds it
    fn detach(&self, entry: &CacheEntry<E>) -> (Arc<E>, bool) {
        let mut state = entry.state.lock();
        if !state.dirty.is_clean() {
            self.stats.dirty_count.fetch_sub(1, Ordering::Relaxed);
        }
        state.dirty = DirtyState::Clean;
        state.removed = true;
        let referenced = Arc::strong_count(&state.object) > 1;
        (Arc::clone(&state.object), referenced)
    }

    /// Advance the logical clock and return the new value
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
