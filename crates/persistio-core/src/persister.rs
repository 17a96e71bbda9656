//! Object-facing persistence API
//!
//! A persister manages the objects of one kind. Reads go through the
//! persistence cache so that each identity has a single live instance.
//! Writes either go straight to the driver or are queued in a write-behind
//! flusher that coalesces repeated updates of the same object.

use crate::driver::{ChangeSink, ChangeWatch, StorageDriver};
use crate::id::{KeyGenerator, UuidKeys};
use crate::listener::{ChangeListener, ListenerId, Listeners};
use crate::mapper::ObjectMapper;
use crate::persistent::Persistent;
use crate::query::Query;
use crate::record::Record;
use chrono::Utc;
use persistio_cache::{CacheStats, FlushTask, Flusher, FlusherOptions, FlusherStats, PersistenceCache, Refresh};
use persistio_common::{ChangeKind, Config, Error, Identity, PersisterConfig, Result};
use parking_lot::Mutex;
use persistio_version::{Comparison, VersionLineage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// State shared with flush tasks and change-watch callbacks
struct Inner<E: Persistent> {
    kind: String,
    node: String,
    max_run: usize,
    config: PersisterConfig,
    driver: Arc<dyn StorageDriver>,
    mapper: Arc<dyn ObjectMapper<E>>,
    cache: PersistenceCache<E>,
    listeners: Listeners<E>,
    watch: Option<Arc<dyn ChangeWatch>>,
    watch_started: AtomicBool,
    keys: Arc<dyn KeyGenerator>,
    /// Identities with a driver call of ours in progress
    own_writes: Mutex<HashMap<Identity, usize>>,
}

/// Deferred write of one dirty object
struct PersistTask<E: Persistent> {
    inner: Arc<Inner<E>>,
    id: Identity,
}

impl<E: Persistent> FlushTask for PersistTask<E> {
    type Key = Identity;

    fn key(&self) -> Identity {
        self.id.clone()
    }

    fn flush(&self) -> Result<()> {
        self.inner.write(&self.id).map(|_| ())
    }
}

/// Builder for [`Persister`]
pub struct PersisterBuilder<E: Persistent> {
    kind: String,
    driver: Arc<dyn StorageDriver>,
    mapper: Arc<dyn ObjectMapper<E>>,
    config: Config,
    watch: Option<Arc<dyn ChangeWatch>>,
    keys: Arc<dyn KeyGenerator>,
}

impl<E: Persistent> PersisterBuilder<E> {
    #[must_use]
    pub fn config(mut self, config: &Config) -> Self {
        self.config = config.clone();
        self
    }

    /// Feed of changes made by other writers, started with the first listener
    #[must_use]
    pub fn change_watch(mut self, watch: Arc<dyn ChangeWatch>) -> Self {
        self.watch = Some(watch);
        self
    }

    #[must_use]
    pub fn key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = keys;
        self
    }

    pub fn build(self) -> Result<Persister<E>> {
        self.config.validate()?;
        Identity::new(self.kind.as_str(), "_")?;

        let cache = PersistenceCache::new(&self.config.cache)
            .with_eviction_hook(|object: &E| object.mark_deleted());
        let inner = Arc::new(Inner {
            kind: self.kind,
            node: self.config.node.id.clone(),
            max_run: self.config.version.max_same_node_run,
            config: self.config.persister.clone(),
            driver: self.driver,
            mapper: self.mapper,
            cache,
            listeners: Listeners::default(),
            watch: self.watch,
            watch_started: AtomicBool::new(false),
            keys: self.keys,
            own_writes: Mutex::new(HashMap::new()),
        });

        let flusher = if self.config.flusher.write_behind {
            let options = FlusherOptions::from(&self.config.flusher);
            Some(Flusher::new(inner.kind.clone(), options)?)
        } else {
            None
        };

        info!(
            "Persister for {} on node {} ready ({})",
            inner.kind,
            inner.node,
            if flusher.is_some() { "write-behind" } else { "write-through" }
        );
        Ok(Persister { inner, flusher })
    }
}

/// Cache-through persistence of one kind of object
pub struct Persister<E: Persistent> {
    inner: Arc<Inner<E>>,
    flusher: Option<Flusher<PersistTask<E>>>,
}

impl<E: Persistent> Persister<E> {
    /// Start building a persister for objects of `kind`
    pub fn builder(
        kind: impl Into<String>,
        driver: Arc<dyn StorageDriver>,
        mapper: Arc<dyn ObjectMapper<E>>,
    ) -> PersisterBuilder<E> {
        PersisterBuilder {
            kind: kind.into(),
            driver,
            mapper,
            config: Config::default(),
            watch: None,
            keys: Arc::new(UuidKeys),
        }
    }

    pub fn kind(&self) -> &str {
        &self.inner.kind
    }

    pub fn node(&self) -> &str {
        &self.inner.node
    }

    /// Live instance for `id`, loading it on a cache miss
    ///
    /// `None` when the record is absent, deleted or, in owner-only mode,
    /// owned by another node.
    pub fn get(&self, id: &Identity) -> Result<Option<Arc<E>>> {
        self.inner.check_kind(id)?;
        if !self.inner.visible(id.owner()) {
            return Ok(None);
        }
        self.inner.cache.get(id, |id| self.inner.load(id))
    }

    /// Record a change to `object` and schedule its write
    ///
    /// A new identity is created in the backend right away and needs no
    /// further write.
    pub fn update(&self, object: &Arc<E>) -> Result<()> {
        let id = object.identity();
        self.inner.check_kind(&id)?;
        let outcome = self
            .inner
            .cache
            .mark_updating(&id, object, || self.inner.create(&id, object))?;
        if outcome.created {
            self.inner.fan_out(ChangeKind::New, &id);
            return Ok(());
        }

        match &self.flusher {
            Some(flusher) => flusher.mark(PersistTask {
                inner: Arc::clone(&self.inner),
                id,
            }),
            None => self.inner.write(&id).map(|_| ()),
        }
    }

    /// Write `object` through to the backend now
    ///
    /// Returns the stored lineage.
    pub fn persist(&self, object: &Arc<E>) -> Result<VersionLineage> {
        let id = object.identity();
        self.inner.check_kind(&id)?;
        let outcome = self
            .inner
            .cache
            .mark_updating(&id, object, || self.inner.create(&id, object))?;
        if outcome.created {
            self.inner.fan_out(ChangeKind::New, &id);
            return Ok(outcome.previous);
        }
        self.cancel_pending(&id);
        self.inner.write(&id)?;
        Ok(self.inner.cache.version(&id).unwrap_or_default())
    }

    /// Write a dirty object now; `false` when it was clean
    pub fn flush(&self, object: &E) -> Result<bool> {
        let id = object.identity();
        self.inner.check_kind(&id)?;
        self.cancel_pending(&id);
        self.inner.write(&id)
    }

    /// Run every queued write, including retries, and wait for them
    pub fn flush_all(&self) {
        if let Some(flusher) = &self.flusher {
            flusher.flush_now();
        }
    }

    /// Delete a record; `false` when the backend had none
    pub fn remove(&self, id: &Identity) -> Result<bool> {
        self.inner.check_kind(id)?;
        let removed = self.inner.cache.remove(id);
        self.cancel_pending(id);
        let deleted = self.inner.own_write(id, || self.inner.driver.delete(id))?;
        if deleted {
            debug!("Removed {}", id);
            self.inner
                .listeners
                .fan_out(ChangeKind::Delete, id, &|| removed.clone());
        }
        Ok(deleted)
    }

    /// Throw away local changes to `id`; the next `get` loads the stored revision
    ///
    /// This is how a caller recovers from a version conflict.
    pub fn discard(&self, id: &Identity) -> bool {
        self.cancel_pending(id);
        self.inner.cache.discard(id).is_some()
    }

    pub fn is_dirty(&self, object: &E) -> bool {
        self.inner.cache.is_dirty(&object.identity())
    }

    /// Cached lineage of `id`, if cached
    pub fn version(&self, id: &Identity) -> Option<VersionLineage> {
        self.inner.cache.version(id)
    }

    /// Generate an identity not yet used in the backend
    pub fn new_id(&self, prefix: &str) -> Result<Identity> {
        let attempts = self.inner.config.id_retries.max(1);
        for _ in 0..attempts {
            let mut id = Identity::new(self.inner.kind.as_str(), self.inner.keys.next_key(prefix))?;
            if self.inner.config.owner_only {
                id = id.with_owner(self.inner.node.as_str())?;
            }
            if !self.inner.config.check_duplicate_ids {
                return Ok(id);
            }
            if !self.inner.cache.contains(&id) && !self.inner.driver.exists(&id)? {
                return Ok(id);
            }
            debug!("Generated id {} is taken", id);
        }
        Err(Error::IdDuplicate { attempts })
    }

    /// Register a listener; the first one starts the change watch
    pub fn add_listener(&self, listener: impl ChangeListener<E> + 'static) -> Result<ListenerId> {
        let handle = self.inner.listeners.add(Arc::new(listener));
        self.start_watch()?;
        Ok(handle)
    }

    pub fn remove_listener(&self, handle: ListenerId) -> bool {
        self.inner.listeners.remove(handle)
    }

    fn start_watch(&self) -> Result<()> {
        let Some(watch) = &self.inner.watch else {
            return Ok(());
        };
        if self.inner.watch_started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let weak: Weak<Inner<E>> = Arc::downgrade(&self.inner);
        let sink: ChangeSink = Arc::new(move |kind: ChangeKind, id: &Identity| {
            if let Some(inner) = weak.upgrade() {
                if let Err(e) = inner.on_external_change(kind, id) {
                    warn!("Failed to apply external {} of {}: {}", kind, id, e);
                }
            }
        });
        if let Err(e) = watch.start(&self.inner.kind, sink) {
            self.inner.watch_started.store(false, Ordering::SeqCst);
            return Err(e);
        }
        info!("Change watch started for {}", self.inner.kind);
        Ok(())
    }

    /// Apply a change made by another writer
    pub fn on_external_change(&self, kind: ChangeKind, id: &Identity) -> Result<()> {
        self.inner.on_external_change(kind, id)
    }

    /// Identities matching `query`
    pub fn find_ids(&self, query: &Query) -> Result<Vec<Identity>> {
        if query.kind() != self.inner.kind {
            return Err(Error::invalid_argument(format!(
                "query for {} sent to the {} persister",
                query.kind(),
                self.inner.kind
            )));
        }
        query.validate()?;
        let ids = self.inner.driver.find_ids(query)?;
        Ok(ids
            .into_iter()
            .filter(|id| self.inner.visible(id.owner()))
            .collect())
    }

    /// Objects matching `query`, resolved through the cache
    pub fn find(&self, query: &Query) -> Result<Vec<Arc<E>>> {
        let mut found = Vec::new();
        for id in self.find_ids(query)? {
            if let Some(object) = self.get(&id)? {
                found.push(object);
            }
        }
        Ok(found)
    }

    /// Evict clean entries idle past the configured timeout
    pub fn evict_idle(&self) -> usize {
        self.inner.cache.sweep()
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        self.inner.cache.stats()
    }

    pub fn flusher_stats(&self) -> Option<&FlusherStats> {
        self.flusher.as_ref().map(Flusher::stats)
    }

    /// Writes waiting in the write-behind queue
    pub fn pending_writes(&self) -> usize {
        self.flusher.as_ref().map_or(0, Flusher::pending_len)
    }

    /// Drain queued writes and stop the flusher
    pub fn close(&self) {
        if let Some(flusher) = &self.flusher {
            flusher.close();
        }
    }

    fn cancel_pending(&self, id: &Identity) {
        if let Some(flusher) = &self.flusher {
            flusher.cancel(id);
        }
    }
}

impl<E: Persistent> Inner<E> {
    fn check_kind(&self, id: &Identity) -> Result<()> {
        if id.kind() == self.kind {
            Ok(())
        } else {
            Err(Error::invariant(format!(
                "{id} handed to the {} persister",
                self.kind
            )))
        }
    }

    /// Owner-only mode hides records owned by other nodes
    fn visible(&self, owner: Option<&str>) -> bool {
        !self.config.owner_only || owner.is_none_or(|owner| owner == self.node)
    }

    fn load(&self, id: &Identity) -> Result<Option<(E, VersionLineage)>> {
        let Some(loaded) = self.driver.load(id)? else {
            return Ok(None);
        };
        if loaded.version.is_deleted() || !self.visible(loaded.owner.as_deref()) {
            return Ok(None);
        }
        let object = self.mapper.decode(id, loaded.record)?;
        if object.identity() != *id {
            return Err(Error::invariant(format!(
                "record {id} decoded to {}",
                object.identity()
            )));
        }
        object.after_load(id, &loaded.version, loaded.owner.as_deref());
        Ok(Some((object, loaded.version)))
    }

    fn encode(&self, id: &Identity, object: &E, version: &VersionLineage) -> Result<Record> {
        object.before_persist();
        let mut record = self.mapper.encode(object)?;
        record.stamp(id, version, Utc::now(), id.owner());
        Ok(record)
    }

    /// Provision a new identity in the backend
    fn create(&self, id: &Identity, object: &E) -> Result<VersionLineage> {
        let proposed = VersionLineage::new().append(&self.node, false, self.max_run);
        let record = self.encode(id, object, &proposed)?;
        let stored = self.own_write(id, || self.driver.create_new(id, record))?;
        object.after_persist(&stored);
        Ok(stored)
    }

    /// Write the cached entry for `id` if dirty
    fn write(&self, id: &Identity) -> Result<bool> {
        let written = self.cache.flush(id, |object, previous| {
            let proposed = previous.append(&self.node, false, self.max_run);
            let record = self.encode(id, object, &proposed)?;
            let stored = self.own_write(id, || self.driver.save(id, record, previous))?;
            object.after_persist(&stored);
            Ok(stored)
        })?;
        if written {
            self.fan_out(ChangeKind::Update, id);
        }
        Ok(written)
    }

    /// Run a driver call whose change notification must not echo back
    fn own_write<T>(&self, id: &Identity, call: impl FnOnce() -> Result<T>) -> Result<T> {
        *self.own_writes.lock().entry(id.clone()).or_insert(0) += 1;
        let result = call();
        let mut own = self.own_writes.lock();
        if let Some(count) = own.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                own.remove(id);
            }
        }
        result
    }

    fn is_own_write(&self, id: &Identity) -> bool {
        self.own_writes.lock().contains_key(id)
    }

    fn fan_out(&self, kind: ChangeKind, id: &Identity) {
        self.listeners.fan_out(kind, id, &|| self.cache.peek(id));
    }

    fn on_external_change(&self, kind: ChangeKind, id: &Identity) -> Result<()> {
        if id.kind() != self.kind || self.is_own_write(id) {
            return Ok(());
        }
        match kind {
            ChangeKind::New | ChangeKind::Update => {
                if self.cache.contains(id) {
                    match self.load(id)? {
                        Some((object, version)) => {
                            let cached = self.cache.version(id).unwrap_or_default();
                            if cached.compare(&version) == Comparison::Same {
                                // Already at this revision
                                return Ok(());
                            }
                            let refresh = self.cache.refresh(id, object, version, |live, peer| {
                                live.on_reload_accepted(peer)
                            });
                            if refresh == Refresh::Skipped {
                                info!("External {} of {} ignored: local changes pending", kind, id);
                            } else {
                                debug!("External {} of {}: {:?}", kind, id, refresh);
                            }
                        }
                        None => {
                            self.cache.remove(id);
                        }
                    }
                }
                self.fan_out(kind, id);
            }
            ChangeKind::Delete => {
                let removed = self.cache.remove(id);
                self.listeners.fan_out(kind, id, &|| removed.clone());
            }
            ChangeKind::Unknown => {
                self.cache.expire(id);
                self.fan_out(kind, id);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDriver;
    use persistio_common::CacheConfig;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::thread;
    use std::time::Duration;

    /// Test object with interior mutability and hook counters
    #[derive(Debug)]
    struct Account {
        id: Identity,
        balance: Mutex<i64>,
        deleted: AtomicBool,
        persisted: AtomicUsize,
    }

    impl Account {
        fn new(id: Identity, balance: i64) -> Self {
            Self {
                id,
                balance: Mutex::new(balance),
                deleted: AtomicBool::new(false),
                persisted: AtomicUsize::new(0),
            }
        }

        fn balance(&self) -> i64 {
            *self.balance.lock()
        }
    }

    impl Persistent for Account {
        fn identity(&self) -> Identity {
            self.id.clone()
        }

        fn after_persist(&self, _version: &VersionLineage) {
            self.persisted.fetch_add(1, AtomicOrdering::SeqCst);
        }

        fn on_reload_accepted(&self, other: &Self) -> bool {
            *self.balance.lock() = other.balance();
            true
        }

        fn mark_deleted(&self) {
            self.deleted.store(true, AtomicOrdering::SeqCst);
        }
    }

    struct AccountMapper;

    impl ObjectMapper<Account> for AccountMapper {
        fn encode(&self, object: &Account) -> Result<Record> {
            Record::new().with("balance", object.balance())
        }

        fn decode(&self, id: &Identity, record: Record) -> Result<Account> {
            let balance = record
                .get("balance")
                .and_then(serde_json::Value::as_i64)
                .ok_or_else(|| Error::serialization("missing balance"))?;
            Ok(Account::new(id.clone(), balance))
        }
    }

    /// Always hands out the same key
    struct FixedKeys;

    impl KeyGenerator for FixedKeys {
        fn next_key(&self, prefix: &str) -> String {
            format!("{prefix}fixed")
        }
    }

    fn config(node: &str, write_behind: bool) -> Config {
        let mut config = Config::default();
        config.node.id = node.to_string();
        config.flusher.write_behind = write_behind;
        config.flusher.delay_ms = 60_000;
        config
    }

    fn persister(driver: &Arc<MemoryDriver>, config: &Config) -> Persister<Account> {
        Persister::builder("acct", driver.clone(), Arc::new(AccountMapper))
            .config(config)
            .change_watch(driver.clone())
            .build()
            .unwrap()
    }

    fn id(key: &str) -> Identity {
        Identity::new("acct", key).unwrap()
    }

    #[test]
    fn test_update_new_object_creates_synchronously() {
        let driver = Arc::new(MemoryDriver::new());
        let persister = persister(&driver, &config("a", true));

        let account = Arc::new(Account::new(id("1"), 10));
        persister.update(&account).unwrap();

        assert!(!persister.is_dirty(&account));
        assert_eq!(persister.pending_writes(), 0);
        let stored = driver.record(&id("1")).unwrap();
        assert_eq!(stored.version().to_string(), "a+1");
        assert_eq!(stored.get("balance"), Some(&serde_json::json!(10)));
        assert!(stored.modified().is_some());

        let fetched = persister.get(&id("1")).unwrap().unwrap();
        assert!(Arc::ptr_eq(&fetched, &account));
    }

    #[test]
    fn test_second_get_reuses_loaded_instance() {
        let driver = Arc::new(MemoryDriver::new());
        let writer = persister(&driver, &config("a", false));
        writer.update(&Arc::new(Account::new(id("x"), 5))).unwrap();

        let reader = persister(&driver, &config("b", false));
        let first = reader.get(&id("x")).unwrap().unwrap();
        let second = reader.get(&id("x")).unwrap().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(reader.stats().loads.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(reader.version(&id("x")).unwrap().to_string(), "a+1");
    }

    #[test]
    fn test_write_behind_coalesces_updates() {
        let driver = Arc::new(MemoryDriver::new());
        let persister = persister(&driver, &config("a", true));
        let account = Arc::new(Account::new(id("1"), 0));
        persister.update(&account).unwrap();
        let writes_after_create = driver.write_count();

        for amount in 1..=5 {
            *account.balance.lock() = amount;
            persister.update(&account).unwrap();
        }
        assert!(persister.is_dirty(&account));
        assert_eq!(persister.pending_writes(), 1);

        persister.flush_all();
        assert_eq!(driver.write_count(), writes_after_create + 1);
        assert!(!persister.is_dirty(&account));
        let stored = driver.record(&id("1")).unwrap();
        assert_eq!(stored.get("balance"), Some(&serde_json::json!(5)));
        assert_eq!(stored.version().to_string(), "a+1;a+2");
    }

    #[test]
    fn test_write_through_updates_lineage() {
        let driver = Arc::new(MemoryDriver::new());
        let persister = persister(&driver, &config("a", false));
        let account = Arc::new(Account::new(id("1"), 0));
        persister.update(&account).unwrap();

        *account.balance.lock() = 3;
        persister.update(&account).unwrap();
        assert!(!persister.is_dirty(&account));
        assert_eq!(persister.version(&id("1")).unwrap().to_string(), "a+1;a+2");
        assert_eq!(account.persisted.load(AtomicOrdering::SeqCst), 2);
    }

    #[test]
    fn test_persist_bypasses_queue() {
        let driver = Arc::new(MemoryDriver::new());
        let persister = persister(&driver, &config("a", true));
        let account = Arc::new(Account::new(id("1"), 0));
        persister.update(&account).unwrap();

        *account.balance.lock() = 7;
        persister.update(&account).unwrap();
        let version = persister.persist(&account).unwrap();
        assert_eq!(version.to_string(), "a+1;a+2");
        assert_eq!(persister.pending_writes(), 0);
        assert!(!persister.flush(&account).unwrap());
    }

    #[test]
    fn test_concurrent_writers_conflict() {
        let driver = Arc::new(MemoryDriver::new());
        let node_a = persister(&driver, &config("a", false));
        let node_b = persister(&driver, &config("b", false));
        node_a.update(&Arc::new(Account::new(id("1"), 0))).unwrap();

        let seen_by_a = node_a.get(&id("1")).unwrap().unwrap();
        let seen_by_b = node_b.get(&id("1")).unwrap().unwrap();

        *seen_by_a.balance.lock() = 1;
        node_a.persist(&seen_by_a).unwrap();

        *seen_by_b.balance.lock() = 2;
        let err = node_b.persist(&seen_by_b).unwrap_err();
        assert!(err.is_conflict());
        assert!(node_b.is_dirty(&seen_by_b));

        // b starts over from a's revision
        assert!(node_b.discard(&id("1")));
        let reloaded = node_b.get(&id("1")).unwrap().unwrap();
        assert_eq!(reloaded.balance(), 1);
        *reloaded.balance.lock() = 2;
        assert_eq!(node_b.persist(&reloaded).unwrap().to_string(), "a+1;a+2;b+3");
    }

    #[test]
    fn test_failed_background_write_is_retried() {
        let driver = Arc::new(MemoryDriver::new());
        let persister = persister(&driver, &config("a", true));
        let account = Arc::new(Account::new(id("1"), 0));
        persister.update(&account).unwrap();

        *account.balance.lock() = 9;
        persister.update(&account).unwrap();
        driver.fail_next(1);
        persister.flush_all();
        assert!(persister.is_dirty(&account));

        persister.flush_all();
        assert!(!persister.is_dirty(&account));
        assert_eq!(
            driver.record(&id("1")).unwrap().get("balance"),
            Some(&serde_json::json!(9))
        );
    }

    #[test]
    fn test_remove() {
        let driver = Arc::new(MemoryDriver::new());
        let persister = persister(&driver, &config("a", true));
        let account = Arc::new(Account::new(id("1"), 0));
        persister.update(&account).unwrap();
        persister.update(&account).unwrap();

        assert!(persister.remove(&id("1")).unwrap());
        assert!(account.deleted.load(AtomicOrdering::SeqCst));
        assert_eq!(persister.pending_writes(), 0);
        assert!(persister.get(&id("1")).unwrap().is_none());
        assert!(!persister.remove(&id("1")).unwrap());
    }

    #[test]
    fn test_owner_only_hides_foreign_records() {
        let driver = Arc::new(MemoryDriver::new());
        let mut cfg = config("a", false);
        cfg.persister.owner_only = true;
        let owner_a = persister(&driver, &cfg);
        cfg.node.id = "b".into();
        let owner_b = persister(&driver, &cfg);

        let mine = owner_a.new_id("").unwrap();
        assert_eq!(mine.owner(), Some("a"));
        owner_a.update(&Arc::new(Account::new(mine.clone(), 1))).unwrap();

        assert!(owner_a.get(&mine).unwrap().is_some());
        assert!(owner_b.get(&mine).unwrap().is_none());
        assert!(owner_b.find_ids(&Query::all("acct")).unwrap().is_empty());
        assert_eq!(owner_a.find_ids(&Query::all("acct")).unwrap(), vec![mine]);
    }

    #[test]
    fn test_new_id_gives_up_on_duplicates() {
        let driver = Arc::new(MemoryDriver::new());
        let persister = Persister::builder("acct", driver.clone(), Arc::new(AccountMapper))
            .config(&config("a", false))
            .key_generator(Arc::new(FixedKeys))
            .build()
            .unwrap();

        let first = persister.new_id("k-").unwrap();
        assert_eq!(first.key(), "k-fixed");
        persister.update(&Arc::new(Account::new(first, 0))).unwrap();

        let err = persister.new_id("k-").unwrap_err();
        assert!(matches!(err, Error::IdDuplicate { attempts: 3 }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_kind_mismatch_is_invariant_violation() {
        let driver = Arc::new(MemoryDriver::new());
        let persister = persister(&driver, &config("a", false));
        let other = Identity::new("order", "1").unwrap();
        assert!(matches!(persister.get(&other), Err(Error::Invariant(_))));

        let stray = Account::new(other, 0);
        assert!(matches!(persister.flush(&stray), Err(Error::Invariant(_))));
    }

    #[test]
    fn test_foreign_instance_rejected() {
        let driver = Arc::new(MemoryDriver::new());
        let persister = persister(&driver, &config("a", false));
        persister.update(&Arc::new(Account::new(id("1"), 0))).unwrap();
        let impostor = Arc::new(Account::new(id("1"), 0));
        assert!(matches!(persister.update(&impostor), Err(Error::Invariant(_))));
    }

    #[test]
    fn test_listeners_and_external_changes() {
        let driver = Arc::new(MemoryDriver::new());
        let node_a = persister(&driver, &config("a", false));
        let node_b = persister(&driver, &config("b", false));

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        node_b
            .add_listener(
                move |kind: ChangeKind, id: &Identity, value: &dyn Fn() -> Option<Arc<Account>>| {
                    sink.lock().push((kind, id.clone(), value().map(|a| a.balance())));
                },
            )
            .unwrap();

        let original = Arc::new(Account::new(id("1"), 1));
        node_a.update(&original).unwrap();
        let live_on_b = node_b.get(&id("1")).unwrap().unwrap();

        *original.balance.lock() = 2;
        node_a.update(&original).unwrap();

        // b absorbed the external update into its live instance
        assert_eq!(live_on_b.balance(), 2);
        assert!(Arc::ptr_eq(&node_b.get(&id("1")).unwrap().unwrap(), &live_on_b));

        node_a.remove(&id("1")).unwrap();
        assert!(live_on_b.deleted.load(AtomicOrdering::SeqCst));

        let events = events.lock();
        let kinds: Vec<ChangeKind> = events.iter().map(|(kind, _, _)| *kind).collect();
        assert_eq!(kinds, vec![ChangeKind::New, ChangeKind::Update, ChangeKind::Delete]);
        assert_eq!(events[1].2, Some(2));
    }

    #[test]
    fn test_own_writes_notify_once() {
        let driver = Arc::new(MemoryDriver::new());
        let persister = persister(&driver, &config("a", false));
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        persister
            .add_listener(
                move |kind: ChangeKind, _: &Identity, _: &dyn Fn() -> Option<Arc<Account>>| {
                    sink.lock().push(kind);
                },
            )
            .unwrap();

        let account = Arc::new(Account::new(id("1"), 0));
        persister.update(&account).unwrap();
        persister.update(&account).unwrap();
        persister.remove(&id("1")).unwrap();
        assert_eq!(
            *events.lock(),
            vec![ChangeKind::New, ChangeKind::Update, ChangeKind::Delete]
        );
    }

    #[test]
    fn test_find_goes_through_cache() {
        let driver = Arc::new(MemoryDriver::new());
        let persister = persister(&driver, &config("a", false));
        let kept = Arc::new(Account::new(id("a1"), 1));
        persister.update(&kept).unwrap();
        persister.update(&Arc::new(Account::new(id("a2"), 2))).unwrap();
        persister.update(&Arc::new(Account::new(id("b1"), 3))).unwrap();

        let found = persister.find(&Query::prefix("acct", "a")).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().any(|a| Arc::ptr_eq(a, &kept)));

        let err = persister.find_ids(&Query::all("order")).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_evict_idle() {
        let driver = Arc::new(MemoryDriver::new());
        let mut cfg = config("a", false);
        cfg.cache = CacheConfig {
            capacity: 100,
            idle_timeout_ms: 10,
        };
        let persister = persister(&driver, &cfg);
        persister.update(&Arc::new(Account::new(id("1"), 0))).unwrap();

        thread::sleep(Duration::from_millis(30));
        assert_eq!(persister.evict_idle(), 1);
        assert!(persister.get(&id("1")).unwrap().is_some());
    }

    #[test]
    fn test_update_after_capacity_eviction_is_rejected() {
        let driver = Arc::new(MemoryDriver::new());
        let mut cfg = config("a", false);
        cfg.cache.capacity = 1;
        let persister = persister(&driver, &cfg);

        let first = Arc::new(Account::new(id("a"), 1));
        persister.update(&first).unwrap();
        persister.update(&Arc::new(Account::new(id("b"), 1))).unwrap();
        assert!(first.deleted.load(AtomicOrdering::SeqCst));

        *first.balance.lock() = 2;
        assert!(matches!(persister.update(&first), Err(Error::Invariant(_))));
        let stored = driver.record(&id("a")).unwrap();
        assert_eq!(stored.get("balance"), Some(&serde_json::json!(1)));

        // Getting it again gives a writable instance
        let reloaded = persister.get(&id("a")).unwrap().unwrap();
        *reloaded.balance.lock() = 2;
        persister.update(&reloaded).unwrap();
        let stored = driver.record(&id("a")).unwrap();
        assert_eq!(stored.get("balance"), Some(&serde_json::json!(2)));
        assert_eq!(stored.version().to_string(), "a+1;a+2");
    }

    #[test]
    fn test_random_updates_land_last_value() {
        use rand::Rng;

        let driver = Arc::new(MemoryDriver::new());
        let persister = persister(&driver, &config("a", true));
        let accounts: Vec<Arc<Account>> = (0..8)
            .map(|n| Arc::new(Account::new(id(&format!("r{n}")), 0)))
            .collect();
        for account in &accounts {
            persister.update(account).unwrap();
        }

        let mut rng = rand::thread_rng();
        let mut expected = vec![0i64; accounts.len()];
        for _ in 0..500 {
            let n = rng.gen_range(0..accounts.len());
            let amount = rng.gen_range(-1000..1000);
            *accounts[n].balance.lock() = amount;
            expected[n] = amount;
            persister.update(&accounts[n]).unwrap();
            if rng.gen_bool(0.05) {
                persister.flush_all();
            }
        }
        persister.flush_all();

        for (account, amount) in accounts.iter().zip(&expected) {
            assert!(!persister.is_dirty(account));
            let stored = driver.record(&account.identity()).unwrap();
            assert_eq!(stored.get("balance"), Some(&serde_json::json!(*amount)));
        }
    }

    #[test]
    fn test_close_drains_queue() {
        let driver = Arc::new(MemoryDriver::new());
        let persister = persister(&driver, &config("a", true));
        let account = Arc::new(Account::new(id("1"), 0));
        persister.update(&account).unwrap();
        *account.balance.lock() = 4;
        persister.update(&account).unwrap();

        persister.close();
        assert!(!persister.is_dirty(&account));
        assert_eq!(
            driver.record(&id("1")).unwrap().get("balance"),
            Some(&serde_json::json!(4))
        );
    }
}
