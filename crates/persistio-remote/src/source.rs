//! Remote sources of truth and the offline fallback cache

use dashmap::DashMap;
use parking_lot::RwLock;
use persistio_common::{Error, Identity, Result};
use persistio_version::{Comparison, VersionLineage};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// A value object as served by a remote source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteValue<V> {
    pub value: V,
    pub version: VersionLineage,
    pub owner: Option<String>,
}

impl<V> RemoteValue<V> {
    pub const fn new(value: V, version: VersionLineage) -> Self {
        Self {
            value,
            version,
            owner: None,
        }
    }

    #[must_use]
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

/// Where a proxied value really lives
pub trait RemoteSource<V>: Send + Sync {
    /// Fetch the current value, `None` when the remote has no such object
    fn load(&self, id: &Identity) -> Result<Option<RemoteValue<V>>>;

    /// Write a value whose remote lineage is `previous`, proposing `next`
    ///
    /// Returns the lineage actually stored.
    fn store(
        &self,
        id: &Identity,
        value: &V,
        previous: &VersionLineage,
        next: &VersionLineage,
    ) -> Result<VersionLineage> {
        let _ = (id, value, previous, next);
        Err(Error::not_supported("remote writes"))
    }
}

/// Local copy consulted when the remote cannot be reached
pub trait OfflineCache<V>: Send + Sync {
    fn get(&self, id: &Identity) -> Result<Option<RemoteValue<V>>>;

    /// Store a value; returns the lineage it replaced
    fn update(&self, id: &Identity, value: &RemoteValue<V>) -> Result<Option<VersionLineage>>;

    fn remove_all(&self) -> Result<()>;
}

/// Remote source held in process memory
pub struct MemorySource<V> {
    values: RwLock<HashMap<Identity, RemoteValue<V>>>,
    failures: AtomicU32,
    loads: AtomicU64,
}

impl<V> Default for MemorySource<V> {
    fn default() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            failures: AtomicU32::new(0),
            loads: AtomicU64::new(0),
        }
    }
}

impl<V: Clone> MemorySource<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value as another writer would
    pub fn put(&self, id: Identity, value: RemoteValue<V>) {
        self.values.write().insert(id, value);
    }

    pub fn remove(&self, id: &Identity) -> Option<RemoteValue<V>> {
        self.values.write().remove(id)
    }

    pub fn current(&self, id: &Identity) -> Option<RemoteValue<V>> {
        self.values.read().get(id).cloned()
    }

    /// Make the next `count` calls fail as if the remote were down
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of load calls, failed ones included
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }

    fn check_failure(&self) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::backend("remote unreachable"));
        }
        Ok(())
    }
}

impl<V: Clone + Send + Sync> RemoteSource<V> for MemorySource<V> {
    fn load(&self, id: &Identity) -> Result<Option<RemoteValue<V>>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.check_failure()?;
        Ok(self.current(id))
    }

    fn store(
        &self,
        id: &Identity,
        value: &V,
        previous: &VersionLineage,
        next: &VersionLineage,
    ) -> Result<VersionLineage> {
        self.check_failure()?;
        let mut values = self.values.write();
        let current = values
            .get(id)
            .map(|stored| stored.version.clone())
            .unwrap_or_default();
        if current.compare(previous) != Comparison::Same {
            debug!("Rejected remote write of {}: stored {} vs based on {}", id, current, previous);
            return Err(Error::VersionConflict {
                id: id.to_string(),
                expected: previous.to_string(),
                actual: current.to_string(),
            });
        }
        let owner = values.get(id).and_then(|stored| stored.owner.clone());
        values.insert(
            id.clone(),
            RemoteValue {
                value: value.clone(),
                version: next.clone(),
                owner,
            },
        );
        Ok(next.clone())
    }
}

/// Offline cache held in process memory
pub struct MemoryOfflineCache<V> {
    values: DashMap<Identity, RemoteValue<V>>,
}

impl<V> Default for MemoryOfflineCache<V> {
    fn default() -> Self {
        Self {
            values: DashMap::new(),
        }
    }
}

impl<V> MemoryOfflineCache<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl<V: Clone + Send + Sync> OfflineCache<V> for MemoryOfflineCache<V> {
    fn get(&self, id: &Identity) -> Result<Option<RemoteValue<V>>> {
        Ok(self.values.get(id).map(|entry| entry.value().clone()))
    }

    fn update(&self, id: &Identity, value: &RemoteValue<V>) -> Result<Option<VersionLineage>> {
        Ok(self
            .values
            .insert(id.clone(), value.clone())
            .map(|replaced| replaced.version))
    }

    fn remove_all(&self) -> Result<()> {
        self.values.clear();
        Ok(())
    }
}
