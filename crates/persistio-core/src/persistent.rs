//! Lifecycle hooks of persistent objects

use persistio_common::Identity;
use persistio_version::VersionLineage;

/// An object managed by a persister
///
/// Objects are shared as `Arc<Self>` and mutated through interior
/// mutability. Every hook defaults to a no-op.
pub trait Persistent: Send + Sync + 'static {
    /// Identity the object is stored under
    fn identity(&self) -> Identity;

    /// Called before the object is encoded for a write
    fn before_persist(&self) {}

    /// Called after a write with the lineage now stored
    fn after_persist(&self, version: &VersionLineage) {
        let _ = version;
    }

    /// Called on a freshly loaded object before it is cached
    fn after_load(&self, id: &Identity, version: &VersionLineage, owner: Option<&str>) {
        let _ = (id, version, owner);
    }

    /// Offered a newer copy loaded after an external change
    ///
    /// Returning `true` means this instance absorbed `other` and stays the
    /// live instance; `false` lets `other` replace it.
    fn on_reload_accepted(&self, other: &Self) -> bool
    where
        Self: Sized,
    {
        let _ = other;
        false
    }

    /// Called when the instance leaves the cache while still referenced
    fn mark_deleted(&self) {}
}
