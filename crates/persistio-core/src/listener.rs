//! Change listeners

use parking_lot::RwLock;
use persistio_common::{ChangeKind, Identity};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives changes to objects of one kind
///
/// `value` resolves the affected object lazily; it yields `None` when the
/// object is gone or not cached.
pub trait ChangeListener<E>: Send + Sync {
    fn on_change(&self, kind: ChangeKind, id: &Identity, value: &dyn Fn() -> Option<Arc<E>>);
}

impl<E, F> ChangeListener<E> for F
where
    F: Fn(ChangeKind, &Identity, &dyn Fn() -> Option<Arc<E>>) + Send + Sync,
{
    fn on_change(&self, kind: ChangeKind, id: &Identity, value: &dyn Fn() -> Option<Arc<E>>) {
        self(kind, id, value);
    }
}

/// Handle returned when registering a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registered listeners in registration order
pub struct Listeners<E> {
    entries: RwLock<Vec<(ListenerId, Arc<dyn ChangeListener<E>>)>>,
    next_id: AtomicU64,
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<E> Listeners<E> {
    pub fn add(&self, listener: Arc<dyn ChangeListener<E>>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Deliver a change to every listener
    pub fn fan_out(&self, kind: ChangeKind, id: &Identity, value: &dyn Fn() -> Option<Arc<E>>) {
        // Listeners may register or remove listeners
        let snapshot: Vec<Arc<dyn ChangeListener<E>>> =
            self.entries.read().iter().map(|(_, l)| Arc::clone(l)).collect();
        for listener in snapshot {
            listener.on_change(kind, id, value);
        }
    }
}
