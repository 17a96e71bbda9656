//! Keyed FIFO queue used by the flusher
//!
//! Each key appears at most once. Pushing an existing key replaces its
//! payload but keeps its position and its enqueue time, so coalesced tasks
//! are not starved by repeated marks.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::Instant;

struct Slot<V> {
    value: V,
    since: Instant,
}

/// FIFO queue deduplicated by key
pub struct KeyedQueue<K, V> {
    order: VecDeque<K>,
    slots: HashMap<K, Slot<V>>,
}

impl<K: Clone + Eq + Hash, V> Default for KeyedQueue<K, V> {
    fn default() -> Self {
        Self {
            order: VecDeque::new(),
            slots: HashMap::new(),
        }
    }
}

impl<K: Clone + Eq + Hash, V> KeyedQueue<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `value` under `key`; returns `false` if it replaced a queued value
    pub fn push(&mut self, key: K, value: V) -> bool {
        if let Some(slot) = self.slots.get_mut(&key) {
            slot.value = value;
            return false;
        }
        self.order.push_back(key.clone());
        self.slots.insert(
            key,
            Slot {
                value,
                since: Instant::now(),
            },
        );
        true
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.slots.remove(key)?;
        self.order.retain(|k| k != key);
        Some(slot.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Enqueue time of the oldest entry
    pub fn oldest(&self) -> Option<Instant> {
        self.order
            .front()
            .and_then(|key| self.slots.get(key))
            .map(|slot| slot.since)
    }

    /// Detach every entry in FIFO order, leaving the queue empty
    pub fn take_all(&mut self) -> Vec<(K, V)> {
        let order = std::mem::take(&mut self.order);
        let mut slots = std::mem::take(&mut self.slots);
        order
            .into_iter()
            .filter_map(|key| slots.remove(&key).map(|slot| (key, slot.value)))
            .collect()
    }
}
