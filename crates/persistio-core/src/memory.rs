//! In-process storage driver
//!
//! Keeps stamped records in an ordered map and honors the full driver
//! contract, including compare-and-set on lineages and change delivery to
//! every registered watcher. Several persisters sharing one `MemoryDriver`
//! behave like nodes sharing one backend.

use crate::driver::{ChangeSink, ChangeWatch, LoadedRecord, StorageDriver};
use crate::query::Query;
use crate::record::Record;
use parking_lot::RwLock;
use persistio_common::{ChangeKind, Error, Identity, Result};
use persistio_version::{Comparison, VersionLineage};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// Storage driver backed by process memory
#[derive(Default)]
pub struct MemoryDriver {
    records: RwLock<BTreeMap<Identity, Record>>,
    watchers: RwLock<Vec<(String, ChangeSink)>>,
    /// Calls left to fail with an injected backend error
    failures: AtomicU32,
    writes: AtomicU64,
}

impl MemoryDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` calls fail with a backend error
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Number of successful saves, creates and deletes
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Raw stored record, reserved attributes included
    pub fn record(&self, id: &Identity) -> Option<Record> {
        self.records.read().get(id).cloned()
    }

    fn check_failure(&self) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(Error::backend("injected failure"));
        }
        Ok(())
    }

    fn notify(&self, kind: ChangeKind, id: &Identity) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let sinks: Vec<ChangeSink> = self
            .watchers
            .read()
            .iter()
            .filter(|(watched, _)| watched == id.kind())
            .map(|(_, sink)| sink.clone())
            .collect();
        for sink in sinks {
            sink(kind, id);
        }
    }
}

impl StorageDriver for MemoryDriver {
    fn load(&self, id: &Identity) -> Result<Option<LoadedRecord>> {
        self.check_failure()?;
        Ok(self
            .records
            .read()
            .get(id)
            .cloned()
            .map(LoadedRecord::from_stamped))
    }

    fn save(&self, id: &Identity, record: Record, previous: &VersionLineage) -> Result<VersionLineage> {
        self.check_failure()?;
        let version = record.version();
        {
            let mut records = self.records.write();
            let current = records.get(id).map(Record::version).unwrap_or_default();
            if current.compare(previous) != Comparison::Same {
                debug!("Rejected save of {}: stored {} vs based on {}", id, current, previous);
                return Err(Error::VersionConflict {
                    id: id.to_string(),
                    expected: previous.to_string(),
                    actual: current.to_string(),
                });
            }
            records.insert(id.clone(), record);
        }
        self.notify(ChangeKind::Update, id);
        Ok(version)
    }

    fn create_new(&self, id: &Identity, record: Record) -> Result<VersionLineage> {
        self.check_failure()?;
        let version = record.version();
        {
            let mut records = self.records.write();
            if let Some(existing) = records.get(id) {
                return Err(Error::VersionConflict {
                    id: id.to_string(),
                    expected: String::new(),
                    actual: existing.version().to_string(),
                });
            }
            records.insert(id.clone(), record);
        }
        self.notify(ChangeKind::New, id);
        Ok(version)
    }

    fn delete(&self, id: &Identity) -> Result<bool> {
        self.check_failure()?;
        let removed = self.records.write().remove(id).is_some();
        if removed {
            self.notify(ChangeKind::Delete, id);
        }
        Ok(removed)
    }

    fn exists(&self, id: &Identity) -> Result<bool> {
        self.check_failure()?;
        Ok(self.records.read().contains_key(id))
    }

    fn find_ids(&self, query: &Query) -> Result<Vec<Identity>> {
        self.check_failure()?;
        query.validate()?;
        let records = self.records.read();
        let matches = records
            .iter()
            .filter(|(id, record)| query.matches(id, record))
            .map(|(id, _)| id.clone());
        Ok(match query.limit() {
            Some(limit) => matches.take(limit).collect(),
            None => matches.collect(),
        })
    }
}

impl ChangeWatch for MemoryDriver {
    fn start(&self, kind: &str, sink: ChangeSink) -> Result<()> {
        self.watchers.write().push((kind.to_string(), sink));
        Ok(())
    }
}
