//! Storage driver contract
//!
//! A driver stores records keyed by identity and enforces optimistic
//! concurrency: `save` only succeeds when the stored lineage is the one the
//! caller based its change on.

use crate::query::Query;
use crate::record::Record;
use persistio_common::{ChangeKind, Error, Identity, Result};
use persistio_version::VersionLineage;
use std::sync::Arc;

/// A record as read from the backend
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedRecord {
    pub record: Record,
    pub version: VersionLineage,
    pub owner: Option<String>,
}

impl LoadedRecord {
    /// Split the reserved attributes out of a stamped record
    #[must_use]
    pub fn from_stamped(record: Record) -> Self {
        let version = record.version();
        let owner = record.owner().map(str::to_string);
        Self {
            record,
            version,
            owner,
        }
    }
}

/// Backend a persister reads and writes through
///
/// Implementations are called from application threads and from the
/// flusher's worker thread.
pub trait StorageDriver: Send + Sync {
    /// Read a record, `None` when absent
    fn load(&self, id: &Identity) -> Result<Option<LoadedRecord>>;

    /// Replace a record whose stored lineage is `previous`
    ///
    /// The record arrives stamped with the proposed lineage. Returns the
    /// lineage actually stored. A stored lineage other than `previous`
    /// fails with [`Error::VersionConflict`].
    fn save(&self, id: &Identity, record: Record, previous: &VersionLineage) -> Result<VersionLineage>;

    /// Store a record for an identity that must not exist yet
    fn create_new(&self, id: &Identity, record: Record) -> Result<VersionLineage>;

    /// Delete a record; `false` when there was none
    fn delete(&self, id: &Identity) -> Result<bool>;

    fn exists(&self, id: &Identity) -> Result<bool> {
        Ok(self.load(id)?.is_some())
    }

    /// Identities matching a query
    fn find_ids(&self, query: &Query) -> Result<Vec<Identity>> {
        let _ = query;
        Err(Error::not_supported("identity search"))
    }
}

/// Callback receiving changes made by other writers
pub type ChangeSink = Arc<dyn Fn(ChangeKind, &Identity) + Send + Sync>;

/// Optional feed of backend changes
pub trait ChangeWatch: Send + Sync {
    /// Start delivering changes to records of `kind`
    fn start(&self, kind: &str, sink: ChangeSink) -> Result<()>;
}
