//! persistio Core - Object persistence on top of a storage driver
//!
//! This crate provides:
//! - The storage driver contract and an in-memory driver
//! - Records, queries and object mappers
//! - The persister: cache-through reads, write-through or write-behind
//!   writes and change fan-out to listeners

pub mod driver;
pub mod id;
pub mod listener;
pub mod mapper;
pub mod memory;
pub mod persistent;
pub mod persister;
pub mod query;
pub mod record;

pub use driver::{ChangeSink, ChangeWatch, LoadedRecord, StorageDriver};
pub use id::{KeyGenerator, UuidKeys};
pub use listener::{ChangeListener, ListenerId, Listeners};
pub use mapper::{JsonMapper, ObjectMapper};
pub use memory::MemoryDriver;
pub use persistent::Persistent;
pub use persister::{Persister, PersisterBuilder};
pub use query::{Filter, Query};
pub use record::{FIELD_ID, FIELD_MODIFIED, FIELD_OWNER, FIELD_VERSION, RESERVED_PREFIX, Record};
