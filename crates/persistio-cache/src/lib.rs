//! persistio Cache - Object cache and background write queues
//!
//! This crate provides:
//! - The identity-keyed persistence cache with dirty tracking
//! - The write-behind flusher with coalescing and a retry lane
//! - The delay-loader used for background reloads

pub mod cache;
pub mod flusher;
pub mod loader;
pub mod queue;

pub use cache::{CacheStats, DirtyState, MarkOutcome, PersistenceCache, Refresh};
pub use flusher::{FlushTask, Flusher, FlusherOptions, FlusherStats};
pub use loader::{DelayLoader, ReloadTask};
pub use queue::KeyedQueue;
