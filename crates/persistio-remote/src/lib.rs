//! persistio Remote - Cache-aside proxies for remote value objects
//!
//! This crate provides:
//! - The expiry policy and freshness stamps
//! - The remote source and offline cache contracts with in-memory versions
//! - The per-object proxy and the registry handing out one proxy per identity

pub mod expiry;
pub mod proxy;
pub mod registry;
pub mod source;

pub use expiry::{ExpiryPolicy, Freshness, Stamp};
pub use proxy::{ProxyStats, RemoteProxy, RemoteProxyBuilder};
pub use registry::ProxyRegistry;
pub use source::{MemoryOfflineCache, MemorySource, OfflineCache, RemoteSource, RemoteValue};
