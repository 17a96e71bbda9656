//! persistio Common - Shared types and utilities
//!
//! This crate provides the identity type, error definitions, configuration
//! and clocks used across all persistio components.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CacheConfig, Config, FlusherConfig, LoaderMode, NodeConfig, PersisterConfig, ProxyConfig,
    VersionConfig,
};
pub use error::{Error, Result};
pub use types::{ChangeKind, Identity, IdentityError};
