//! persistio Version - Version tags and write lineages
//!
//! Every stored record carries a lineage of the writes that produced it.
//! Comparing lineages tells whether one revision descends from another or
//! whether two writers diverged.

pub mod lineage;
pub mod tag;

pub use lineage::{Comparison, DEFAULT_MAX_SAME_NODE_RUN, TAG_SEPARATOR, VersionLineage};
pub use tag::VersionTag;
