//! Write lineages
//!
//! A lineage is the ordered history of tags that led to the current revision
//! of a record, oldest first. Two lineages are compared to tell whether one
//! revision descends from the other or whether they diverged.
//!
//! Long runs of writes from a single node are collapsed: once the trailing
//! run from a node reaches the cap, the next write by that node replaces the
//! last tag instead of growing the lineage.

use crate::tag::VersionTag;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Separator between tags in the text form
pub const TAG_SEPARATOR: char = ';';

/// Default cap on consecutive tags from one node
pub const DEFAULT_MAX_SAME_NODE_RUN: usize = 5;

/// Result of comparing one lineage against another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Comparison {
    #[display("same")]
    Same,
    /// The left side descends from the right side
    #[display("higher")]
    Higher,
    /// The right side descends from the left side
    #[display("lower")]
    Lower,
    /// Neither side descends from the other
    #[display("conflict")]
    Conflict,
}

impl Comparison {
    /// The same relation seen from the other side
    #[must_use]
    pub const fn reverse(self) -> Self {
        match self {
            Self::Higher => Self::Lower,
            Self::Lower => Self::Higher,
            other => other,
        }
    }

    const fn from_magnitudes(ord: Ordering) -> Self {
        match ord {
            Ordering::Greater => Self::Higher,
            Ordering::Less => Self::Lower,
            Ordering::Equal => Self::Same,
        }
    }
}

/// Ordered history of version tags, oldest first
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct VersionLineage {
    tags: Vec<VersionTag>,
}

impl VersionLineage {
    /// The empty lineage of a record that was never written
    #[must_use]
    pub const fn new() -> Self {
        Self { tags: Vec::new() }
    }

    /// Parse the `;`-joined text form
    ///
    /// Malformed segments parse to the unversioned sentinel and carry no
    /// history, so they are dropped.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let tags = text
            .split(TAG_SEPARATOR)
            .map(VersionTag::parse)
            .filter(|tag| !tag.is_unversioned())
            .collect();
        Self { tags }
    }

    #[must_use]
    pub fn tags(&self) -> &[VersionTag] {
        &self.tags
    }

    /// Current revision, `None` when never written
    #[must_use]
    pub fn last(&self) -> Option<&VersionTag> {
        self.tags.last()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Whether the current revision is a tombstone
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.last().is_some_and(VersionTag::is_delete)
    }

    /// The tag `node` would write next
    #[must_use]
    pub fn next_tag(&self, node: &str, is_delete: bool) -> VersionTag {
        self.last()
            .map_or_else(VersionTag::unversioned, Clone::clone)
            .next(node, is_delete)
    }

    /// Lineage after `node` writes on top of this one
    ///
    /// `max_run` bounds the trailing run of tags from `node`; values below 1
    /// are treated as 1.
    #[must_use]
    pub fn append(&self, node: &str, is_delete: bool, max_run: usize) -> Self {
        let next = self.next_tag(node, is_delete);
        let mut tags = self.tags.clone();
        if self.trailing_run(node) >= max_run.max(1) {
            if let Some(last) = tags.last_mut() {
                *last = next;
            }
        } else {
            tags.push(next);
        }
        Self { tags }
    }

    /// Number of tags at the end written by `node`
    #[must_use]
    pub fn trailing_run(&self, node: &str) -> usize {
        self.tags
            .iter()
            .rev()
            .take_while(|tag| tag.node() == node)
            .count()
    }

    /// Where `self` stands relative to `other`
    #[must_use]
    pub fn compare(&self, other: &Self) -> Comparison {
        let (Some(mine), Some(theirs)) = (self.last(), other.last()) else {
            return match (self.is_empty(), other.is_empty()) {
                (true, true) => Comparison::Same,
                (true, false) => Comparison::Lower,
                _ => Comparison::Higher,
            };
        };

        if mine == theirs {
            return Comparison::Same;
        }

        let by_magnitude = mine.magnitude().cmp(&theirs.magnitude());

        if self.len() == 1 || other.len() == 1 {
            return match (by_magnitude, mine.node() == theirs.node()) {
                (Ordering::Equal, false) => Comparison::Conflict,
                (ord, _) => Comparison::from_magnitudes(ord),
            };
        }

        match by_magnitude {
            Ordering::Greater => {
                if descends_from(&self.tags, theirs) {
                    Comparison::Higher
                } else {
                    Comparison::Conflict
                }
            }
            Ordering::Less => {
                if descends_from(&other.tags, mine) {
                    Comparison::Lower
                } else {
                    Comparison::Conflict
                }
            }
            Ordering::Equal => {
                let before_mine = &self.tags[self.len() - 2];
                let before_theirs = &other.tags[other.len() - 2];
                if mine.node() == theirs.node() && before_mine == before_theirs {
                    Comparison::Same
                } else {
                    Comparison::Conflict
                }
            }
        }
    }
}

/// Whether `chain`, whose last magnitude is above `target`'s, contains
/// `target` in its history
fn descends_from(chain: &[VersionTag], target: &VersionTag) -> bool {
    let mut newer: Option<&VersionTag> = None;
    for tag in chain.iter().rev() {
        match tag.magnitude().cmp(&target.magnitude()) {
            Ordering::Greater => newer = Some(tag),
            Ordering::Equal => return tag.node() == target.node(),
            // The target sat in a same-node run that was collapsed
            Ordering::Less => break,
        }
    }
    newer.is_some_and(|tag| tag.node() == target.node())
}

impl fmt::Display for VersionLineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tag) in self.tags.iter().enumerate() {
            if i > 0 {
                write!(f, "{TAG_SEPARATOR}")?;
            }
            write!(f, "{tag}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for VersionLineage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VersionLineage({self})")
    }
}

impl FromStr for VersionLineage {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<String> for VersionLineage {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<VersionLineage> for String {
    fn from(lineage: VersionLineage) -> Self {
        lineage.to_string()
    }
}

impl From<VersionTag> for VersionLineage {
    fn from(tag: VersionTag) -> Self {
        if tag.is_unversioned() {
            return Self::new();
        }
        Self { tags: vec![tag] }
    }
}
