//! Core type definitions for persistio
//!
//! This module defines the identity every persistable entity carries and the
//! change kinds fanned out to listeners.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Separator between the type tag and the local key
pub const KIND_SEPARATOR: char = ':';

/// Separator between the local key and the owning node
pub const OWNER_SEPARATOR: char = '@';

/// Globally unique, immutable identifier of a persistable entity
///
/// Made of a type tag (`kind`), a local key and an optional owning-node
/// marker. The text form is `kind:key` or `kind:key@owner`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Identity {
    kind: String,
    key: String,
    owner: Option<String>,
}

impl Identity {
    /// Create a new identity without an owning node
    pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Result<Self, IdentityError> {
        let kind = kind.into();
        let key = key.into();
        Self::validate_kind(&kind)?;
        Self::validate_key(&key)?;
        Ok(Self {
            kind,
            key,
            owner: None,
        })
    }

    /// Create without validation (internal use only)
    #[must_use]
    pub fn new_unchecked(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
            owner: None,
        }
    }

    /// Return a copy of this identity owned by `owner`
    pub fn with_owner(mut self, owner: impl Into<String>) -> Result<Self, IdentityError> {
        let owner = owner.into();
        if owner.is_empty() {
            return Err(IdentityError::EmptyOwner);
        }
        if owner.contains(OWNER_SEPARATOR) {
            return Err(IdentityError::InvalidChar(OWNER_SEPARATOR));
        }
        self.owner = Some(owner);
        Ok(self)
    }

    /// Type tag
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Local key within the type
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Owning node marker, if any
    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// An identity without an owner marker belongs to every node
    #[must_use]
    pub fn is_owned_by(&self, node: &str) -> bool {
        self.owner.as_deref().is_none_or(|owner| owner == node)
    }

    fn validate_kind(kind: &str) -> Result<(), IdentityError> {
        if kind.is_empty() {
            return Err(IdentityError::EmptyKind);
        }
        if kind.contains(KIND_SEPARATOR) {
            return Err(IdentityError::InvalidChar(KIND_SEPARATOR));
        }
        Ok(())
    }

    fn validate_key(key: &str) -> Result<(), IdentityError> {
        if key.is_empty() {
            return Err(IdentityError::EmptyKey);
        }
        if key.contains(OWNER_SEPARATOR) {
            return Err(IdentityError::InvalidChar(OWNER_SEPARATOR));
        }
        Ok(())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({self})")
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.kind, KIND_SEPARATOR, self.key)?;
        if let Some(owner) = &self.owner {
            write!(f, "{OWNER_SEPARATOR}{owner}")?;
        }
        Ok(())
    }
}

impl FromStr for Identity {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s
            .split_once(KIND_SEPARATOR)
            .ok_or(IdentityError::MissingKind)?;
        match rest.split_once(OWNER_SEPARATOR) {
            Some((key, owner)) => Self::new(kind, key)?.with_owner(owner),
            None => Self::new(kind, rest),
        }
    }
}

impl TryFrom<String> for Identity {
    type Error = IdentityError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Identity> for String {
    fn from(id: Identity) -> Self {
        id.to_string()
    }
}

/// Errors that can occur when creating an identity
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("identity kind must not be empty")]
    EmptyKind,
    #[error("identity key must not be empty")]
    EmptyKey,
    #[error("identity owner must not be empty")]
    EmptyOwner,
    #[error("identity is missing the kind separator")]
    MissingKind,
    #[error("identity part contains reserved character {0:?}")]
    InvalidChar(char),
}

/// Kind of change reported to listeners
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum ChangeKind {
    #[display("new")]
    New,
    #[display("update")]
    Update,
    #[display("delete")]
    Delete,
    #[display("unknown")]
    Unknown,
}
