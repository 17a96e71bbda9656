//! Backend-agnostic records
//!
//! A record is the field map a mapper produces from an object. Besides the
//! object's own fields every stored record carries four reserved attributes
//! stamped by the persister. Reserved names share the `__` prefix and cannot
//! be set through the field API.

use chrono::{DateTime, SecondsFormat, Utc};
use persistio_common::{Error, Identity, Result};
use persistio_version::VersionLineage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Prefix shared by all reserved attribute names
pub const RESERVED_PREFIX: &str = "__";

pub const FIELD_ID: &str = "__id";
pub const FIELD_VERSION: &str = "__version";
pub const FIELD_MODIFIED: &str = "__modified";
pub const FIELD_OWNER: &str = "__owner";

/// Field map of one stored object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_reserved(name: &str) -> bool {
        name.starts_with(RESERVED_PREFIX)
    }

    /// Set a user field
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let name = name.into();
        if Self::is_reserved(&name) {
            return Err(Error::invalid_argument(format!(
                "field name {name:?} uses the reserved prefix"
            )));
        }
        self.fields.insert(name, value.into());
        Ok(())
    }

    /// Builder form of [`Record::set`]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Result<Self> {
        self.set(name, value)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    /// User fields, reserved attributes excluded
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields
            .iter()
            .filter(|(name, _)| !Self::is_reserved(name))
            .map(|(name, value)| (name.as_str(), value))
    }

    /// Write the reserved attributes
    pub fn stamp(
        &mut self,
        id: &Identity,
        version: &VersionLineage,
        modified: DateTime<Utc>,
        owner: Option<&str>,
    ) {
        self.fields.insert(FIELD_ID.into(), Value::String(id.to_string()));
        self.fields
            .insert(FIELD_VERSION.into(), Value::String(version.to_string()));
        self.fields.insert(
            FIELD_MODIFIED.into(),
            Value::String(modified.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        match owner {
            Some(owner) => {
                self.fields
                    .insert(FIELD_OWNER.into(), Value::String(owner.to_string()));
            }
            None => {
                self.fields.remove(FIELD_OWNER);
            }
        }
    }

    pub fn id(&self) -> Option<Identity> {
        self.reserved_str(FIELD_ID)?.parse().ok()
    }

    /// Stored lineage; empty when the record was never stamped
    pub fn version(&self) -> VersionLineage {
        self.reserved_str(FIELD_VERSION)
            .map(VersionLineage::parse)
            .unwrap_or_default()
    }

    pub fn modified(&self) -> Option<DateTime<Utc>> {
        let text = self.reserved_str(FIELD_MODIFIED)?;
        DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    pub fn owner(&self) -> Option<&str> {
        self.reserved_str(FIELD_OWNER)
    }

    fn reserved_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }

    /// Build a record from a JSON object of user fields
    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(Error::serialization("record must be a JSON object"));
        };
        let mut record = Self::new();
        for (name, value) in map {
            record.set(name, value)?;
        }
        Ok(record)
    }

    /// User fields as a JSON object
    #[must_use]
    pub fn into_json(self) -> Value {
        let map: Map<String, Value> = self
            .fields
            .into_iter()
            .filter(|(name, _)| !Self::is_reserved(name))
            .collect();
        Value::Object(map)
    }
}
